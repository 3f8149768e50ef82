use crate::backend::PictureType;
use bytes::Bytes;

/// Bitstream of one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Input index of the submission this packet was produced from.
    pub index: u64,
    pub data: Bytes,
    pub picture_type: PictureType,
    pub timestamp: u64,
}

impl EncodedPacket {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_keyframe(&self) -> bool {
        matches!(self.picture_type, PictureType::Idr | PictureType::I)
    }

    /// NAL units of an Annex-B bitstream, without their start codes.
    pub fn nal_units(&self) -> NalUnits {
        NalUnits {
            data: self.data.clone(),
            start: find_start_code(&self.data, 0).map(|(index, len)| index + len),
        }
    }
}

/// Iterator over the NAL units of an Annex-B bitstream.
pub struct NalUnits {
    data: Bytes,
    start: Option<usize>,
}

impl Iterator for NalUnits {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let start = self.start?;
        match find_start_code(&self.data, start) {
            Some((end, len)) => {
                self.start = Some(end + len);
                Some(self.data.slice(start..end))
            }
            None => {
                self.start = None;
                (start < self.data.len()).then(|| self.data.slice(start..))
            }
        }
    }
}

/// Returns the offset and length of the next 3 or 4 byte start code at or after `start`.
fn find_start_code(data: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut zero_count = 0;

    for (i, &b) in data.get(start..)?.iter().enumerate() {
        if b == 0 {
            zero_count += 1;
            continue;
        } else if b == 1 && zero_count >= 2 {
            let zeros = zero_count.min(3);
            return Some((start + i - zeros, zeros + 1));
        }
        zero_count = 0
    }
    None
}
