//! The encode pipeline: a ring of resource slots driven by an [`EncodeSession`].

mod packet;
mod session;
mod slot;

pub use self::{
    packet::{EncodedPacket, NalUnits},
    session::{EncodeSession, SubmitStatus},
};
