mod d3d11;

pub use d3d11::{D3D11Device, D3D11Texture};
