mod codec;
pub mod gf256;
mod matrix;

pub use codec::{EncodedSlices, ErasureCodec, DEFAULT_ALIGNMENT};
pub use matrix::Matrix;
