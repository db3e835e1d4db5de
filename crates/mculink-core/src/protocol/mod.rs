//! Protocol module - frame format, control keys and stream decoding.

pub mod constants;
pub mod decoder;
pub mod frame;
pub mod size;

pub use constants::*;
pub use decoder::FrameDecoder;
pub use frame::{Frame, FrameCodec, FrameError};
pub use size::{Endianness, decode_trans_size, encode_trans_size};
