//! 文件解码
//!
//! - `decoder`: symphonia 封装，输出左对齐 i32
//! - `source`: 后台解码线程 + 环形缓冲区，作为混音器的源

pub mod decoder;
pub mod source;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError};
pub use source::{DecoderControl, DecoderSource};
