//! Cast Engine Library
//!
//! Real-time audio element graph: sources are converted to a common format,
//! mixed, and run through a pipeline of in-place stages.

pub mod audio;
pub mod decode;
pub mod element;
pub mod engine;
pub mod resample;

pub use engine::{Engine, EngineConfig, EngineError};
