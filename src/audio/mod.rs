//! 音频核心模块
//!
//! 包含：
//! - Format: 采样率 / 样本表示 / 声道布局，以及格式合并
//! - Buffer: 平面样本缓冲区
//! - Ring Buffer: Lock-free 数据传递
//! - Timing: 单调时钟
//! - Stats: 渲染统计
//! - Output: 输出设备契约与 Renderer

pub mod buffer;
pub mod format;
pub mod output;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use buffer::{BufferConfig, BufferError, RawSample, SampleBuffer};
pub use format::{Channel, ChannelLayout, Format, FormatError, SampleBits, SampleRate};
pub use output::{deliver, ChannelDest, Render, Renderer};
pub use ring_buffer::RingBuffer;
pub use stats::{RenderStats, StatsReport};
