//! 元素图
//!
//! 一个 pass 中，缓冲区依次经过流水线上的各个阶段（Stage）。
//! 混音器从若干个源（Source）拉取数据并转换成统一的输出格式。
//!
//! - `Source`: 按需产生样本的上游
//! - `Stage`: 原地处理缓冲区的流水线阶段
//! - `Power`: 可跨线程共享的开关

pub mod equalizer;
pub mod gain;
pub mod meter;
pub mod mixer;
pub mod pipeline;
pub mod source;
pub mod spectrum;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::audio::buffer::{BufferError, SampleBuffer};
use crate::audio::format::Format;

pub use equalizer::{Band, Equalizer, EqualizerError, FilterKind};
pub use gain::Gain;
pub use meter::{LevelHandle, LevelMeter};
pub use mixer::{Mixer, MixerError};
pub use pipeline::{CostReport, Pipeline, PipelineError};
pub use source::{PcmSource, ToneSource};
pub use spectrum::{Spectrum, SpectrumHandle};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("source failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Mixer(#[from] MixerError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("stage configured for {expected}, buffer carries {actual}")]
    FormatMismatch { expected: Format, actual: Format },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("{0}")]
    Other(String),
}

/// 样本源
pub trait Source: Send {
    /// 向 `buffer` 写入最多 `buffer.requested_samples()` 个样本
    ///
    /// 写入格式为 `native_format()`，返回实际写入的样本数；
    /// 少于请求数只表示暂时没有更多数据，不代表结束。
    fn pull(&mut self, buffer: &mut SampleBuffer) -> Result<usize, SourceError>;

    fn native_format(&self) -> Format;

    /// 不会再产生数据（混音器据此把转换器里的残留送出）
    fn is_finished(&self) -> bool {
        false
    }
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn pull(&mut self, buffer: &mut SampleBuffer) -> Result<usize, SourceError> {
        (**self).pull(buffer)
    }

    fn native_format(&self) -> Format {
        (**self).native_format()
    }

    fn is_finished(&self) -> bool {
        (**self).is_finished()
    }
}

/// 流水线阶段
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError>;
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        (**self).process(buffer)
    }
}

/// 阶段开关
///
/// 克隆出的句柄共享同一个状态，控制线程可以随时切换，
/// 音频线程在每个 pass 读取。
#[derive(Debug, Clone)]
pub struct Power(Arc<AtomicBool>);

impl Power {
    pub fn new(on: bool) -> Self {
        Self(Arc::new(AtomicBool::new(on)))
    }

    pub fn on(&self) {
        self.set(true);
    }

    pub fn off(&self) {
        self.set(false);
    }

    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Power {
    fn default() -> Self {
        Self::new(true)
    }
}

/// 引擎流水线上的具体阶段
///
/// 电平表和频谱是分析抽头，不在流水线里，见 `Engine`。
pub enum Element {
    Mixer(Mixer),
    Gain(Gain),
    Equalizer(Equalizer),
    Custom(Box<dyn Stage>),
}

impl Stage for Element {
    fn name(&self) -> &str {
        match self {
            Element::Mixer(m) => m.name(),
            Element::Gain(g) => g.name(),
            Element::Equalizer(e) => e.name(),
            Element::Custom(s) => s.name(),
        }
    }

    fn is_enabled(&self) -> bool {
        match self {
            Element::Mixer(m) => m.is_enabled(),
            Element::Gain(g) => g.is_enabled(),
            Element::Equalizer(e) => e.is_enabled(),
            Element::Custom(s) => s.is_enabled(),
        }
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        match self {
            Element::Mixer(m) => m.process(buffer),
            Element::Gain(g) => g.process(buffer),
            Element::Equalizer(e) => e.process(buffer),
            Element::Custom(s) => s.process(buffer),
        }
    }
}

impl From<Mixer> for Element {
    fn from(m: Mixer) -> Self {
        Element::Mixer(m)
    }
}

impl From<Gain> for Element {
    fn from(g: Gain) -> Self {
        Element::Gain(g)
    }
}

impl From<Equalizer> for Element {
    fn from(e: Equalizer) -> Self {
        Element::Equalizer(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_shared_between_clones() {
        let power = Power::default();
        let handle = power.clone();
        assert!(power.is_on());
        handle.off();
        assert!(!power.is_on());
        power.on();
        assert!(handle.is_on());
    }

    #[test]
    fn test_element_dispatch() {
        let e: Element = Gain::new(0.5).into();
        assert_eq!(e.name(), "Volume");
        assert!(e.is_enabled());

        let e: Element = Equalizer::new().into();
        assert_eq!(e.name(), "Equalizer");
        assert!(e.is_enabled());
    }
}
