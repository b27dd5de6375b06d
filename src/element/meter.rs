//! 电平表
//!
//! 每 10 帧取一个点（各声道平均），对这些点求 RMS 并钳位到 [0, 1]。
//! 结果以 f64 位模式存放在原子变量里，控制线程通过 `LevelHandle` 读取。
//! 默认关闭。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Power, Stage, StageError};
use crate::audio::buffer::SampleBuffer;

/// 抽样间隔（帧）
const STEP: usize = 10;

/// 电平读取句柄
#[derive(Debug, Clone)]
pub struct LevelHandle(Arc<AtomicU64>);

impl LevelHandle {
    pub fn level(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

pub struct LevelMeter {
    power: Power,
    level: Arc<AtomicU64>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            power: Power::new(false),
            level: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    pub fn handle(&self) -> LevelHandle {
        LevelHandle(Arc::clone(&self.level))
    }

    pub fn level(&self) -> f64 {
        f64::from_bits(self.level.load(Ordering::Relaxed))
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for LevelMeter {
    fn name(&self) -> &str {
        "LevelMeter"
    }

    fn is_enabled(&self) -> bool {
        self.power.is_on()
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        let frames = buffer.last_filled_samples();
        let channels = buffer.format().channels as usize;
        if frames == 0 || channels == 0 {
            self.level.store(0f64.to_bits(), Ordering::Relaxed);
            return Ok(());
        }

        let mut sum = 0.0;
        let mut points = 0usize;
        for i in (0..frames).step_by(STEP) {
            let mut acc = 0.0;
            for c in 0..channels {
                acc += buffer.sample_f64(c, i).unwrap_or(0.0);
            }
            let v = acc / channels as f64;
            sum += v * v;
            points += 1;
        }

        let rms = (sum / points as f64).sqrt().clamp(0.0, 1.0);
        self.level.store(rms.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BufferConfig;
    use crate::audio::format::{Format, SampleBits, SampleRate};

    fn filled(value: f64) -> SampleBuffer {
        let format = Format::new(SampleRate::R48000, SampleBits::F32, 2);
        let mut buf = SampleBuffer::new(format, &BufferConfig::default()).unwrap();
        buf.write_with(format, 480, |_, _| value).unwrap();
        buf
    }

    #[test]
    fn test_off_by_default() {
        let meter = LevelMeter::new();
        assert!(!meter.is_enabled());
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_constant_signal_level() {
        let mut meter = LevelMeter::new();
        let handle = meter.handle();
        meter.process(&mut filled(-0.5)).unwrap();
        assert_eq!(handle.level(), 0.5);
    }

    #[test]
    fn test_level_is_clamped() {
        let mut meter = LevelMeter::new();
        meter.process(&mut filled(3.0)).unwrap();
        assert_eq!(meter.level(), 1.0);
    }

    #[test]
    fn test_empty_buffer_reads_zero() {
        let mut meter = LevelMeter::new();
        meter.process(&mut filled(0.5)).unwrap();
        let mut buf = filled(0.5);
        buf.set_last_filled(0);
        meter.process(&mut buf).unwrap();
        assert_eq!(meter.level(), 0.0);
    }
}
