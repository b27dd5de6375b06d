//! 内置源
//!
//! - `ToneSource`: 正弦波发生器
//! - `PcmSource`: 播放一段预先给定的平面 PCM

use std::f64::consts::TAU;

use super::{Source, SourceError};
use crate::audio::buffer::SampleBuffer;
use crate::audio::format::Format;

/// 正弦波，所有声道相同
pub struct ToneSource {
    format: Format,
    frequency: f64,
    amplitude: f64,
    phase: f64,
}

impl ToneSource {
    pub fn new(format: Format, frequency: f64, amplitude: f64) -> Self {
        Self {
            format,
            frequency,
            amplitude,
            phase: 0.0,
        }
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency;
    }

    pub fn set_amplitude(&mut self, amplitude: f64) {
        self.amplitude = amplitude;
    }
}

impl Source for ToneSource {
    fn pull(&mut self, buffer: &mut SampleBuffer) -> Result<usize, SourceError> {
        let n = buffer.requested_samples();
        let step = TAU * self.frequency / self.format.rate.hz() as f64;
        let (phase, amplitude) = (self.phase, self.amplitude);

        buffer.write_with(self.format, n, |_, i| {
            amplitude * (phase + step * i as f64).sin()
        })?;

        self.phase = (phase + step * n as f64) % TAU;
        Ok(n)
    }

    fn native_format(&self) -> Format {
        self.format
    }
}

/// 一次性 PCM 播放
///
/// 数据播完后每次拉取都返回 0。
pub struct PcmSource {
    format: Format,
    planes: Vec<Vec<f64>>,
    position: usize,
}

impl PcmSource {
    /// `planes` 每声道一个；长度不一致时按最短的声道计
    pub fn new(format: Format, planes: Vec<Vec<f64>>) -> Self {
        Self {
            format,
            planes,
            position: 0,
        }
    }

    fn len(&self) -> usize {
        let channels = self.format.channels as usize;
        if self.planes.len() < channels {
            return 0;
        }
        self.planes[..channels]
            .iter()
            .map(Vec::len)
            .min()
            .unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position)
    }

    pub fn is_idle(&self) -> bool {
        self.remaining() == 0
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl Source for PcmSource {
    fn pull(&mut self, buffer: &mut SampleBuffer) -> Result<usize, SourceError> {
        let n = buffer.requested_samples().min(self.remaining());
        if n == 0 {
            return Ok(0);
        }

        let (planes, start) = (&self.planes, self.position);
        buffer.write_with(self.format, n, |c, i| planes[c][start + i])?;
        self.position += n;
        Ok(n)
    }

    fn native_format(&self) -> Format {
        self.format
    }

    fn is_finished(&self) -> bool {
        self.is_idle()
    }
}
