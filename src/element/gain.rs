//! 音量
//!
//! 增益由音量、静音和底数决定：
//! - 静音或音量为 0 → 0
//! - 底数为 1 → 线性，增益 = 音量
//! - 其它底数 → 增益 = 底数 ^ 音量
//!
//! 增益恰好为 1 时整个阶段跳过。

use super::{Power, Stage, StageError};
use crate::audio::buffer::SampleBuffer;

pub struct Gain {
    name: String,
    power: Power,
    base: f64,
    volume: f64,
    mute: bool,
    gain: f64,
}

impl Gain {
    /// 线性音量
    pub fn new(volume: f64) -> Self {
        Self::with_base(1.0, volume)
    }

    /// 指数音量曲线
    pub fn with_base(base: f64, volume: f64) -> Self {
        let mut gain = Self {
            name: "Volume".to_string(),
            power: Power::default(),
            base,
            volume: 0.0,
            mute: false,
            gain: 0.0,
        };
        gain.set_volume(volume);
        gain
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 音量钳位到 [0, 1]
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.recompute();
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
        self.recompute();
    }

    pub fn set_base(&mut self, base: f64) {
        self.base = base;
        self.recompute();
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn is_mute(&self) -> bool {
        self.mute
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    /// 当前生效的增益
    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    fn recompute(&mut self) {
        self.gain = if self.mute || self.volume == 0.0 {
            0.0
        } else if self.base == 1.0 {
            self.volume
        } else {
            self.base.powf(self.volume)
        };
    }
}

impl Stage for Gain {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.power.is_on()
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        if !self.power.is_on() || self.gain == 1.0 {
            return Ok(());
        }

        let bits = buffer.format().bits;
        let len = buffer.last_filled_samples() * bits.width();
        for c in 0..buffer.format().channels as usize {
            if let Some(data) = buffer.channel_mut(c) {
                bits.scale(&mut data[..len], self.gain);
            }
        }
        Ok(())
    }
}
