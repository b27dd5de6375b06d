//! 均衡器
//!
//! 每个频段一个双二阶滤波器（RBJ Audio EQ Cookbook），每个声道一组，按频段顺序串联。
//! 滤波器组在控制线程按输出格式构建（`configure`），音频线程只做滤波。
//! 没有频段时直接放行；默认开启。

use thiserror::Error;

use super::{Power, Stage, StageError};
use crate::audio::buffer::SampleBuffer;
use crate::audio::format::Format;

/// 频段数量上限
pub const MAX_BANDS: usize = 10;

/// 可调频率范围（Hz）
const MIN_FREQUENCY: u32 = 20;
const MAX_FREQUENCY: u32 = 20_000;

#[derive(Debug, Error)]
pub enum EqualizerError {
    #[error("frequency {0} Hz outside {MIN_FREQUENCY}..={MAX_FREQUENCY}")]
    InvalidFrequency(u32),
    #[error("invalid Q {0}")]
    InvalidQ(f64),
    #[error("invalid gain {0} dB")]
    InvalidGain(f64),
    #[error("equalizer already holds {0} bands")]
    Full(usize),
}

/// 滤波器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    LowPass,
    HighPass,
    Peaking,
    Notch,
    LowShelf,
    HighShelf,
}

/// 一个频段
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub kind: FilterKind,
    pub frequency: u32,
    /// 增益（dB），只对 Peaking / LowShelf / HighShelf 有意义
    pub gain_db: f64,
    pub q: f64,
}

impl Band {
    pub fn peaking(frequency: u32, gain_db: f64, q: f64) -> Self {
        Self {
            kind: FilterKind::Peaking,
            frequency,
            gain_db,
            q,
        }
    }

    pub fn validate(&self) -> Result<(), EqualizerError> {
        if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&self.frequency) {
            return Err(EqualizerError::InvalidFrequency(self.frequency));
        }
        if !self.q.is_finite() || self.q <= 0.0 {
            return Err(EqualizerError::InvalidQ(self.q));
        }
        if !self.gain_db.is_finite() {
            return Err(EqualizerError::InvalidGain(self.gain_db));
        }
        Ok(())
    }
}

/// 直接 I 型双二阶滤波器，系数已按 a0 归一化
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn new(band: &Band, rate: u32) -> Self {
        let w0 = std::f64::consts::TAU * band.frequency as f64 / rate as f64;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * band.q);
        let a = 10f64.powf(band.gain_db / 40.0);
        let shelf = 2.0 * a.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match band.kind {
            FilterKind::LowPass => (
                (1.0 - cos) / 2.0,
                1.0 - cos,
                (1.0 - cos) / 2.0,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterKind::HighPass => (
                (1.0 + cos) / 2.0,
                -(1.0 + cos),
                (1.0 + cos) / 2.0,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterKind::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos,
                1.0 - alpha / a,
            ),
            FilterKind::Notch => (1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha),
            FilterKind::LowShelf => (
                a * ((a + 1.0) - (a - 1.0) * cos + shelf),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                a * ((a + 1.0) - (a - 1.0) * cos - shelf),
                (a + 1.0) + (a - 1.0) * cos + shelf,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                (a + 1.0) + (a - 1.0) * cos - shelf,
            ),
            FilterKind::HighShelf => (
                a * ((a + 1.0) + (a - 1.0) * cos + shelf),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                a * ((a + 1.0) + (a - 1.0) * cos - shelf),
                (a + 1.0) - (a - 1.0) * cos + shelf,
                2.0 * ((a - 1.0) - (a + 1.0) * cos),
                (a + 1.0) - (a - 1.0) * cos - shelf,
            ),
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        // 非正规数清零
        self.y1 = if y.abs() < 1e-30 { 0.0 } else { y };
        y
    }

    fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

pub struct Equalizer {
    power: Power,
    bands: Vec<Band>,
    format: Option<Format>,
    /// 每声道一组，与 `bands` 顺序一致（跳过高于奈奎斯特频率的频段）
    filters: Vec<Vec<Biquad>>,
}

impl Equalizer {
    pub fn new() -> Self {
        Self {
            power: Power::default(),
            bands: Vec::with_capacity(MAX_BANDS),
            format: None,
            filters: Vec::new(),
        }
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn is_flat(&self) -> bool {
        self.bands.is_empty()
    }

    /// 整体替换频段；任何一个无效则保持原样
    pub fn set_bands(&mut self, bands: Vec<Band>) -> Result<(), EqualizerError> {
        if bands.len() > MAX_BANDS {
            return Err(EqualizerError::Full(MAX_BANDS));
        }
        for band in &bands {
            band.validate()?;
        }
        self.bands = bands;
        self.rebuild();
        Ok(())
    }

    /// 设置一个频段：同类型同频率的频段被替换，否则追加
    pub fn set_band(&mut self, band: Band) -> Result<(), EqualizerError> {
        band.validate()?;
        match self
            .bands
            .iter()
            .position(|b| b.kind == band.kind && b.frequency == band.frequency)
        {
            Some(idx) => self.bands[idx] = band,
            None if self.bands.len() >= MAX_BANDS => return Err(EqualizerError::Full(MAX_BANDS)),
            None => self.bands.push(band),
        }
        self.rebuild();
        Ok(())
    }

    /// 删除某频率上的所有频段，返回是否删除了
    pub fn remove_band(&mut self, frequency: u32) -> bool {
        let before = self.bands.len();
        self.bands.retain(|b| b.frequency != frequency);
        let removed = self.bands.len() != before;
        if removed {
            self.rebuild();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.bands.clear();
        self.rebuild();
    }

    /// 按缓冲区格式构建滤波器组（控制线程调用）
    pub fn configure(&mut self, format: Format) {
        self.format = Some(format);
        self.rebuild();
    }

    /// 清空滤波器历史
    pub fn reset(&mut self) {
        for chain in &mut self.filters {
            chain.iter_mut().for_each(Biquad::reset);
        }
    }

    fn rebuild(&mut self) {
        let Some(format) = self.format else {
            self.filters.clear();
            return;
        };
        let rate = format.rate.hz();
        let usable: Vec<Band> = self
            .bands
            .iter()
            .filter(|b| (b.frequency as u64) * 2 < rate as u64)
            .copied()
            .collect();
        if usable.len() != self.bands.len() {
            log::debug!(
                "Equalizer: {} bands above Nyquist for {} ignored",
                self.bands.len() - usable.len(),
                format
            );
        }

        self.filters = (0..format.channels)
            .map(|_| usable.iter().map(|b| Biquad::new(b, rate)).collect())
            .collect();
        log::debug!("Equalizer: {} bands at {}", usable.len(), format);
    }
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Equalizer {
    fn name(&self) -> &str {
        "Equalizer"
    }

    fn is_enabled(&self) -> bool {
        self.power.is_on()
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        if self.bands.is_empty() {
            return Ok(());
        }
        let actual = *buffer.format();
        match self.format {
            Some(expected) if expected == actual => {}
            Some(expected) => return Err(StageError::FormatMismatch { expected, actual }),
            None => return Err(StageError::NotConfigured("Equalizer")),
        }

        let frames = buffer.last_filled_samples();
        for (c, chain) in self.filters.iter_mut().enumerate() {
            for i in 0..frames {
                let Some(mut v) = buffer.sample_f64(c, i) else {
                    break;
                };
                for filter in chain.iter_mut() {
                    v = filter.process(v);
                }
                buffer.set_sample_f64(c, i, v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BufferConfig;
    use crate::audio::format::{SampleBits, SampleRate};
    use std::f64::consts::TAU;

    fn stereo() -> Format {
        Format::new(SampleRate::R48000, SampleBits::F64, 2)
    }

    /// 连续跑 `passes` 个 pass 的正弦波，返回最后一个 pass 的峰值
    fn sine_peak(eq: &mut Equalizer, hz: f64, passes: usize) -> f64 {
        let format = stereo();
        let mut buf = SampleBuffer::new(format, &BufferConfig::default()).unwrap();
        let step = TAU * hz / 48_000.0;
        let mut peak = 0.0;
        for pass in 0..passes {
            let start = pass * 480;
            buf.write_with(format, 480, |_, i| 0.5 * (step * (start + i) as f64).sin())
                .unwrap();
            eq.process(&mut buf).unwrap();
            peak = (0..480)
                .map(|i| buf.sample_f64(0, i).unwrap().abs())
                .fold(0.0, f64::max);
        }
        peak
    }

    #[test]
    fn test_flat_passes_through() {
        let mut eq = Equalizer::new();
        assert!(eq.is_enabled());
        assert!(eq.is_flat());
        // 没有频段时不需要格式
        let peak = sine_peak(&mut eq, 1000.0, 2);
        assert!((peak - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_peaking_boosts_center() {
        let mut eq = Equalizer::new();
        eq.configure(stereo());
        eq.set_band(Band::peaking(1000, 6.0, 1.0)).unwrap();

        // +6 dB ≈ ×2
        let peak = sine_peak(&mut eq, 1000.0, 20);
        assert!((peak - 1.0).abs() < 0.05, "peak {}", peak);
    }

    #[test]
    fn test_low_pass_attenuates_high_frequency() {
        let mut eq = Equalizer::new();
        eq.configure(stereo());
        eq.set_bands(vec![Band {
            kind: FilterKind::LowPass,
            frequency: 500,
            gain_db: 0.0,
            q: std::f64::consts::FRAC_1_SQRT_2,
        }])
        .unwrap();

        let peak = sine_peak(&mut eq, 8000.0, 20);
        assert!(peak < 0.05, "peak {}", peak);
    }

    #[test]
    fn test_band_validation_and_replacement() {
        let mut eq = Equalizer::new();
        assert!(matches!(
            eq.set_band(Band::peaking(10, 3.0, 1.0)),
            Err(EqualizerError::InvalidFrequency(10))
        ));
        assert!(matches!(
            eq.set_band(Band::peaking(1000, 3.0, 0.0)),
            Err(EqualizerError::InvalidQ(_))
        ));

        eq.set_band(Band::peaking(1000, 3.0, 1.0)).unwrap();
        eq.set_band(Band::peaking(1000, -3.0, 1.0)).unwrap();
        assert_eq!(eq.bands().len(), 1);
        assert_eq!(eq.bands()[0].gain_db, -3.0);

        for f in 0..MAX_BANDS as u32 - 1 {
            eq.set_band(Band::peaking(100 + f * 100, 1.0, 1.0)).unwrap();
        }
        assert!(matches!(
            eq.set_band(Band::peaking(15_000, 1.0, 1.0)),
            Err(EqualizerError::Full(_))
        ));
        assert!(eq.remove_band(1000));
        assert!(!eq.remove_band(1000));
    }

    #[test]
    fn test_format_mismatch_is_an_error() {
        let mut eq = Equalizer::new();
        eq.set_band(Band::peaking(1000, 6.0, 1.0)).unwrap();

        let mut buf = SampleBuffer::new(stereo(), &BufferConfig::default()).unwrap();
        buf.write_with(stereo(), 480, |_, _| 0.25).unwrap();
        assert!(matches!(
            eq.process(&mut buf),
            Err(StageError::NotConfigured(_))
        ));

        eq.configure(Format::new(SampleRate::R44100, SampleBits::F64, 2));
        assert!(matches!(
            eq.process(&mut buf),
            Err(StageError::FormatMismatch { .. })
        ));
        assert_eq!(buf.sample_f64(0, 0), Some(0.25));
    }
}
