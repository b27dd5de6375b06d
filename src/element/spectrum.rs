//! 频谱
//!
//! 各声道平均后攒满 `size` 帧做一次 Hann 窗 FFT，取前一半的幅度。
//! 可选对数频率轴：把相邻的 bin 按 `j = k^1.01` 分组取最大值，低频保留细节、高频合并。
//! 同一窗口的 RMS 一起发布。结果写进原子变量，控制线程通过 `SpectrumHandle` 读取。
//! 默认关闭。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::{Power, Stage, StageError};
use crate::audio::buffer::SampleBuffer;

/// 默认窗口长度（帧）
pub const SPECTRUM_SIZE: usize = 2048;

/// 对数轴分组指数
const LOG_AXIS_EXPONENT: f64 = 1.01;

struct Shared {
    bins: Box<[AtomicU64]>,
    len: AtomicUsize,
    level: AtomicU64,
    updates: AtomicU64,
}

/// 频谱读取句柄
///
/// 读取不加锁，极少数情况下拿到的是跨两次分析的混合结果。
#[derive(Clone)]
pub struct SpectrumHandle(Arc<Shared>);

impl SpectrumHandle {
    /// 最近一次分析的幅度（归一化到满幅正弦 ≈ 1）
    pub fn bins(&self) -> Vec<f64> {
        let len = self.0.len.load(Ordering::Acquire);
        self.0.bins[..len]
            .iter()
            .map(|b| f64::from_bits(b.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn level(&self) -> f64 {
        f64::from_bits(self.0.level.load(Ordering::Relaxed))
    }

    /// 已完成的分析次数
    pub fn updates(&self) -> u64 {
        self.0.updates.load(Ordering::Acquire)
    }
}

pub struct Spectrum {
    power: Power,
    log_axis: bool,
    size: usize,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    input: Vec<f64>,
    filled: usize,
    sum_sq: f64,
    spectrum: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    magnitudes: Vec<f64>,
    shared: Arc<Shared>,
}

impl Spectrum {
    pub fn new() -> Self {
        Self::with_size(SPECTRUM_SIZE)
    }

    /// `size` 至少为 2
    pub fn with_size(size: usize) -> Self {
        let size = size.max(2);
        let fft = FftPlanner::<f64>::new().plan_fft_forward(size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let window = (0..size)
            .map(|i| {
                let phase = std::f64::consts::TAU * i as f64 / size as f64;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        let half = size / 2;

        log::debug!("Spectrum: window {} frames, {} bins", size, half);
        Self {
            power: Power::new(false),
            log_axis: true,
            size,
            fft,
            window,
            input: vec![0.0; size],
            filled: 0,
            sum_sq: 0.0,
            spectrum: vec![Complex::new(0.0, 0.0); size],
            scratch,
            magnitudes: vec![0.0; half],
            shared: Arc::new(Shared {
                bins: (0..half).map(|_| AtomicU64::new(0)).collect(),
                len: AtomicUsize::new(0),
                level: AtomicU64::new(0f64.to_bits()),
                updates: AtomicU64::new(0),
            }),
        }
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    pub fn handle(&self) -> SpectrumHandle {
        SpectrumHandle(Arc::clone(&self.shared))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_log_axis(&mut self, on: bool) {
        self.log_axis = on;
    }

    /// 丢弃攒了一半的窗口
    pub fn reset(&mut self) {
        self.filled = 0;
        self.sum_sq = 0.0;
    }

    fn analyze(&mut self) {
        for ((out, x), w) in self.spectrum.iter_mut().zip(&self.input).zip(&self.window) {
            *out = Complex::new(x * w, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        // Hann 窗相干增益 0.5，单边谱再 ×2
        let scale = 4.0 / self.size as f64;
        for (m, c) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *m = c.norm() * scale;
        }

        let len = if self.log_axis {
            group_log_axis(&mut self.magnitudes)
        } else {
            self.magnitudes.len()
        };

        for (bin, m) in self.shared.bins.iter().zip(&self.magnitudes[..len]) {
            bin.store(m.to_bits(), Ordering::Relaxed);
        }
        self.shared.len.store(len, Ordering::Release);

        let rms = (self.sum_sq / self.size as f64).sqrt().clamp(0.0, 1.0);
        self.shared.level.store(rms.to_bits(), Ordering::Relaxed);
        self.shared.updates.fetch_add(1, Ordering::Release);

        self.filled = 0;
        self.sum_sq = 0.0;
    }
}

impl Default for Spectrum {
    fn default() -> Self {
        Self::new()
    }
}

/// 原地分组，返回组数
///
/// 第 m 组覆盖 `[k, k^1.01]`，写入位置总不超过读取起点。
fn group_log_axis(bins: &mut [f64]) -> usize {
    let n = bins.len();
    let mut m = 0;
    let mut k = 0;
    while k < n {
        let j = ((k as f64).powf(LOG_AXIS_EXPONENT) as usize).clamp(k, n - 1);
        let peak = bins[k..=j].iter().copied().fold(0.0, f64::max);
        bins[m] = peak;
        m += 1;
        k = j + 1;
    }
    m
}

impl Stage for Spectrum {
    fn name(&self) -> &str {
        "Spectrum"
    }

    fn is_enabled(&self) -> bool {
        self.power.is_on()
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        let frames = buffer.last_filled_samples();
        let channels = buffer.format().channels as usize;
        if channels == 0 {
            return Ok(());
        }

        for i in 0..frames {
            let mut acc = 0.0;
            for c in 0..channels {
                acc += buffer.sample_f64(c, i).unwrap_or(0.0);
            }
            let v = acc / channels as f64;
            self.input[self.filled] = v;
            self.sum_sq += v * v;
            self.filled += 1;
            if self.filled == self.size {
                self.analyze();
            }
        }
        Ok(())
    }
}
