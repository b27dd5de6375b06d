//! 重采样
//!
//! `Resampler` 统一处理平面 f64 数据，每次调用消耗固定的输入块。
//!
//! - 采样率相同：直通
//! - 两个采样率的最小公倍周期不超过一个输入块：rubato FFT
//! - 其它（如 44101 → 48000）：rubato sinc 插值，输出突发不随 gcd 变大

pub mod converter;

use rubato::{
    FftFixedIn, Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use thiserror::Error;

pub use converter::{ConvertError, FormatConverter};

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("cannot build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
    #[error("input block of {frames} frames exceeds resampler block of {block}")]
    BlockOverflow { frames: usize, block: usize },
}

/// 重采样器
pub trait Resampler: Send {
    /// 处理一个输入块
    ///
    /// input: 每声道一个平面，长度至少 `input_block()`
    /// frames: 其中有效的帧数，其余视为静音
    /// output: 每声道一个平面，长度至少 `output_max()`
    /// 返回: 实际输出的帧数
    fn process(
        &mut self,
        input: &[Vec<f64>],
        frames: usize,
        output: &mut [Vec<f64>],
    ) -> Result<usize, ResampleError>;

    /// 延迟（输入帧数）
    fn latency(&self) -> usize;

    /// 清空内部历史
    fn reset(&mut self);

    /// 输出/输入采样率比
    fn ratio(&self) -> f64;

    /// 每次调用消耗的输入帧数
    fn input_block(&self) -> usize;

    /// 单次调用可能产生的最大输出帧数
    fn output_max(&self) -> usize;

    /// 不足一块的输入可以立即处理，不影响后续输出的连续性
    fn accepts_partial(&self) -> bool {
        false
    }
}

/// 直通（采样率相同）
pub struct PassthroughResampler {
    block: usize,
}

impl PassthroughResampler {
    pub fn new(block: usize) -> Self {
        Self { block }
    }
}

impl Resampler for PassthroughResampler {
    fn process(
        &mut self,
        input: &[Vec<f64>],
        frames: usize,
        output: &mut [Vec<f64>],
    ) -> Result<usize, ResampleError> {
        if frames > self.block {
            return Err(ResampleError::BlockOverflow {
                frames,
                block: self.block,
            });
        }
        for (dst, src) in output.iter_mut().zip(input) {
            dst[..frames].copy_from_slice(&src[..frames]);
        }
        Ok(frames)
    }

    fn latency(&self) -> usize {
        0
    }

    fn reset(&mut self) {}

    fn ratio(&self) -> f64 {
        1.0
    }

    fn input_block(&self) -> usize {
        self.block
    }

    fn output_max(&self) -> usize {
        self.block
    }

    fn accepts_partial(&self) -> bool {
        true
    }
}

/// rubato `FftFixedIn` 封装
///
/// 输入块固定；转换器攒满一块才调用，只有流结束时补零。
pub struct FftResampler {
    inner: FftFixedIn<f64>,
    in_rate: u32,
    out_rate: u32,
    block: usize,
}

impl FftResampler {
    pub fn new(
        in_rate: u32,
        out_rate: u32,
        block: usize,
        channels: usize,
    ) -> Result<Self, ResampleError> {
        let inner = FftFixedIn::<f64>::new(
            in_rate as usize,
            out_rate as usize,
            block,
            2,
            channels,
        )?;

        log::debug!(
            "FFT resampler {}Hz -> {}Hz, block {} frames, max output {} frames",
            in_rate,
            out_rate,
            block,
            inner.output_frames_max()
        );

        Ok(Self {
            inner,
            in_rate,
            out_rate,
            block,
        })
    }
}

impl Resampler for FftResampler {
    fn process(
        &mut self,
        input: &[Vec<f64>],
        frames: usize,
        output: &mut [Vec<f64>],
    ) -> Result<usize, ResampleError> {
        if frames > self.block {
            return Err(ResampleError::BlockOverflow {
                frames,
                block: self.block,
            });
        }
        let (_, produced) = self.inner.process_into_buffer(input, output, None)?;
        Ok(produced)
    }

    fn latency(&self) -> usize {
        // 输出域延迟折算回输入帧，向上取整
        let delay = self.inner.output_delay() as u64;
        ((delay * self.in_rate as u64).div_ceil(self.out_rate as u64)) as usize
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn ratio(&self) -> f64 {
        self.out_rate as f64 / self.in_rate as f64
    }

    fn input_block(&self) -> usize {
        self.block
    }

    fn output_max(&self) -> usize {
        self.inner.output_frames_max()
    }
}

/// rubato `SincFixedIn` 封装，用于最小公倍周期很长的采样率对
pub struct SincResampler {
    inner: SincFixedIn<f64>,
    ratio: f64,
    block: usize,
}

impl SincResampler {
    pub fn new(
        in_rate: u32,
        out_rate: u32,
        block: usize,
        channels: usize,
    ) -> Result<Self, ResampleError> {
        let ratio = out_rate as f64 / in_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f64>::new(ratio, 1.0, params, block, channels)?;

        log::debug!(
            "Sinc resampler {}Hz -> {}Hz, block {} frames, max output {} frames",
            in_rate,
            out_rate,
            block,
            inner.output_frames_max()
        );

        Ok(Self {
            inner,
            ratio,
            block,
        })
    }
}

impl Resampler for SincResampler {
    fn process(
        &mut self,
        input: &[Vec<f64>],
        frames: usize,
        output: &mut [Vec<f64>],
    ) -> Result<usize, ResampleError> {
        if frames > self.block {
            return Err(ResampleError::BlockOverflow {
                frames,
                block: self.block,
            });
        }
        let (_, produced) = self.inner.process_into_buffer(input, output, None)?;
        Ok(produced)
    }

    fn latency(&self) -> usize {
        (self.inner.output_delay() as f64 / self.ratio).ceil() as usize
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn ratio(&self) -> f64 {
        self.ratio
    }

    fn input_block(&self) -> usize {
        self.block
    }

    fn output_max(&self) -> usize {
        self.inner.output_frames_max()
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// FFT 重采样一次至少消耗 `in_rate / gcd` 帧
fn fft_fits(in_rate: u32, out_rate: u32, block: usize) -> bool {
    let period = in_rate / gcd(in_rate, out_rate).max(1);
    period as usize <= block
}

/// 按采样率选择实现
pub fn build_resampler(
    in_rate: u32,
    out_rate: u32,
    block: usize,
    channels: usize,
) -> Result<Box<dyn Resampler>, ResampleError> {
    if in_rate == out_rate {
        Ok(Box::new(PassthroughResampler::new(block)))
    } else if fft_fits(in_rate, out_rate, block) {
        Ok(Box::new(FftResampler::new(in_rate, out_rate, block, channels)?))
    } else {
        Ok(Box::new(SincResampler::new(in_rate, out_rate, block, channels)?))
    }
}
