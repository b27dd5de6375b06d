//! 格式转换器
//!
//! 把一个缓冲区从输入格式原地转成输出格式：
//! 解码为 f64 → 声道映射 → 攒满一个输入块 → 重采样 → 输出队列 → 编码写回。
//!
//! 重采样器按固定输入块工作，输出是突发的（如 44.1k→48k 交替 320/640 帧）。
//! 输入不足一块时留在待处理区，不补零；输出多于一个输出块时留在队列里，
//! 下一次取出。只有源结束时 `flush` 才用静音补齐最后一块。
//! 所有中间缓冲在 configure 时按最坏情况预分配。

use thiserror::Error;

use super::{build_resampler, ResampleError, Resampler};
use crate::audio::buffer::{BufferConfig, BufferError, SampleBuffer};
use crate::audio::format::{Format, FormatError};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("converter is not configured")]
    NotConfigured,
    #[error("buffer format {actual} does not match converter input {expected}")]
    FormatMismatch { expected: Format, actual: Format },
    #[error("input block for {0} is empty")]
    EmptyBlock(Format),
    #[error("{frames} samples exceed converter block of {block}")]
    BlockOverflow { frames: usize, block: usize },
    #[error("output queue holds {queued} samples, capacity {capacity}")]
    Overrun { queued: usize, capacity: usize },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Resample(#[from] ResampleError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// 输出声道的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelSource {
    Copy(usize),
    /// 所有输入声道的平均（下混到单声道）
    Average,
    Silence,
}

/// 计算输出声道映射
///
/// 同角色直接复制；单声道输入铺到所有输出；单声道输出取平均；
/// 找不到对应角色的声道输出静音。任一侧没有布局时按序号对应。
fn channel_map(input: &Format, output: &Format) -> Vec<ChannelSource> {
    (0..output.channels as usize)
        .map(|oc| {
            if input.channels == 1 {
                return ChannelSource::Copy(0);
            }
            if output.channels == 1 {
                return ChannelSource::Average;
            }
            if input.layout.is_empty() || output.layout.is_empty() {
                return if oc < input.channels as usize {
                    ChannelSource::Copy(oc)
                } else {
                    ChannelSource::Silence
                };
            }
            match output.layout.channel_at(oc).and_then(|role| input.layout.index_of(role)) {
                Some(ic) => ChannelSource::Copy(ic),
                None => ChannelSource::Silence,
            }
        })
        .collect()
}

/// `input` 个输入样本最多产生的输出样本数（含重采样延迟，向上取整）
fn estimate(latency: usize, input: usize, in_rate: u32, out_rate: u32) -> usize {
    let pending = (latency + input) as u64;
    (pending * out_rate as u64).div_ceil(in_rate as u64) as usize
}

/// 一对 (输入, 输出) 格式的完整转换状态
pub(crate) struct ConverterState {
    input: Format,
    output: Format,
    /// 每次重采样消耗的输入样本数
    block: usize,
    /// 每次取出的最大输出样本数
    out_block: usize,
    /// 一次重采样最多产生的输出样本数
    burst: usize,
    resampler: Box<dyn Resampler>,
    map: Vec<ChannelSource>,
    decoded: Vec<Vec<f64>>,
    /// 已映射到输出声道、等待凑满一块的输入
    pending: Vec<Vec<f64>>,
    pending_len: usize,
    /// 上次 flush/reset 之后有过输入
    primed: bool,
    resampled: Vec<Vec<f64>>,
    queue: Vec<Vec<f64>>,
    queued: usize,
    encoded: Vec<u8>,
}

impl ConverterState {
    pub(crate) fn build(
        input: Format,
        output: Format,
        config: &BufferConfig,
    ) -> Result<Self, ConvertError> {
        input.validate()?;
        output.validate()?;

        let block = config.block_samples(&input);
        if block == 0 {
            return Err(ConvertError::EmptyBlock(input));
        }
        let out_block = config.block_samples(&output);
        if out_block == 0 {
            return Err(ConvertError::EmptyBlock(output));
        }

        let out_channels = output.channels as usize;
        let resampler = build_resampler(input.rate.hz(), output.rate.hz(), block, out_channels)?;
        let burst = resampler.output_max().max(estimate(
            resampler.latency(),
            block,
            input.rate.hz(),
            output.rate.hz(),
        ));
        let capacity = out_block + 2 * burst;

        log::debug!(
            "Converter {} -> {}: block {}, latency {}, burst {}, queue {} samples",
            input,
            output,
            block,
            resampler.latency(),
            burst,
            capacity
        );

        Ok(Self {
            input,
            output,
            block,
            out_block,
            burst,
            map: channel_map(&input, &output),
            decoded: vec![vec![0.0; block]; input.channels as usize],
            pending: vec![vec![0.0; block]; out_channels],
            pending_len: 0,
            primed: false,
            resampled: vec![vec![0.0; resampler.output_max()]; out_channels],
            queue: vec![vec![0.0; capacity]; out_channels],
            queued: 0,
            encoded: vec![0; output.byte_size(out_block)],
            resampler,
        })
    }

    fn capacity(&self) -> usize {
        self.queue.first().map_or(0, Vec::len)
    }

    fn wants_input(&self) -> bool {
        self.queued < self.out_block
    }

    /// 把 `frames` 个已解码样本从 `src` 起映射到待处理区末尾
    fn map_pending(&mut self, src: usize, frames: usize) {
        let dst = self.pending_len;
        let decoded = &self.decoded;
        for (plane, source) in self.pending.iter_mut().zip(&self.map) {
            let out = &mut plane[dst..dst + frames];
            match *source {
                ChannelSource::Copy(ic) => out.copy_from_slice(&decoded[ic][src..src + frames]),
                ChannelSource::Average => {
                    let scale = 1.0 / decoded.len() as f64;
                    for (i, slot) in out.iter_mut().enumerate() {
                        *slot = decoded.iter().map(|p| p[src + i]).sum::<f64>() * scale;
                    }
                }
                ChannelSource::Silence => out.fill(0.0),
            }
        }
        self.pending_len += frames;
    }

    /// 重采样待处理区（`frames` 个有效样本，其余为静音），结果进入队列
    fn resample_pending(&mut self, frames: usize) -> Result<usize, ConvertError> {
        if self.queued + self.burst > self.capacity() {
            return Err(ConvertError::Overrun {
                queued: self.queued,
                capacity: self.capacity(),
            });
        }
        for plane in &mut self.pending {
            plane[self.pending_len..].fill(0.0);
        }

        let produced = self.resampler.process(&self.pending, frames, &mut self.resampled)?;
        let at = self.queued;
        for (dst, src) in self.queue.iter_mut().zip(&self.resampled) {
            dst[at..at + produced].copy_from_slice(&src[..produced]);
        }
        self.queued += produced;
        self.pending_len = 0;
        Ok(produced)
    }

    fn push(&mut self, buffer: &SampleBuffer) -> Result<(), ConvertError> {
        if *buffer.format() != self.input {
            return Err(ConvertError::FormatMismatch {
                expected: self.input,
                actual: *buffer.format(),
            });
        }
        let frames = buffer.requested_samples();
        if frames > self.block {
            return Err(ConvertError::BlockOverflow {
                frames,
                block: self.block,
            });
        }
        if self.queued + self.burst > self.capacity() {
            return Err(ConvertError::Overrun {
                queued: self.queued,
                capacity: self.capacity(),
            });
        }

        let in_bits = self.input.bits;
        let in_w = in_bits.width();
        for (c, plane) in self.decoded.iter_mut().enumerate() {
            let src = buffer.channel(c).unwrap_or(&[]);
            for (slot, raw) in plane[..frames].iter_mut().zip(src.chunks_exact(in_w)) {
                *slot = in_bits.decode(raw);
            }
        }

        let partial = self.resampler.accepts_partial();
        let mut consumed = 0;
        while consumed < frames {
            let take = (frames - consumed).min(self.block - self.pending_len);
            self.map_pending(consumed, take);
            consumed += take;
            if self.pending_len == self.block || partial {
                self.resample_pending(self.pending_len)?;
            }
        }
        self.primed |= frames > 0;
        Ok(())
    }

    /// 源结束：补零送出待处理区和重采样器里残留的样本
    fn flush(&mut self) -> Result<usize, ConvertError> {
        if !self.primed {
            return Ok(0);
        }
        let tail = self.pending_len + self.resampler.latency();
        let before = self.queued;
        let mut fed = 0;
        while fed < tail {
            let valid = self.pending_len;
            self.resample_pending(valid)?;
            fed += self.block;
        }
        self.primed = false;
        Ok(self.queued - before)
    }

    fn drain(&mut self, buffer: &mut SampleBuffer) -> Result<usize, ConvertError> {
        let n = self.queued.min(self.out_block);
        let out_bits = self.output.bits;
        let out_w = out_bits.width();
        let stride = n * out_w;
        for (c, plane) in self.queue.iter().enumerate() {
            let region = &mut self.encoded[c * stride..(c + 1) * stride];
            for (raw, value) in region.chunks_exact_mut(out_w).zip(&plane[..n]) {
                out_bits.encode(*value, raw);
            }
        }

        buffer.write_from(&self.encoded, n, self.output)?;

        let queued = self.queued;
        for plane in &mut self.queue {
            plane.copy_within(n..queued, 0);
        }
        self.queued -= n;
        Ok(n)
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.pending_len = 0;
        self.queued = 0;
        self.primed = false;
    }
}

/// 某个源到混音输出格式的转换器
pub struct FormatConverter {
    config: BufferConfig,
    state: Option<ConverterState>,
}

impl FormatConverter {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// 为 (input, output) 准备转换状态；格式对未变时直接返回
    pub fn configure(&mut self, input: Format, output: Format) -> Result<(), ConvertError> {
        if let Some(state) = self.prepare(input, output)? {
            self.install(state);
        }
        Ok(())
    }

    /// 构建但不安装；`None` 表示当前状态已经匹配
    pub(crate) fn prepare(
        &self,
        input: Format,
        output: Format,
    ) -> Result<Option<ConverterState>, ConvertError> {
        if let Some(state) = &self.state {
            if state.input == input && state.output == output {
                return Ok(None);
            }
        }
        ConverterState::build(input, output, &self.config).map(Some)
    }

    pub(crate) fn install(&mut self, state: ConverterState) {
        self.state = Some(state);
    }

    fn state_mut(&mut self) -> Result<&mut ConverterState, ConvertError> {
        self.state.as_mut().ok_or(ConvertError::NotConfigured)
    }

    pub fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    pub fn input_format(&self) -> Option<Format> {
        self.state.as_ref().map(|s| s.input)
    }

    pub fn output_format(&self) -> Option<Format> {
        self.state.as_ref().map(|s| s.output)
    }

    /// 源每次应当提供的样本数；未配置时为 0
    pub fn input_block(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.block)
    }

    /// 每次 `drain` 最多写回的样本数
    pub fn output_block(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.out_block)
    }

    /// 重采样延迟（输入样本数）
    pub fn latency(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.resampler.latency())
    }

    /// 队列中已转换、尚未取出的样本数
    pub fn queued_samples(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.queued)
    }

    /// 队列不足一个输出块，需要源再提供数据
    pub fn wants_input(&self) -> bool {
        self.state.as_ref().is_some_and(ConverterState::wants_input)
    }

    /// 吃进 `buffer` 中的输入（必须是输入格式），不修改 `buffer`
    pub fn push(&mut self, buffer: &SampleBuffer) -> Result<(), ConvertError> {
        self.state_mut()?.push(buffer)
    }

    /// 取出最多一个输出块写入 `buffer`，返回样本数；失败时缓冲区不变
    pub fn drain(&mut self, buffer: &mut SampleBuffer) -> Result<usize, ConvertError> {
        self.state_mut()?.drain(buffer)
    }

    /// 源已结束：把不足一块的输入补零送进重采样器，返回新增的输出样本数
    pub fn flush(&mut self) -> Result<usize, ConvertError> {
        self.state_mut()?.flush()
    }

    /// `push` 后 `drain` 回同一个缓冲区，返回写回的样本数；失败时缓冲区不变
    pub fn convert(&mut self, buffer: &mut SampleBuffer) -> Result<usize, ConvertError> {
        let state = self.state_mut()?;
        state.push(buffer)?;
        state.drain(buffer)
    }

    /// 清空重采样历史、待处理输入和输出队列（seek 之后调用）
    pub fn reset(&mut self) {
        if let Some(state) = &mut self.state {
            state.reset();
        }
    }
}
