//! 输出设备契约
//!
//! 设备层（不在本 crate 内）在自己的回调线程里向引擎要一段帧，
//! 目标是一块字节缓冲区，每个声道由起始偏移 + 步长描述：
//! 交织缓冲区步长 = 帧字节数，平面缓冲区步长 = 样本宽度。
//!
//! `Renderer` 持有最终缓冲区和消费游标，缓冲区读完才跑下一个 pass。
//!
//! **回调路径禁止：**
//! - 锁
//! - 分配
//! - I/O

use std::sync::Arc;

use super::buffer::{BufferConfig, BufferError, SampleBuffer};
use super::format::{Format, SampleBits};
use super::stats::RenderStats;
use super::timing;

/// 可以被设备驱动的渲染过程（一次 pass 填满 `buffer`）
pub trait Render: Send {
    /// 运行一个 pass，返回产生的样本数；0 表示这一轮没有数据
    fn render(&mut self, buffer: &mut SampleBuffer) -> usize;
}

/// 设备缓冲区里某个声道的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDest {
    /// 第 0 帧的字节偏移
    pub offset: usize,
    /// 相邻帧之间的字节距离
    pub stride: usize,
}

impl ChannelDest {
    pub fn new(offset: usize, stride: usize) -> Self {
        Self { offset, stride }
    }

    /// 交织布局：`c` 声道偏移 `c × width`，步长一帧
    pub fn interleaved(channels: usize, width: usize) -> Vec<ChannelDest> {
        (0..channels)
            .map(|c| ChannelDest::new(c * width, channels * width))
            .collect()
    }

    /// 平面布局：每声道连续 `frames` 个样本
    pub fn planar(channels: usize, width: usize, frames: usize) -> Vec<ChannelDest> {
        (0..channels)
            .map(|c| ChannelDest::new(c * frames * width, width))
            .collect()
    }

    #[inline]
    fn position(&self, frame: usize) -> usize {
        self.offset + frame * self.stride
    }
}

/// 从 `buffer` 第 `start` 个样本起拷 `frames` 帧到设备缓冲区第 `dst_frame` 帧
///
/// 按样本宽度（1/2/3/4/8 字节）分派，只拷 `last_filled` 以内的样本，
/// 返回实际拷贝的帧数。`dests` 多于缓冲区声道数时，多出的声道写静音。
pub fn deliver(
    buffer: &SampleBuffer,
    start: usize,
    dst_frame: usize,
    frames: usize,
    out: &mut [u8],
    dests: &[ChannelDest],
) -> Result<usize, BufferError> {
    let frames = frames.min(buffer.last_filled_samples().saturating_sub(start));
    if frames == 0 {
        return Ok(0);
    }

    let format = buffer.format();
    let channels = format.channels as usize;
    let width = format.bits.width();

    for (c, dest) in dests.iter().enumerate() {
        let end = dest.position(dst_frame + frames - 1) + width;
        if end > out.len() {
            return Err(BufferError::ShortDestination {
                have: out.len(),
                needed: end,
            });
        }
        for i in 0..frames {
            let pos = dest.position(dst_frame + i);
            if c < channels {
                buffer.copy_step(c, start + i, &mut out[pos..])?;
            } else {
                format.bits.fill_silence(&mut out[pos..pos + width]);
            }
        }
    }
    Ok(frames)
}

/// 向设备缓冲区第 `dst_frame` 帧起写 `frames` 帧静音
pub fn deliver_silence(
    bits: SampleBits,
    dst_frame: usize,
    frames: usize,
    out: &mut [u8],
    dests: &[ChannelDest],
) {
    let width = bits.width();
    for dest in dests {
        for i in 0..frames {
            let pos = dest.position(dst_frame + i);
            if let Some(slot) = out.get_mut(pos..pos + width) {
                bits.fill_silence(slot);
            }
        }
    }
}

/// 设备回调侧的驱动器
pub struct Renderer<R: Render> {
    source: R,
    buffer: SampleBuffer,
    dests: Vec<ChannelDest>,
    /// 已交给设备的样本数
    cursor: usize,
    stats: Arc<RenderStats>,
}

impl<R: Render> Renderer<R> {
    /// `format` 是设备格式，`dests` 按该格式的样本宽度描述设备缓冲区
    pub fn new(
        source: R,
        format: Format,
        config: &BufferConfig,
        dests: Vec<ChannelDest>,
    ) -> Result<Self, BufferError> {
        let buffer = SampleBuffer::new(format, config)?;
        log::debug!(
            "Renderer: {} block {} samples, capacity {} bytes, {} destinations",
            format,
            buffer.requested_samples(),
            buffer.capacity(),
            dests.len()
        );
        Ok(Self {
            source,
            buffer,
            dests,
            cursor: 0,
            stats: Arc::new(RenderStats::new()),
        })
    }

    /// 设备格式变化：重新分配最终缓冲区，丢弃未消费的样本
    pub fn reconfigure(
        &mut self,
        format: Format,
        config: &BufferConfig,
        dests: Vec<ChannelDest>,
    ) -> Result<(), BufferError> {
        self.buffer = SampleBuffer::new(format, config)?;
        self.dests = dests;
        self.cursor = 0;
        log::info!("Renderer reconfigured to {}", format);
        Ok(())
    }

    pub fn format(&self) -> &Format {
        self.buffer.format()
    }

    pub fn stats(&self) -> Arc<RenderStats> {
        Arc::clone(&self.stats)
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }

    /// 最终缓冲区中尚未交给设备的样本数
    pub fn pending(&self) -> usize {
        self.buffer.last_filled_samples().saturating_sub(self.cursor)
    }

    /// 设备回调：向 `out` 写满 `frames` 帧
    ///
    /// 缓冲区读完就跑一个 pass；pass 没有数据时剩余部分写静音并记一次 underrun。
    /// 返回来自流水线的帧数。
    pub fn fill(&mut self, out: &mut [u8], frames: usize) -> Result<usize, BufferError> {
        self.stats.on_callback();

        let mut done = 0;
        while done < frames {
            if self.pending() == 0 {
                let start = timing::now_ns();
                let produced = self.source.render(&mut self.buffer);
                self.stats.on_pass(timing::elapsed_since(start));
                self.cursor = 0;

                if produced == 0 {
                    self.stats.record_underrun();
                    break;
                }
            }

            let n = deliver(
                &self.buffer,
                self.cursor,
                done,
                frames - done,
                out,
                &self.dests,
            )?;
            self.cursor += n;
            done += n;
        }

        if done < frames {
            deliver_silence(
                self.buffer.format().bits,
                done,
                frames - done,
                out,
                &self.dests,
            );
        }

        self.stats.add_frames(done as u64);
        Ok(done)
    }
}
