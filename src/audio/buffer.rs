//! 平面（non-interleaved）样本缓冲区
//!
//! 一块在构造时固定大小的字节存储，按当前格式解释：
//! 声道 c 的区域从 `c * requested * width` 开始，长度 `requested * width`。
//! 各声道区域不单独存储，随格式和请求样本数推导。
//!
//! 缓冲区的格式可以在运行时改变（retag / write_from），
//! 但任何时候 `format.byte_size(requested) <= capacity` 都成立。

use std::ops::Range;

use thiserror::Error;

use super::format::{Format, FormatError, SampleBits};

/// 缓冲区时长配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// 一次流水线 pass 处理的时长
    pub block_ms: u32,
    /// 存储容量对应的时长
    pub capacity_ms: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            block_ms: 10,
            capacity_ms: 40,
        }
    }
}

impl BufferConfig {
    #[inline]
    pub fn block_samples(&self, format: &Format) -> usize {
        format.rate.samples_for_ms(self.block_ms)
    }

    #[inline]
    pub fn capacity_samples(&self, format: &Format) -> usize {
        format.rate.samples_for_ms(self.capacity_ms.max(self.block_ms))
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("buffer capacity for {0} is zero")]
    ZeroCapacity(Format),
    #[error("{needed} bytes exceed buffer capacity of {capacity} bytes")]
    CapacityExceeded { needed: usize, capacity: usize },
    #[error("input holds {have} bytes, {needed} expected")]
    ShortInput { have: usize, needed: usize },
    #[error("channel {channel} out of range ({channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: u16 },
    #[error("sample {index} out of range ({len} samples)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("destination holds {have} bytes, sample needs {needed}")]
    ShortDestination { have: usize, needed: usize },
    #[error("unsupported sample width of {0} bytes")]
    UnsupportedWidth(usize),
}

/// 单个样本的原始字节（最多 8 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    bytes: [u8; 8],
    width: u8,
}

impl RawSample {
    fn from_slice(raw: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..raw.len()].copy_from_slice(raw);
        Self {
            bytes,
            width: raw.len() as u8,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.width as usize]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width as usize
    }

    pub fn to_f64(&self, bits: SampleBits) -> f64 {
        bits.decode(self.as_bytes())
    }
}

pub struct SampleBuffer {
    data: Vec<u8>,
    /// 构造时的格式，决定容量
    real_format: Format,
    /// 当前内容的格式
    format: Format,
    requested: usize,
    last_filled: usize,
}

impl SampleBuffer {
    /// 按配置创建：请求样本数对应 `block_ms`，容量对应 `capacity_ms`
    pub fn new(format: Format, config: &BufferConfig) -> Result<Self, BufferError> {
        Self::with_capacity(
            format,
            config.block_samples(&format),
            config.capacity_samples(&format),
        )
    }

    /// 指定请求样本数与容量（均为每声道样本数）
    pub fn with_capacity(
        format: Format,
        requested: usize,
        capacity_samples: usize,
    ) -> Result<Self, BufferError> {
        format.validate()?;

        let capacity = format.byte_size(capacity_samples);
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity(format));
        }
        let needed = format.byte_size(requested);
        if needed > capacity {
            return Err(BufferError::CapacityExceeded { needed, capacity });
        }

        Ok(Self {
            data: vec![0u8; capacity],
            real_format: format,
            format,
            requested,
            last_filled: 0,
        })
    }

    #[inline]
    pub fn format(&self) -> &Format {
        &self.format
    }

    #[inline]
    pub fn real_format(&self) -> &Format {
        &self.real_format
    }

    /// 容量（字节）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 当前格式下可容纳的每声道样本数
    pub fn capacity_samples(&self) -> usize {
        let frame = self.format.byte_size(1);
        if frame == 0 {
            0
        } else {
            self.data.len() / frame
        }
    }

    #[inline]
    pub fn requested_samples(&self) -> usize {
        self.requested
    }

    #[inline]
    pub fn last_filled_samples(&self) -> usize {
        self.last_filled
    }

    /// 设置最近一次写入的样本数，不超过请求数
    pub fn set_last_filled(&mut self, samples: usize) {
        self.last_filled = samples.min(self.requested);
    }

    /// 整个存储写为当前格式的静音
    pub fn zero(&mut self) {
        self.format.bits.fill_silence(&mut self.data);
    }

    /// 恢复构造时的格式，设置请求样本数，清空 last_filled 并写静音
    pub fn reset_for(&mut self, samples: usize) -> Result<(), BufferError> {
        self.check_fits(&self.real_format, samples)?;
        self.format = self.real_format;
        self.requested = samples;
        self.last_filled = 0;
        self.zero();
        Ok(())
    }

    /// 换一个格式解释存储内容（不移动数据）
    pub fn retag(&mut self, format: Format) -> Result<(), BufferError> {
        format.validate()?;
        self.check_fits(&format, self.requested)?;
        self.format = format;
        Ok(())
    }

    fn check_fits(&self, format: &Format, samples: usize) -> Result<(), BufferError> {
        let needed = format.byte_size(samples);
        if needed > self.data.len() {
            return Err(BufferError::CapacityExceeded {
                needed,
                capacity: self.data.len(),
            });
        }
        Ok(())
    }

    /// 从平面字节数据写入 `samples` 个样本
    ///
    /// `raw` 按 `format` 的平面布局排列。成功后格式、请求数与
    /// last_filled 都更新为输入；失败时缓冲区保持原样。
    pub fn write_from(
        &mut self,
        raw: &[u8],
        samples: usize,
        format: Format,
    ) -> Result<(), BufferError> {
        format.validate()?;
        self.check_fits(&format, samples)?;
        let needed = format.byte_size(samples);
        if raw.len() < needed {
            return Err(BufferError::ShortInput {
                have: raw.len(),
                needed,
            });
        }

        self.data[..needed].copy_from_slice(&raw[..needed]);
        self.format = format;
        self.requested = samples;
        self.last_filled = samples;
        Ok(())
    }

    /// 逐样本生成写入：`sample(channel, index)` 返回归一化值
    ///
    /// 与 `write_from` 相同的元数据语义，但不经过中间缓冲。
    pub fn write_with<F>(
        &mut self,
        format: Format,
        samples: usize,
        mut sample: F,
    ) -> Result<(), BufferError>
    where
        F: FnMut(usize, usize) -> f64,
    {
        format.validate()?;
        self.check_fits(&format, samples)?;

        let bits = format.bits;
        let w = bits.width();
        let stride = samples * w;
        for c in 0..format.channels as usize {
            let region = &mut self.data[c * stride..(c + 1) * stride];
            for (i, raw) in region.chunks_exact_mut(w).enumerate() {
                bits.encode(sample(c, i), raw);
            }
        }

        self.format = format;
        self.requested = samples;
        self.last_filled = samples;
        Ok(())
    }

    fn channel_range(&self, channel: usize) -> Option<Range<usize>> {
        if channel >= self.format.channels as usize {
            return None;
        }
        let stride = self.requested * self.format.bits.width();
        Some(channel * stride..(channel + 1) * stride)
    }

    /// 声道 `channel` 的 `requested` 个样本
    pub fn channel(&self, channel: usize) -> Option<&[u8]> {
        self.channel_range(channel).map(|r| &self.data[r])
    }

    pub fn channel_mut(&mut self, channel: usize) -> Option<&mut [u8]> {
        self.channel_range(channel).map(move |r| &mut self.data[r])
    }

    fn sample_range(&self, channel: usize, index: usize) -> Result<Range<usize>, BufferError> {
        let range = self
            .channel_range(channel)
            .ok_or(BufferError::ChannelOutOfRange {
                channel,
                channels: self.format.channels,
            })?;
        if index >= self.requested {
            return Err(BufferError::IndexOutOfRange {
                index,
                len: self.requested,
            });
        }
        let w = self.format.bits.width();
        let start = range.start + index * w;
        Ok(start..start + w)
    }

    /// 读取一个样本的原始字节
    pub fn read_sample(&self, channel: usize, index: usize) -> Result<RawSample, BufferError> {
        let range = self.sample_range(channel, index)?;
        Ok(RawSample::from_slice(&self.data[range]))
    }

    /// 把一个样本按宽度拷到 `dst` 开头，返回拷贝的字节数
    #[inline]
    pub fn copy_step(
        &self,
        channel: usize,
        index: usize,
        dst: &mut [u8],
    ) -> Result<usize, BufferError> {
        let range = self.sample_range(channel, index)?;
        let w = range.len();
        if dst.len() < w {
            return Err(BufferError::ShortDestination {
                have: dst.len(),
                needed: w,
            });
        }
        let src = &self.data[range];
        match w {
            1 => dst[0] = src[0],
            2 => dst[..2].copy_from_slice(&src[..2]),
            3 => dst[..3].copy_from_slice(&src[..3]),
            4 => dst[..4].copy_from_slice(&src[..4]),
            8 => dst[..8].copy_from_slice(&src[..8]),
            other => return Err(BufferError::UnsupportedWidth(other)),
        }
        Ok(w)
    }

    /// 解码为归一化 f64
    pub fn sample_f64(&self, channel: usize, index: usize) -> Option<f64> {
        let range = self.sample_range(channel, index).ok()?;
        Some(self.format.bits.decode(&self.data[range]))
    }

    /// 按当前格式编码写入一个样本（整数钳位，浮点不钳位）
    pub fn set_sample_f64(
        &mut self,
        channel: usize,
        index: usize,
        value: f64,
    ) -> Result<(), BufferError> {
        let range = self.sample_range(channel, index)?;
        self.format.bits.encode(value, &mut self.data[range]);
        Ok(())
    }

    /// 在已有样本上叠加一个值
    pub fn add_sample_f64(
        &mut self,
        channel: usize,
        index: usize,
        value: f64,
    ) -> Result<(), BufferError> {
        let range = self.sample_range(channel, index)?;
        let bits = self.format.bits;
        let raw = &mut self.data[range];
        bits.encode(bits.decode(raw) + value, raw);
        Ok(())
    }

    /// 把 `src` 累加进来（`self[c][i] += src[c][i]`）
    ///
    /// 只覆盖双方都有的声道和样本，返回累加的样本数；
    /// 样本表示不同时不做任何事。
    pub fn mix_from(&mut self, src: &SampleBuffer) -> usize {
        let bits = self.format.bits;
        if src.format.bits != bits {
            return 0;
        }
        let samples = self.requested.min(src.requested);
        let channels = self.format.channels.min(src.format.channels) as usize;
        let len = samples * bits.width();

        for c in 0..channels {
            if let (Some(dst), Some(from)) = (self.channel_mut(c), src.channel(c)) {
                bits.accumulate(&mut dst[..len], &from[..len]);
            }
        }
        samples
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("format", &self.format)
            .field("real_format", &self.real_format)
            .field("capacity", &self.data.len())
            .field("requested", &self.requested)
            .field("last_filled", &self.last_filled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleRate;

    const ALL_BITS: [SampleBits; 10] = [
        SampleBits::S8,
        SampleBits::U8,
        SampleBits::S16,
        SampleBits::U16,
        SampleBits::S24,
        SampleBits::U24,
        SampleBits::S32,
        SampleBits::U32,
        SampleBits::F32,
        SampleBits::F64,
    ];

    fn stereo(bits: SampleBits) -> Format {
        Format::new(SampleRate::R48000, bits, 2)
    }

    #[test]
    fn test_new_sizes() {
        let buf = SampleBuffer::new(stereo(SampleBits::F32), &BufferConfig::default()).unwrap();
        assert_eq!(buf.requested_samples(), 480);
        assert_eq!(buf.capacity(), 1920 * 4 * 2);
        assert_eq!(buf.capacity_samples(), 1920);
        assert_eq!(buf.last_filled_samples(), 0);
    }

    #[test]
    fn test_new_rejects_zero_capacity() {
        let config = BufferConfig {
            block_ms: 0,
            capacity_ms: 0,
        };
        let err = SampleBuffer::new(stereo(SampleBits::S16), &config).unwrap_err();
        assert!(matches!(err, BufferError::ZeroCapacity(_)));

        let bad = Format::new(SampleRate::R48000, SampleBits::S16, 0);
        assert!(SampleBuffer::new(bad, &BufferConfig::default()).is_err());
    }

    #[test]
    fn test_zero_reads_silence_for_all_representations() {
        for bits in ALL_BITS {
            let mut buf = SampleBuffer::with_capacity(stereo(bits), 16, 16).unwrap();
            buf.write_with(stereo(bits), 16, |_, _| 0.5).unwrap();
            buf.zero();
            for c in 0..2 {
                for i in 0..16 {
                    assert_eq!(buf.sample_f64(c, i), Some(0.0), "{} not silent", bits);
                }
            }
        }
    }

    #[test]
    fn test_write_from_roundtrip_bytes() {
        for bits in ALL_BITS {
            let format = stereo(bits);
            let raw: Vec<u8> = (0..format.byte_size(8)).map(|i| (i * 7 + 3) as u8).collect();
            let mut buf = SampleBuffer::with_capacity(format, 4, 16).unwrap();

            buf.write_from(&raw, 8, format).unwrap();
            assert_eq!(buf.requested_samples(), 8);
            assert_eq!(buf.last_filled_samples(), 8);

            let mut out = Vec::new();
            for c in 0..2 {
                out.extend_from_slice(buf.channel(c).unwrap());
            }
            assert_eq!(out, raw, "{} roundtrip differs", bits);
        }
    }

    #[test]
    fn test_write_from_over_capacity_leaves_buffer_unchanged() {
        let format = stereo(SampleBits::S16);
        let mut buf = SampleBuffer::with_capacity(format, 4, 4).unwrap();
        buf.write_with(format, 4, |c, i| (c * 4 + i) as f64 / 16.0).unwrap();

        let wide = stereo(SampleBits::S32);
        let raw = vec![0xAAu8; wide.byte_size(4)];
        let err = buf.write_from(&raw, 4, wide).unwrap_err();
        assert!(matches!(err, BufferError::CapacityExceeded { .. }));

        assert_eq!(*buf.format(), format);
        assert_eq!(buf.requested_samples(), 4);
        assert_eq!(buf.sample_f64(1, 3), Some(7.0 / 16.0));
    }

    #[test]
    fn test_write_from_short_input() {
        let format = stereo(SampleBits::S16);
        let mut buf = SampleBuffer::with_capacity(format, 4, 4).unwrap();
        let err = buf.write_from(&[0u8; 3], 4, format).unwrap_err();
        assert!(matches!(err, BufferError::ShortInput { have: 3, needed: 16 }));
    }

    #[test]
    fn test_read_sample_and_copy_step() {
        let format = stereo(SampleBits::S24);
        let mut buf = SampleBuffer::with_capacity(format, 2, 2).unwrap();
        let raw = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        buf.write_from(&raw, 2, format).unwrap();

        let s = buf.read_sample(1, 0).unwrap();
        assert_eq!(s.as_bytes(), &[7, 8, 9]);
        assert_eq!(s.width(), 3);

        let mut dst = [0u8; 4];
        assert_eq!(buf.copy_step(0, 1, &mut dst).unwrap(), 3);
        assert_eq!(dst, [4, 5, 6, 0]);

        assert!(matches!(
            buf.read_sample(2, 0),
            Err(BufferError::ChannelOutOfRange { .. })
        ));
        assert!(matches!(
            buf.read_sample(0, 2),
            Err(BufferError::IndexOutOfRange { .. })
        ));
        assert!(buf.copy_step(0, 0, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn test_copy_step_eight_byte_samples() {
        let format = stereo(SampleBits::F64);
        let mut buf = SampleBuffer::with_capacity(format, 2, 2).unwrap();
        buf.write_with(format, 2, |c, i| (c * 2 + i) as f64 * 0.125).unwrap();

        let mut dst = [0u8; 8];
        assert_eq!(buf.copy_step(1, 1, &mut dst).unwrap(), 8);
        assert_eq!(f64::from_le_bytes(dst), 0.375);
    }

    #[test]
    fn test_retag_and_reset_for_respect_capacity() {
        let mut buf = SampleBuffer::with_capacity(stereo(SampleBits::S16), 8, 8).unwrap();
        assert!(buf.retag(stereo(SampleBits::S32)).is_err());
        assert!(buf.retag(Format::new(SampleRate::R48000, SampleBits::S32, 1)).is_ok());
        assert_eq!(buf.format().channels, 1);

        // reset_for 回到构造格式（双声道 S16，容量 8 样本）
        assert!(buf.reset_for(9).is_err());
        buf.reset_for(6).unwrap();
        assert_eq!(*buf.format(), stereo(SampleBits::S16));
        assert_eq!(buf.requested_samples(), 6);
        assert_eq!(buf.last_filled_samples(), 0);
    }

    #[test]
    fn test_add_sample() {
        let format = stereo(SampleBits::S16);
        let mut buf = SampleBuffer::with_capacity(format, 4, 4).unwrap();
        buf.write_with(format, 4, |_, _| 0.25).unwrap();
        buf.add_sample_f64(1, 2, 0.5).unwrap();
        assert_eq!(buf.sample_f64(1, 2), Some(0.75));
        assert!(buf.add_sample_f64(2, 0, 0.1).is_err());
    }

    #[test]
    fn test_float_not_clamped_integer_clamped() {
        let mut buf = SampleBuffer::with_capacity(stereo(SampleBits::F32), 1, 1).unwrap();
        buf.set_sample_f64(0, 0, 1.5).unwrap();
        assert_eq!(buf.sample_f64(0, 0), Some(1.5));

        buf.retag(stereo(SampleBits::S16)).unwrap();
        buf.set_sample_f64(0, 0, 1.5).unwrap();
        assert_eq!(buf.sample_f64(0, 0), Some(32_767.0 / 32_768.0));
    }

    #[test]
    fn test_mix_from_overlap() {
        let format = stereo(SampleBits::F32);
        let mono = Format::new(SampleRate::R48000, SampleBits::F32, 1);

        let mut dst = SampleBuffer::with_capacity(format, 4, 4).unwrap();
        dst.write_with(format, 4, |_, _| 0.25).unwrap();
        let mut src = SampleBuffer::with_capacity(mono, 2, 4).unwrap();
        src.write_with(mono, 2, |_, _| 0.5).unwrap();

        assert_eq!(dst.mix_from(&src), 2);
        assert_eq!(dst.sample_f64(0, 1), Some(0.75));
        assert_eq!(dst.sample_f64(0, 2), Some(0.25));
        assert_eq!(dst.sample_f64(1, 0), Some(0.25));
    }
}
