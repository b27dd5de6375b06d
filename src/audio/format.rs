//! 音频格式描述与格式协商
//!
//! - `SampleRate`: 规范采样率 + 任意整数采样率
//! - `SampleBits`: 样本表示（有符号/无符号整数、浮点）及位宽
//! - `ChannelLayout`: 声道角色位掩码，每个角色占一位
//! - `Format::merge`: 计算能容纳多个输入的"超集"格式
//!
//! 样本在缓冲区中统一按小端存储；整数样本解码为 f64 时归一化到 [-1, 1)。

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// 单个格式允许的最大声道数
pub const MAX_CHANNELS: u16 = 32;

/// 格式错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid channel count {0} (expected 1..=32)")]
    InvalidChannels(u16),
    #[error("sample rate must be non-zero")]
    ZeroRate,
    #[error("layout describes {layout} channels but format declares {channels}")]
    LayoutMismatch { layout: u16, channels: u16 },
    #[error("unknown sample representation '{0}'")]
    UnknownBits(String),
}

/// 采样率
///
/// 规范采样率有独立的变体，其它值落入 `Custom`。
/// 比较和排序一律按 Hz 进行，`Custom(48000)` 与 `R48000` 相等。
#[derive(Clone, Copy, Debug)]
pub enum SampleRate {
    R44100,
    R48000,
    R88200,
    R96000,
    R192000,
    R352800,
    R384000,
    R2822400,
    R5644800,
    Custom(u32),
}

impl SampleRate {
    /// 从 Hz 构造，规范值映射到对应变体
    pub const fn from_hz(hz: u32) -> Self {
        match hz {
            44_100 => Self::R44100,
            48_000 => Self::R48000,
            88_200 => Self::R88200,
            96_000 => Self::R96000,
            192_000 => Self::R192000,
            352_800 => Self::R352800,
            384_000 => Self::R384000,
            2_822_400 => Self::R2822400,
            5_644_800 => Self::R5644800,
            other => Self::Custom(other),
        }
    }

    #[inline]
    pub const fn hz(self) -> u32 {
        match self {
            Self::R44100 => 44_100,
            Self::R48000 => 48_000,
            Self::R88200 => 88_200,
            Self::R96000 => 96_000,
            Self::R192000 => 192_000,
            Self::R352800 => 352_800,
            Self::R384000 => 384_000,
            Self::R2822400 => 2_822_400,
            Self::R5644800 => 5_644_800,
            Self::Custom(hz) => hz,
        }
    }

    pub const fn is_canonical(self) -> bool {
        !matches!(Self::from_hz(self.hz()), Self::Custom(_))
    }

    /// 指定时长（毫秒）对应的每声道样本数
    #[inline]
    pub const fn samples_for_ms(self, ms: u32) -> usize {
        (self.hz() as u64 * ms as u64 / 1000) as usize
    }
}

impl From<u32> for SampleRate {
    fn from(hz: u32) -> Self {
        Self::from_hz(hz)
    }
}

impl PartialEq for SampleRate {
    fn eq(&self, other: &Self) -> bool {
        self.hz() == other.hz()
    }
}

impl Eq for SampleRate {}

impl std::hash::Hash for SampleRate {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hz().hash(state);
    }
}

impl PartialOrd for SampleRate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SampleRate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hz().cmp(&other.hz())
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hz())
    }
}

/// 样本表示
///
/// 变体顺序即"宽度"顺序：先按位宽，同位宽下有符号 < 无符号 < 浮点。
/// `merge` 依赖这个顺序选出较宽的一方。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SampleBits {
    S8,
    U8,
    S16,
    U16,
    S24,
    U24,
    S32,
    U32,
    F32,
    F64,
}

impl SampleBits {
    /// 单样本字节数
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 => 2,
            Self::S24 | Self::U24 => 3,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.width() as u32 * 8
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[inline]
    pub const fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U24 | Self::U32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::S8 => "s8",
            Self::U8 => "u8",
            Self::S16 => "s16le",
            Self::U16 => "u16le",
            Self::S24 => "s24le",
            Self::U24 => "u24le",
            Self::S32 => "s32le",
            Self::U32 => "u32le",
            Self::F32 => "f32le",
            Self::F64 => "f64le",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, FormatError> {
        let bits = match name.to_ascii_lowercase().as_str() {
            "s8" => Self::S8,
            "u8" | "8" => Self::U8,
            "s16le" | "s16" | "16" => Self::S16,
            "u16le" | "u16" => Self::U16,
            "s24le" | "s24" | "24" => Self::S24,
            "u24le" | "u24" => Self::U24,
            "s32le" | "s32" | "32" => Self::S32,
            "u32le" | "u32" => Self::U32,
            "f32le" | "f32" | "32f" => Self::F32,
            "f64le" | "f64" | "64f" => Self::F64,
            _ => return Err(FormatError::UnknownBits(name.to_string())),
        };
        Ok(bits)
    }

    /// 将一个样本的原始字节解码为 f64
    ///
    /// 整数归一化到 [-1, 1)，无符号整数以中点为 0；浮点原样返回。
    /// `raw` 长度必须不小于 `width()`。
    #[inline]
    pub fn decode(self, raw: &[u8]) -> f64 {
        match self {
            Self::S8 => raw[0] as i8 as f64 / 128.0,
            Self::U8 => (raw[0] as f64 - 128.0) / 128.0,
            Self::S16 => i16::from_le_bytes([raw[0], raw[1]]) as f64 / 32_768.0,
            Self::U16 => (u16::from_le_bytes([raw[0], raw[1]]) as f64 - 32_768.0) / 32_768.0,
            Self::S24 => read_s24(raw) as f64 / 8_388_608.0,
            Self::U24 => (read_u24(raw) as f64 - 8_388_608.0) / 8_388_608.0,
            Self::S32 => {
                i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64 / 2_147_483_648.0
            }
            Self::U32 => {
                (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64 - 2_147_483_648.0)
                    / 2_147_483_648.0
            }
            Self::F32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
            Self::F64 => f64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
        }
    }

    /// 将 f64 编码为一个样本写入 `out`
    ///
    /// 整数表示会四舍五入并钳位到可表示范围，浮点不钳位。
    #[inline]
    pub fn encode(self, value: f64, out: &mut [u8]) {
        match self {
            Self::S8 => out[0] = (value * 128.0).round().clamp(-128.0, 127.0) as i8 as u8,
            Self::U8 => out[0] = ((value * 128.0).round() + 128.0).clamp(0.0, 255.0) as u8,
            Self::S16 => {
                let v = (value * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Self::U16 => {
                let v = ((value * 32_768.0).round() + 32_768.0).clamp(0.0, 65_535.0) as u16;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Self::S24 => {
                let v = (value * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                write_24(v as u32, out);
            }
            Self::U24 => {
                let v = ((value * 8_388_608.0).round() + 8_388_608.0).clamp(0.0, 16_777_215.0);
                write_24(v as u32, out);
            }
            Self::S32 => {
                let v = (value * 2_147_483_648.0)
                    .round()
                    .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                out[..4].copy_from_slice(&v.to_le_bytes());
            }
            Self::U32 => {
                let v = ((value * 2_147_483_648.0).round() + 2_147_483_648.0)
                    .clamp(0.0, 4_294_967_295.0) as u32;
                out[..4].copy_from_slice(&v.to_le_bytes());
            }
            Self::F32 => out[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            Self::F64 => out[..8].copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// 用静音填充一段样本
    ///
    /// 有符号整数和浮点的静音是全 0 字节；无符号整数的静音是中点。
    pub fn fill_silence(self, data: &mut [u8]) {
        if self.is_unsigned() {
            for raw in data.chunks_exact_mut(self.width()) {
                self.encode(0.0, raw);
            }
        } else {
            data.fill(0);
        }
    }

    /// 逐样本累加：`dst[i] += src[i]`
    ///
    /// 浮点直接相加；整数使用回绕运算，不做削波。
    pub fn accumulate(self, dst: &mut [u8], src: &[u8]) {
        let w = self.width();
        for (d, s) in dst.chunks_exact_mut(w).zip(src.chunks_exact(w)) {
            match self {
                Self::S8 => d[0] = (d[0] as i8).wrapping_add(s[0] as i8) as u8,
                Self::U8 => d[0] = d[0].wrapping_add(s[0]).wrapping_sub(0x80),
                Self::S16 => {
                    let v = i16::from_le_bytes([d[0], d[1]])
                        .wrapping_add(i16::from_le_bytes([s[0], s[1]]));
                    d.copy_from_slice(&v.to_le_bytes());
                }
                Self::U16 => {
                    let v = u16::from_le_bytes([d[0], d[1]])
                        .wrapping_add(u16::from_le_bytes([s[0], s[1]]))
                        .wrapping_sub(0x8000);
                    d.copy_from_slice(&v.to_le_bytes());
                }
                Self::S24 => write_24(read_s24(d).wrapping_add(read_s24(s)) as u32, d),
                Self::U24 => {
                    write_24(read_u24(d).wrapping_add(read_u24(s)).wrapping_sub(0x80_0000), d)
                }
                Self::S32 => {
                    let v = i32::from_le_bytes([d[0], d[1], d[2], d[3]])
                        .wrapping_add(i32::from_le_bytes([s[0], s[1], s[2], s[3]]));
                    d.copy_from_slice(&v.to_le_bytes());
                }
                Self::U32 => {
                    let v = u32::from_le_bytes([d[0], d[1], d[2], d[3]])
                        .wrapping_add(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
                        .wrapping_sub(0x8000_0000);
                    d.copy_from_slice(&v.to_le_bytes());
                }
                Self::F32 => {
                    let v = f32::from_le_bytes([d[0], d[1], d[2], d[3]])
                        + f32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    d.copy_from_slice(&v.to_le_bytes());
                }
                Self::F64 => {
                    let v = self.decode(d) + self.decode(s);
                    d.copy_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    /// 逐样本乘以标量增益
    pub fn scale(self, data: &mut [u8], gain: f64) {
        let w = self.width();
        for raw in data.chunks_exact_mut(w) {
            let v = self.decode(raw) * gain;
            self.encode(v, raw);
        }
    }
}

impl FromStr for SampleBits {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for SampleBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// little-endian 24-bit 有符号解码（符号扩展到 i32）
#[inline]
fn read_s24(raw: &[u8]) -> i32 {
    let v = (raw[0] as i32) | ((raw[1] as i32) << 8) | ((raw[2] as i32) << 16);
    // 先左移把符号位移到 bit31，再算术右移恢复
    (v << 8) >> 8
}

#[inline]
fn read_u24(raw: &[u8]) -> u32 {
    (raw[0] as u32) | ((raw[1] as u32) << 8) | ((raw[2] as u32) << 16)
}

/// 取低 24 位按 little-endian 写出
#[inline]
fn write_24(v: u32, out: &mut [u8]) {
    out[0] = (v & 0xFF) as u8;
    out[1] = ((v >> 8) & 0xFF) as u8;
    out[2] = ((v >> 16) & 0xFF) as u8;
}

/// 声道角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    FrontLeft = 1,
    FrontRight,
    FrontCenter,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
}

impl Channel {
    pub const ALL: [Channel; 18] = [
        Self::FrontLeft,
        Self::FrontRight,
        Self::FrontCenter,
        Self::FrontLeftOfCenter,
        Self::FrontRightOfCenter,
        Self::LowFrequency,
        Self::BackLeft,
        Self::BackRight,
        Self::BackCenter,
        Self::SideLeft,
        Self::SideRight,
        Self::TopCenter,
        Self::TopFrontLeft,
        Self::TopFrontCenter,
        Self::TopFrontRight,
        Self::TopBackLeft,
        Self::TopBackCenter,
        Self::TopBackRight,
    ];

    /// 该角色在布局掩码中的位
    #[inline]
    pub const fn mask(self) -> u32 {
        1 << (self as u8 - 1)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::FrontLeft => "Front Left",
            Self::FrontRight => "Front Right",
            Self::FrontCenter => "Front Center",
            Self::FrontLeftOfCenter => "Front Left Of Center",
            Self::FrontRightOfCenter => "Front Right Of Center",
            Self::LowFrequency => "Subwoofer",
            Self::BackLeft => "Rear Left",
            Self::BackRight => "Rear Right",
            Self::BackCenter => "Rear Center",
            Self::SideLeft => "Side Left",
            Self::SideRight => "Side Right",
            Self::TopCenter => "Top Center",
            Self::TopFrontLeft => "Top Front Left",
            Self::TopFrontCenter => "Top Front Center",
            Self::TopFrontRight => "Top Front Right",
            Self::TopBackLeft => "Top Rear Left",
            Self::TopBackCenter => "Top Rear Center",
            Self::TopBackRight => "Top Rear Right",
        }
    }
}

/// 声道布局位掩码
///
/// 声道在缓冲区中的顺序就是掩码中置位的顺序（低位在前）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelLayout(u32);

impl ChannelLayout {
    pub const EMPTY: Self = Self(0);
    pub const MONO: Self = Self(Channel::FrontCenter.mask());
    pub const STEREO: Self = Self(Channel::FrontLeft.mask() | Channel::FrontRight.mask());
    pub const SURROUND_2_1: Self = Self(Self::STEREO.0 | Channel::LowFrequency.mask());
    pub const QUAD: Self =
        Self(Self::STEREO.0 | Channel::BackLeft.mask() | Channel::BackRight.mask());
    pub const SURROUND_5_0: Self = Self(Self::QUAD.0 | Channel::FrontCenter.mask());
    pub const SURROUND_5_1: Self = Self(Self::SURROUND_5_0.0 | Channel::LowFrequency.mask());
    pub const SURROUND_7_1: Self =
        Self(Self::SURROUND_5_1.0 | Channel::SideLeft.mask() | Channel::SideRight.mask());

    pub const fn from_mask(mask: u32) -> Self {
        Self(mask)
    }

    pub fn from_channels(channels: &[Channel]) -> Self {
        Self(channels.iter().fold(0, |mask, ch| mask | ch.mask()))
    }

    /// 指定声道数的默认布局；没有约定布局的声道数返回空掩码
    pub const fn default_for(channels: u16) -> Self {
        match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            3 => Self::SURROUND_2_1,
            4 => Self::QUAD,
            5 => Self::SURROUND_5_0,
            6 => Self::SURROUND_5_1,
            8 => Self::SURROUND_7_1,
            _ => Self::EMPTY,
        }
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn count(self) -> u16 {
        self.0.count_ones() as u16
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, channel: Channel) -> bool {
        self.0 & channel.mask() != 0
    }

    /// 第 `index` 个声道的角色
    pub fn channel_at(self, index: usize) -> Option<Channel> {
        self.channels().nth(index)
    }

    /// 角色在布局中的声道序号
    pub fn index_of(self, channel: Channel) -> Option<usize> {
        if !self.contains(channel) {
            return None;
        }
        Some((self.0 & (channel.mask() - 1)).count_ones() as usize)
    }

    pub fn channels(self) -> impl Iterator<Item = Channel> {
        Channel::ALL.into_iter().filter(move |ch| self.contains(*ch))
    }
}

/// 音频格式
///
/// 相等性比较采样率、样本表示、布局与声道数。
#[derive(Clone, Copy, Debug, Eq, Hash)]
pub struct Format {
    pub rate: SampleRate,
    pub bits: SampleBits,
    pub channels: u16,
    pub layout: ChannelLayout,
}

impl Format {
    /// 使用默认布局创建格式
    pub const fn new(rate: SampleRate, bits: SampleBits, channels: u16) -> Self {
        Self {
            rate,
            bits,
            channels,
            layout: ChannelLayout::default_for(channels),
        }
    }

    /// 由布局推导声道数
    pub const fn with_layout(rate: SampleRate, bits: SampleBits, layout: ChannelLayout) -> Self {
        Self {
            rate,
            bits,
            channels: layout.count(),
            layout,
        }
    }

    /// merge 的起点：任何格式与它合并都得到该格式本身
    pub const fn empty() -> Self {
        Self {
            rate: SampleRate::Custom(0),
            bits: SampleBits::S8,
            channels: 0,
            layout: ChannelLayout::EMPTY,
        }
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.rate.hz() == 0 {
            return Err(FormatError::ZeroRate);
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(FormatError::InvalidChannels(self.channels));
        }
        if !self.layout.is_empty() && self.layout.count() != self.channels {
            return Err(FormatError::LayoutMismatch {
                layout: self.layout.count(),
                channels: self.channels,
            });
        }
        Ok(())
    }

    /// `samples` 个样本（每声道）占用的字节数
    #[inline]
    pub const fn byte_size(&self, samples: usize) -> usize {
        samples * self.bits.width() * self.channels as usize
    }

    /// 与 `other` 合并，使 self 足以容纳两者
    ///
    /// - 采样率取较大者
    /// - 样本表示取较宽者
    /// - 声道取数量较多的一方，连同其布局整体替换（不是并集，数量相同时保留 self）
    pub fn merge(&mut self, other: &Format) {
        if self.rate < other.rate {
            self.rate = other.rate;
        }
        if self.bits < other.bits {
            self.bits = other.bits;
        }
        // TODO: 布局取并集，需要先让下游转码器能处理任意掩码
        if self.channels < other.channels {
            self.channels = other.channels;
            self.layout = other.layout;
        }
    }

    pub fn merged(mut self, other: &Format) -> Format {
        self.merge(other);
        self
    }
}

impl PartialEq for Format {
    fn eq(&self, other: &Self) -> bool {
        self.rate == other.rate
            && self.bits == other.bits
            && self.layout == other.layout
            && self.channels == other.channels
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rate, self.channels, self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(hz: u32, bits: SampleBits, channels: u16) -> Format {
        Format::new(SampleRate::from_hz(hz), bits, channels)
    }

    #[test]
    fn test_rate_canonical() {
        assert!(matches!(SampleRate::from_hz(48_000), SampleRate::R48000));
        assert!(matches!(SampleRate::from_hz(22_050), SampleRate::Custom(22_050)));
        assert_eq!(SampleRate::Custom(44_100), SampleRate::R44100);
        assert!(SampleRate::R44100 < SampleRate::R48000);
        assert!(SampleRate::Custom(8_000) < SampleRate::R44100);
        assert_eq!(SampleRate::R48000.samples_for_ms(10), 480);
    }

    #[test]
    fn test_bits_order_and_width() {
        assert!(SampleBits::S16 < SampleBits::S24);
        assert!(SampleBits::S32 < SampleBits::F32);
        assert!(SampleBits::F32 < SampleBits::F64);
        assert_eq!(SampleBits::S24.width(), 3);
        assert_eq!(SampleBits::F64.width(), 8);
        assert_eq!("f32".parse::<SampleBits>().unwrap(), SampleBits::F32);
        assert_eq!(SampleBits::from_name("24").unwrap(), SampleBits::S24);
        assert!(SampleBits::from_name("f16").is_err());
    }

    #[test]
    fn test_merge_rate_is_max() {
        let pairs = [
            (fmt(44_100, SampleBits::S16, 2), fmt(48_000, SampleBits::S16, 1)),
            (fmt(96_000, SampleBits::F32, 1), fmt(8_000, SampleBits::U8, 6)),
            (fmt(22_050, SampleBits::S24, 2), fmt(22_050, SampleBits::F64, 2)),
        ];
        for (a, b) in pairs {
            let ab = a.merged(&b);
            let ba = b.merged(&a);
            assert_eq!(ab.rate, a.rate.max(b.rate));
            assert_eq!(ab.rate, ba.rate);
            // 幂等：再次合并 b 不改变结果
            assert_eq!(ab.merged(&b), ab);
        }
    }

    #[test]
    fn test_merge_takes_wider_side_wholesale() {
        let a = Format::with_layout(
            SampleRate::R48000,
            SampleBits::S16,
            ChannelLayout::from_channels(&[Channel::FrontLeft, Channel::LowFrequency]),
        );
        let b = Format::with_layout(SampleRate::R44100, SampleBits::F32, ChannelLayout::STEREO);

        // 声道数相同：保留 self 的布局
        let m = a.merged(&b);
        assert_eq!(m.layout, a.layout);
        assert_eq!(m.bits, SampleBits::F32);
        assert_eq!(m.rate, SampleRate::R48000);

        // 声道更多的一方整体替换布局，不取并集
        let c = fmt(44_100, SampleBits::U8, 6);
        let m = a.merged(&c);
        assert_eq!(m.layout, ChannelLayout::SURROUND_5_1);
        assert_eq!(m.channels, 6);
    }

    #[test]
    fn test_merge_from_empty() {
        let f = fmt(48_000, SampleBits::F32, 2);
        assert_eq!(Format::empty().merged(&f), f);
    }

    #[test]
    fn test_layout_helpers() {
        let l = ChannelLayout::SURROUND_5_1;
        assert_eq!(l.count(), 6);
        assert_eq!(l.channel_at(0), Some(Channel::FrontLeft));
        assert_eq!(l.index_of(Channel::LowFrequency), Some(3));
        assert_eq!(l.index_of(Channel::SideLeft), None);
        assert_eq!(ChannelLayout::default_for(7), ChannelLayout::EMPTY);
    }

    #[test]
    fn test_validate() {
        assert!(fmt(48_000, SampleBits::S16, 2).validate().is_ok());
        assert_eq!(
            fmt(48_000, SampleBits::S16, 0).validate(),
            Err(FormatError::InvalidChannels(0))
        );
        assert_eq!(
            fmt(48_000, SampleBits::S16, 33).validate(),
            Err(FormatError::InvalidChannels(33))
        );
        assert_eq!(fmt(0, SampleBits::S16, 2).validate(), Err(FormatError::ZeroRate));
        // 7 声道没有默认布局，空掩码是允许的
        assert!(fmt(48_000, SampleBits::S16, 7).validate().is_ok());

        let mut bad = fmt(48_000, SampleBits::S16, 2);
        bad.channels = 3;
        assert!(matches!(bad.validate(), Err(FormatError::LayoutMismatch { .. })));
    }

    #[test]
    fn test_equality_ignores_rate_variant_spelling() {
        let a = fmt(44_100, SampleBits::S16, 2);
        let mut b = a;
        b.rate = SampleRate::Custom(44_100);
        assert_eq!(a, b);
        b.bits = SampleBits::S24;
        assert_ne!(a, b);
    }

    #[test]
    fn test_24bit_sign_extend() {
        let bits = SampleBits::S24;

        // 最大正值: 0x7FFFFF
        assert!(bits.decode(&[0xFF, 0xFF, 0x7F]) > 0.999);
        // 最小负值: 0x800000
        assert_eq!(bits.decode(&[0x00, 0x00, 0x80]), -1.0);
        // -1: 0xFFFFFF
        assert_eq!(bits.decode(&[0xFF, 0xFF, 0xFF]), -1.0 / 8_388_608.0);
    }

    #[test]
    fn test_integer_codec_roundtrip() {
        let cases: [(SampleBits, &[u8]); 8] = [
            (SampleBits::S8, &[0x80]),
            (SampleBits::U8, &[0x00]),
            (SampleBits::S16, &[0x00, 0xC0]),
            (SampleBits::U16, &[0xFF, 0xFF]),
            (SampleBits::S24, &[0x00, 0x00, 0xC0]),
            (SampleBits::U24, &[0x01, 0x00, 0x80]),
            (SampleBits::S32, &[0x00, 0x00, 0x00, 0x80]),
            (SampleBits::U32, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for (bits, raw) in cases {
            let mut out = [0u8; 8];
            bits.encode(bits.decode(raw), &mut out);
            assert_eq!(&out[..bits.width()], raw, "{} roundtrip failed", bits);
        }
    }

    #[test]
    fn test_unsigned_silence_is_midpoint() {
        let mut data = [0u8; 6];
        SampleBits::U16.fill_silence(&mut data);
        assert_eq!(data, [0x00, 0x80, 0x00, 0x80, 0x00, 0x80]);
        for raw in data.chunks_exact(2) {
            assert_eq!(SampleBits::U16.decode(raw), 0.0);
        }
    }

    #[test]
    fn test_accumulate_wraps_without_clipping() {
        let mut dst = 30_000i16.to_le_bytes();
        let src = 10_000i16.to_le_bytes();
        SampleBits::S16.accumulate(&mut dst, &src);
        assert_eq!(i16::from_le_bytes(dst), 30_000i16.wrapping_add(10_000));

        let mut dst = [0u8; 4];
        let mut src = [0u8; 4];
        SampleBits::F32.encode(0.75, &mut dst);
        SampleBits::F32.encode(0.75, &mut src);
        SampleBits::F32.accumulate(&mut dst, &src);
        assert_eq!(SampleBits::F32.decode(&dst), 1.5);

        // 无符号：两个静音相加仍是静音
        let mut dst = [0x80u8];
        SampleBits::U8.accumulate(&mut dst, &[0x80]);
        assert_eq!(dst, [0x80]);
    }

    #[test]
    fn test_display() {
        assert_eq!(fmt(48_000, SampleBits::F32, 2).to_string(), "48000/2/f32le");
    }
}
