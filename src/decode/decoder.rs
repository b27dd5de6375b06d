//! 音频文件解码
//!
//! symphonia 解码 FLAC / WAV / AIFF / MP3，输出交织的 i32 样本，
//! 整数源左对齐到高位（16-bit 左移 16 位，24-bit 左移 8 位），
//! 浮点源按 2^31 缩放。这样所有源都可以按 S32 解释。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use symphonia::core::units::Time;
use thiserror::Error;

use crate::audio::format::FormatError;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[source] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("seek failed: {0}")]
    SeekFailed(String),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("failed to start decoder thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u32,
    /// 原始位深度
    pub bit_depth: Option<u32>,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 容器名称（取扩展名）
    pub format: String,
    pub codec: String,
}

pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    samples: Vec<i32>,
}

impl AudioDecoder {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path).map_err(DecodeError::FileOpen)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let opened = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;
        let reader = opened.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let total_frames = params.n_frames;
        let info = AudioInfo {
            sample_rate,
            channels: params.channels.map(|c| c.count() as u32).unwrap_or(2),
            bit_depth: params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: path
                .extension()
                .and_then(|e| e.to_str())
                .map(|s| s.to_uppercase())
                .unwrap_or_else(|| "Unknown".to_string()),
            codec: symphonia::default::get_codecs()
                .get_codec(params.codec)
                .map(|c| c.short_name.to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
        };

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        log::debug!(
            "Opened {}: {} Hz, {} ch, {:?} bit, codec {}",
            path.display(),
            info.sample_rate,
            info.channels,
            info.bit_depth,
            info.codec
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            // 8192 帧 × 8 声道，覆盖常见格式的单包大小
            samples: Vec::with_capacity(65_536),
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一个包，返回交织的左对齐 i32；空切片表示文件结束
    pub fn decode_next_i32(&mut self) -> Result<&[i32], DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(&[]);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 损坏的帧直接跳过
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let total = decoded.frames() * decoded.spec().channels.count();
            if self.samples.len() < total {
                self.samples.resize(total, 0);
            }

            let out = &mut self.samples[..total];
            match decoded {
                AudioBufferRef::U8(buf) => interleave(&buf, out, |s| (s as i32 - 0x80) << 24),
                AudioBufferRef::S8(buf) => interleave(&buf, out, |s| (s as i32) << 24),
                AudioBufferRef::U16(buf) => interleave(&buf, out, |s| (s as i32 - 0x8000) << 16),
                AudioBufferRef::S16(buf) => interleave(&buf, out, |s| (s as i32) << 16),
                AudioBufferRef::U24(buf) => {
                    interleave(&buf, out, |s| (s.inner() as i32 - 0x80_0000) << 8)
                }
                AudioBufferRef::S24(buf) => interleave(&buf, out, |s| s.inner() << 8),
                AudioBufferRef::U32(buf) => {
                    interleave(&buf, out, |s| s.wrapping_sub(0x8000_0000) as i32)
                }
                AudioBufferRef::S32(buf) => interleave(&buf, out, |s| s),
                AudioBufferRef::F32(buf) => interleave(&buf, out, |s| float_to_i32(s as f64)),
                AudioBufferRef::F64(buf) => interleave(&buf, out, float_to_i32),
            }

            return Ok(&self.samples[..total]);
        }
    }

    /// 跳到指定时间（秒）
    pub fn seek(&mut self, time_secs: f64) -> Result<(), DecodeError> {
        let time_secs = time_secs.max(0.0);
        let seek_to = SeekTo::Time {
            time: Time::new(time_secs as u64, time_secs.fract()),
            track_id: Some(self.track_id),
        };
        self.reader
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;
        self.decoder.reset();
        Ok(())
    }
}

/// 平面 → 交织，同时逐样本转换
#[inline]
fn interleave<S: Sample>(buf: &AudioBuffer<S>, out: &mut [i32], to_i32: impl Fn(S) -> i32) {
    let channels = buf.spec().channels.count();
    for ch in 0..channels {
        for (frame, &s) in buf.chan(ch).iter().enumerate() {
            out[frame * channels + ch] = to_i32(s);
        }
    }
}

#[inline]
fn float_to_i32(v: f64) -> i32 {
    (v * 2_147_483_648.0)
        .round()
        .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_i32_saturates() {
        assert_eq!(float_to_i32(0.0), 0);
        assert_eq!(float_to_i32(0.5), 1 << 30);
        assert_eq!(float_to_i32(1.0), i32::MAX);
        assert_eq!(float_to_i32(-2.0), i32::MIN);
    }

    #[test]
    fn test_open_missing_file() {
        let err = AudioDecoder::open("/definitely/not/here.flac").err().unwrap();
        assert!(matches!(err, DecodeError::FileOpen(_)));
    }

    #[test]
    fn test_decode_wav_left_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..100i16 {
            writer.write_sample(i).unwrap();
            writer.write_sample(-i).unwrap();
        }
        writer.finalize().unwrap();

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(decoder.info().sample_rate, 44_100);
        assert_eq!(decoder.info().channels, 2);
        assert_eq!(decoder.info().format, "WAV");

        let mut all = Vec::new();
        loop {
            let samples = decoder.decode_next_i32().unwrap();
            if samples.is_empty() {
                break;
            }
            all.extend_from_slice(samples);
        }
        assert_eq!(all.len(), 200);
        assert_eq!(all[2], 1 << 16);
        assert_eq!(all[3], -(1 << 16));
    }
}
