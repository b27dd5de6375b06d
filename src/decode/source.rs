//! 文件源
//!
//! 后台线程解码文件写入 SPSC 环形缓冲区，`pull` 只做非阻塞读取。
//! 样本按 S32 输出，数据不足时返回短块（转换器攒够一块再重采样）。
//!
//! seek 协议（无锁）：
//! 1. 控制端写入目标时间，状态置 `SEEK_REQUESTED`
//! 2. 解码线程 seek 后停止写入，`SEEK_REQUESTED` → `SEEK_FLUSH`
//! 3. 拉取端看到 `SEEK_FLUSH` 清空环形缓冲区，`SEEK_FLUSH` → `SEEK_IDLE`
//!
//! 2 和 3 都用 compare_exchange，期间到达的新请求不会被覆盖。
//! 解码线程只在 `SEEK_IDLE` 时写入，所以清空发生在状态切换之前。

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use super::decoder::{AudioDecoder, AudioInfo, DecodeError};
use crate::audio::buffer::{BufferConfig, SampleBuffer};
use crate::audio::format::{Format, SampleBits, SampleRate};
use crate::audio::ring_buffer::RingBuffer;
use crate::element::{Source, SourceError};

const SEEK_IDLE: u8 = 0;
const SEEK_REQUESTED: u8 = 1;
const SEEK_FLUSH: u8 = 2;

/// 环形缓冲区 = 缓冲区容量的倍数
const RING_BLOCKS: usize = 8;

/// 缓冲区满或已到结尾时解码线程的等待时间
const IDLE_WAIT: Duration = Duration::from_millis(5);

struct Shared {
    ring: RingBuffer<i32>,
    running: AtomicBool,
    eof: AtomicBool,
    seek: AtomicU8,
    seek_target: AtomicU64,
}

/// 跨线程的控制句柄
#[derive(Clone)]
pub struct DecoderControl {
    shared: Arc<Shared>,
    thread: Thread,
    channels: usize,
}

impl DecoderControl {
    /// 请求跳转到 `secs`；调用方随后应重置该源的转换器
    pub fn seek(&self, secs: f64) {
        self.shared.seek_target.store(secs.to_bits(), Ordering::Release);
        self.shared.seek.store(SEEK_REQUESTED, Ordering::Release);
        self.thread.unpark();
    }

    /// 文件已解码完毕（缓冲区里可能还有数据）
    pub fn is_eof(&self) -> bool {
        self.shared.eof.load(Ordering::Acquire)
    }

    /// 解码完毕且缓冲区已读空
    pub fn is_finished(&self) -> bool {
        self.is_eof() && self.shared.ring.available() == 0
    }

    /// 缓冲区中可读的帧数
    pub fn available_frames(&self) -> usize {
        self.shared.ring.available() / self.channels
    }

    /// 等到至少 `frames` 帧可读或文件结束，超时返回 false
    pub fn wait_ready(&self, frames: usize, timeout: Duration) -> bool {
        let frames = frames.min(self.shared.ring.capacity() / self.channels);
        let deadline = Instant::now() + timeout;
        loop {
            if self.available_frames() >= frames || self.is_eof() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.thread.unpark();
            thread::sleep(Duration::from_millis(1));
        }
    }
}

pub struct DecoderSource {
    format: Format,
    info: AudioInfo,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    /// 交织读取暂存，容量 = 缓冲区容量
    interleaved: Vec<i32>,
}

impl DecoderSource {
    pub fn open<P: AsRef<Path>>(path: P, config: &BufferConfig) -> Result<Self, DecodeError> {
        let decoder = AudioDecoder::open(path)?;
        let info = decoder.info().clone();

        let format = Format::new(
            SampleRate::from_hz(info.sample_rate),
            SampleBits::S32,
            info.channels as u16,
        );
        format.validate()?;

        let channels = format.channels as usize;
        let block = config.capacity_samples(&format) * channels;
        let shared = Arc::new(Shared {
            ring: RingBuffer::new(block * RING_BLOCKS),
            running: AtomicBool::new(true),
            eof: AtomicBool::new(false),
            seek: AtomicU8::new(SEEK_IDLE),
            seek_target: AtomicU64::new(0),
        });
        if let Err(e) = shared.ring.lock_memory() {
            log::debug!("Decoder ring not locked: {}", e);
        }

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("decoder".to_string())
                .spawn(move || decode_loop(decoder, shared, channels))
                .map_err(DecodeError::Thread)?
        };

        log::info!(
            "Decoder source {} ({} {}, ring {} samples)",
            format,
            info.format,
            info.codec,
            shared.ring.capacity()
        );

        Ok(Self {
            format,
            info,
            shared,
            thread: Some(thread),
            interleaved: vec![0; block],
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    pub fn control(&self) -> DecoderControl {
        DecoderControl {
            shared: Arc::clone(&self.shared),
            thread: match &self.thread {
                Some(handle) => handle.thread().clone(),
                None => thread::current(),
            },
            channels: self.format.channels as usize,
        }
    }

    fn wake(&self) {
        if let Some(handle) = &self.thread {
            handle.thread().unpark();
        }
    }
}

impl Shared {
    /// 拉取端完成 flush；返回 false 表示期间又来了新的 seek 请求
    fn complete_flush(&self) -> bool {
        self.ring.clear();
        self.seek
            .compare_exchange(SEEK_FLUSH, SEEK_IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Source for DecoderSource {
    fn pull(&mut self, buffer: &mut SampleBuffer) -> Result<usize, SourceError> {
        if self.shared.seek.load(Ordering::Acquire) == SEEK_FLUSH {
            self.shared.complete_flush();
            self.wake();
            return Ok(0);
        }

        let channels = self.format.channels as usize;
        let want = (buffer.requested_samples() * channels).min(self.interleaved.len());
        let want = want - want % channels;
        let read = self.shared.ring.read(&mut self.interleaved[..want]);

        if self.shared.ring.fill_ratio() < 0.5 {
            self.wake();
        }

        let frames = read / channels;
        if frames == 0 {
            return Ok(0);
        }

        let data = &self.interleaved;
        buffer.write_with(self.format, frames, |c, i| {
            data[i * channels + c] as f64 / 2_147_483_648.0
        })?;
        Ok(frames)
    }

    fn native_format(&self) -> Format {
        self.format
    }

    fn is_finished(&self) -> bool {
        self.shared.seek.load(Ordering::Acquire) == SEEK_IDLE
            && self.shared.eof.load(Ordering::Acquire)
            && self.shared.ring.available() == 0
    }
}

impl Drop for DecoderSource {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Decoder thread panicked");
            }
        }
    }
}

fn decode_loop(mut decoder: AudioDecoder, shared: Arc<Shared>, channels: usize) {
    let mut pending: Vec<i32> = Vec::with_capacity(65_536);
    let mut offset = 0;

    while shared.running.load(Ordering::Acquire) {
        match shared.seek.load(Ordering::Acquire) {
            SEEK_REQUESTED => {
                let target = f64::from_bits(shared.seek_target.load(Ordering::Acquire));
                match decoder.seek(target) {
                    Ok(()) => log::debug!("Decoder seek to {:.3}s", target),
                    Err(e) => log::warn!("Decoder seek to {:.3}s failed: {}", target, e),
                }
                pending.clear();
                offset = 0;
                shared.eof.store(false, Ordering::Release);
                // 只有在没有新请求时才进入 flush，否则下一轮重新 seek
                let _ = shared.seek.compare_exchange(
                    SEEK_REQUESTED,
                    SEEK_FLUSH,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            SEEK_FLUSH => {
                thread::park_timeout(IDLE_WAIT);
                continue;
            }
            _ => {}
        }

        if offset >= pending.len() {
            if shared.eof.load(Ordering::Acquire) {
                thread::park_timeout(IDLE_WAIT);
                continue;
            }
            match decoder.decode_next_i32() {
                Ok([]) => {
                    log::debug!("Decoder reached end of stream");
                    shared.eof.store(true, Ordering::Release);
                    continue;
                }
                Ok(samples) => {
                    pending.clear();
                    pending.extend_from_slice(samples);
                    offset = 0;
                }
                Err(e) => {
                    log::error!("Decoder stopped: {}", e);
                    shared.eof.store(true, Ordering::Release);
                    continue;
                }
            }
        }

        // 只写整帧
        let free = shared.ring.free_space() / channels * channels;
        let len = (pending.len() - offset).min(free);
        if len == 0 {
            thread::park_timeout(IDLE_WAIT);
            continue;
        }
        offset += shared.ring.write(&pending[offset..offset + len]);
    }

    log::debug!("Decoder thread exiting");
}
