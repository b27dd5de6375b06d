//! Cast Engine - 音频元素图的离线驱动
//!
//! - `render`: 把若干文件 / 正弦波经 Mixer → Volume → Equalizer 渲染成 WAV
//! - `info`: 打印文件的解码信息
//!
//! 渲染循环模拟设备回调：每次向 `Renderer` 要固定帧数的交织数据。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use cast_engine::audio::{
    BufferConfig, ChannelDest, Format, Renderer, SampleBits, SampleRate,
};
use cast_engine::decode::{AudioDecoder, DecoderControl, DecoderSource};
use cast_engine::element::{Band, Source, ToneSource};
use cast_engine::{Engine, EngineConfig};

/// 正弦波源的幅度
const TONE_AMPLITUDE: f64 = 0.25;

/// 等待解码线程填充的超时
const READY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "cast-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mix files and tones through the pipeline into a WAV file
    Render(RenderArgs),

    /// Show decoder information for a file
    Info {
        /// Audio file to inspect
        file: PathBuf,
    },
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Audio files to mix
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Add a sine tone source (Hz), may be repeated
    #[arg(long = "tone", value_name = "HZ")]
    tones: Vec<f64>,

    /// Output WAV file
    #[arg(short, long, default_value = "out.wav")]
    output: PathBuf,

    /// Output sample rate
    #[arg(long, default_value_t = 48_000)]
    rate: u32,

    /// Output channel count
    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// Output sample representation (s16, s24, s32, f32, ...)
    #[arg(long, default_value = "f32")]
    bits: SampleBits,

    /// Stop after this many seconds (required for tone-only renders)
    #[arg(long)]
    seconds: Option<f64>,

    /// Start position in every file (seconds)
    #[arg(long)]
    start: Option<f64>,

    /// Volume 0.0 - 1.0
    #[arg(long, default_value_t = 1.0)]
    volume: f64,

    /// Volume curve base (1 = linear)
    #[arg(long, default_value_t = 1.0)]
    base: f64,

    /// Pipeline block size in milliseconds
    #[arg(long, default_value_t = 10)]
    block_ms: u32,

    /// Frames requested per simulated device callback
    #[arg(long, default_value_t = 512)]
    period: usize,

    /// Peaking equalizer band FREQ:GAIN_DB:Q (repeatable)
    #[arg(long = "eq", value_name = "FREQ:GAIN:Q", value_parser = parse_band)]
    bands: Vec<Band>,

    /// Enable the level meter and print the final level
    #[arg(long)]
    meter: bool,
}

fn parse_band(s: &str) -> Result<Band, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [freq, gain, q] = parts.as_slice() else {
        return Err(format!("expected FREQ:GAIN:Q, got '{}'", s));
    };
    let band = Band::peaking(
        freq.parse().map_err(|e| format!("bad frequency '{}': {}", freq, e))?,
        gain.parse().map_err(|e| format!("bad gain '{}': {}", gain, e))?,
        q.parse().map_err(|e| format!("bad Q '{}': {}", q, e))?,
    );
    band.validate().map_err(|e| e.to_string())?;
    Ok(band)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Render(ref args) => render(args),
        Commands::Info { ref file } => info(file),
    }
}

/// 打印文件信息
fn info(path: &Path) -> anyhow::Result<()> {
    let decoder = AudioDecoder::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let info = decoder.info();

    println!("File: {}", path.display());
    println!("Container: {}", info.format);
    println!("Codec: {}", info.codec);
    println!("Sample rate: {} Hz", info.sample_rate);
    println!("Channels: {}", info.channels);
    match info.bit_depth {
        Some(bits) => println!("Bit depth: {}", bits),
        None => println!("Bit depth: unknown"),
    }
    if let Some(frames) = info.total_frames {
        println!("Frames: {}", frames);
    }
    if let Some(secs) = info.duration_secs {
        println!("Duration: {}", format_time(secs));
    }
    Ok(())
}

/// 一个文件源的控制句柄和每次拉取需要的帧数
struct FileInput {
    control: DecoderControl,
    block: usize,
}

fn render(args: &RenderArgs) -> anyhow::Result<()> {
    if args.files.is_empty() && args.tones.is_empty() {
        anyhow::bail!("nothing to render: give at least one FILE or --tone");
    }
    if args.files.is_empty() && args.seconds.is_none() {
        anyhow::bail!("--seconds is required when rendering tones only");
    }

    let format = Format::new(SampleRate::from_hz(args.rate), args.bits, args.channels);
    let buffer = BufferConfig {
        block_ms: args.block_ms,
        ..BufferConfig::default()
    };
    let config = EngineConfig {
        buffer,
        output_format: format,
        volume: args.volume,
        volume_base: args.base,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config)?;

    let mut inputs = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let source = DecoderSource::open(path, &buffer)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let info = source.info();
        println!(
            "Source: {} ({} Hz, {} ch, {})",
            path.display(),
            info.sample_rate,
            info.channels,
            info.codec
        );
        let input = FileInput {
            control: source.control(),
            block: buffer.block_samples(&source.native_format()),
        };
        let index = engine.add_source(Box::new(source))?;

        if let Some(start) = args.start {
            input.control.seek(start);
            engine.reset_source(index)?;
        }
        inputs.push(input);
    }

    for &hz in &args.tones {
        println!("Source: tone {} Hz", hz);
        engine.add_source(Box::new(ToneSource::new(format, hz, TONE_AMPLITUDE)))?;
    }

    if !args.bands.is_empty() {
        engine.set_equalizer(args.bands.clone())?;
        println!("Equalizer: {} bands", args.bands.len());
    }
    if args.meter {
        engine.meter_power().on();
    }

    let spec = wav_spec(&format);
    let mut writer = hound::WavWriter::create(&args.output, spec)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let channels = format.channels as usize;
    let width = format.bits.width();
    let dests = ChannelDest::interleaved(channels, width);
    let mut renderer = Renderer::new(engine, format, &buffer, dests)?;

    let limit = args
        .seconds
        .map(|s| (s.max(0.0) * format.rate.hz() as f64) as u64);
    let period = args.period.max(1);
    let mut device = vec![0u8; period * channels * width];
    let mut written: u64 = 0;
    let started = Instant::now();

    println!("Rendering to {} ({})...", args.output.display(), format);
    println!("Press Ctrl+C to stop\n");

    while running.load(Ordering::SeqCst) {
        let frames = match limit {
            Some(limit) if written >= limit => break,
            Some(limit) => (limit - written).min(period as u64) as usize,
            None => period,
        };

        // 离线渲染不应出现欠载：先等解码线程
        for input in &inputs {
            if !input.control.is_finished()
                && !input.control.wait_ready(input.block, READY_TIMEOUT)
            {
                log::warn!("Decoder not ready after {:?}", READY_TIMEOUT);
            }
        }

        let done = renderer.fill(&mut device[..frames * channels * width], frames)?;
        for frame in device[..done * channels * width].chunks_exact(channels * width) {
            for raw in frame.chunks_exact(width) {
                write_sample(&mut writer, format.bits, format.bits.decode(raw))?;
            }
        }
        written += done as u64;

        if done == 0 && inputs.iter().all(|i| i.control.is_finished()) && args.tones.is_empty()
        {
            break;
        }
    }

    writer.finalize()?;

    if !running.load(Ordering::SeqCst) {
        println!("Interrupted");
    }

    let engine = renderer.source();
    println!(
        "Rendered {} frames ({}) in {:.2}s\n",
        written,
        format_time(written as f64 / format.rate.hz() as f64),
        started.elapsed().as_secs_f64()
    );
    if args.meter {
        println!("Final level: {:.4}\n", engine.level());
    }
    print!("{}", engine.cost_report());
    println!();
    print!(
        "{}",
        renderer
            .stats()
            .report(buffer.block_samples(&format), format.rate.hz())
    );

    Ok(())
}

/// WAV 只支持整数和 32 位浮点，F64 写成 F32
fn wav_spec(format: &Format) -> hound::WavSpec {
    let (bits_per_sample, sample_format) = if format.bits.is_float() {
        (32, hound::SampleFormat::Float)
    } else {
        (format.bits.bits() as u16, hound::SampleFormat::Int)
    };
    hound::WavSpec {
        channels: format.channels,
        sample_rate: format.rate.hz(),
        bits_per_sample,
        sample_format,
    }
}

fn write_sample<W: std::io::Write + std::io::Seek>(
    writer: &mut hound::WavWriter<W>,
    bits: SampleBits,
    value: f64,
) -> Result<(), hound::Error> {
    if bits.is_float() {
        return writer.write_sample(value as f32);
    }
    let scale = (1u64 << (bits.bits() - 1)) as f64;
    let v = (value * scale).round().clamp(-scale, scale - 1.0) as i32;
    writer.write_sample(v)
}

/// 格式化时间显示
fn format_time(secs: f64) -> String {
    let mins = (secs / 60.0) as u32;
    let secs = secs % 60.0;
    format!("{}:{:05.2}", mins, secs)
}
