//! 引擎
//!
//! 把混音器、音量和均衡器装配成一条流水线，自定义阶段接在后面；
//! 电平表和频谱是流水线之外的分析抽头，只读最终缓冲区，各自有开关：
//!
//! ```text
//! sources ─┬─▶ Mixer ─▶ Volume ─▶ Equalizer ─▶ 自定义阶段 ─▶ 最终缓冲区
//!          │                                                   │
//!          └─ 每个源一个 FormatConverter                        ├─▶ LevelMeter
//!                                                              └─▶ Spectrum
//! ```
//!
//! 控制接口（加源、改格式、调音量）在控制线程调用；
//! `render` 由设备回调（通过 `Renderer`）或离线渲染循环调用。

use std::time::Duration;

use thiserror::Error;

use crate::audio::buffer::{BufferConfig, BufferError, SampleBuffer};
use crate::audio::format::{Format, FormatError, SampleBits, SampleRate};
use crate::audio::output::Render;
use crate::element::pipeline::MAX_STAGES;
use crate::element::mixer::MAX_SOURCES;
use crate::element::{
    Band, CostReport, Element, Equalizer, EqualizerError, Gain, LevelHandle, LevelMeter, Mixer,
    MixerError, Pipeline, PipelineError, Power, Source, Spectrum, SpectrumHandle, Stage,
};

/// 固定阶段的位置
const MIXER: usize = 0;
const VOLUME: usize = 1;
const EQUALIZER: usize = 2;

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    /// 混音输出格式（最终缓冲区的格式）
    pub output_format: Format,
    pub max_sources: usize,
    pub max_stages: usize,
    /// 初始音量 [0, 1]
    pub volume: f64,
    /// 音量曲线底数，1 为线性
    pub volume_base: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            output_format: Format::new(SampleRate::R48000, SampleBits::F32, 2),
            max_sources: MAX_SOURCES,
            max_stages: MAX_STAGES,
            volume: 1.0,
            volume_base: 1.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Mixer(#[from] MixerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Equalizer(#[from] EqualizerError),
    #[error("pipeline has no {0} stage")]
    MissingStage(&'static str),
}

pub struct Engine {
    config: EngineConfig,
    pipeline: Pipeline<Element>,
    mixer_power: Power,
    volume_power: Power,
    equalizer_power: Power,
    meter: LevelMeter,
    spectrum: Spectrum,
    level: LevelHandle,
    tap_failures: u64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.output_format.validate()?;

        let mut mixer = Mixer::with_capacity(config.buffer, config.max_sources);
        mixer.set_output_format(config.output_format)?;
        let gain = Gain::with_base(config.volume_base, config.volume);
        let mut equalizer = Equalizer::new();
        equalizer.configure(config.output_format);
        let meter = LevelMeter::new();

        let mixer_power = mixer.power().clone();
        let volume_power = gain.power().clone();
        let equalizer_power = equalizer.power().clone();
        let level = meter.handle();

        let mut pipeline = Pipeline::with_capacity(config.max_stages);
        pipeline.add_stage(mixer.into())?;
        pipeline.add_stage(gain.into())?;
        pipeline.add_stage(equalizer.into())?;

        log::info!(
            "Engine: output {}, block {} ms, capacity {} ms, volume {:.2} (base {})",
            config.output_format,
            config.buffer.block_ms,
            config.buffer.capacity_ms,
            config.volume,
            config.volume_base
        );

        Ok(Self {
            config,
            pipeline,
            mixer_power,
            volume_power,
            equalizer_power,
            meter,
            spectrum: Spectrum::new(),
            level,
            tap_failures: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn output_format(&self) -> Format {
        self.config.output_format
    }

    /// 按输出格式分配一个最终缓冲区
    pub fn create_buffer(&self) -> Result<SampleBuffer, EngineError> {
        Ok(SampleBuffer::new(self.config.output_format, &self.config.buffer)?)
    }

    fn mixer_mut(&mut self) -> Result<&mut Mixer, EngineError> {
        match self.pipeline.stage_mut(MIXER) {
            Some(Element::Mixer(m)) => Ok(m),
            _ => Err(EngineError::MissingStage("mixer")),
        }
    }

    fn mixer(&self) -> Result<&Mixer, EngineError> {
        match self.pipeline.stage(MIXER) {
            Some(Element::Mixer(m)) => Ok(m),
            _ => Err(EngineError::MissingStage("mixer")),
        }
    }

    fn gain_mut(&mut self) -> Result<&mut Gain, EngineError> {
        match self.pipeline.stage_mut(VOLUME) {
            Some(Element::Gain(g)) => Ok(g),
            _ => Err(EngineError::MissingStage("volume")),
        }
    }

    fn gain(&self) -> Result<&Gain, EngineError> {
        match self.pipeline.stage(VOLUME) {
            Some(Element::Gain(g)) => Ok(g),
            _ => Err(EngineError::MissingStage("volume")),
        }
    }

    fn equalizer_mut(&mut self) -> Result<&mut Equalizer, EngineError> {
        match self.pipeline.stage_mut(EQUALIZER) {
            Some(Element::Equalizer(e)) => Ok(e),
            _ => Err(EngineError::MissingStage("equalizer")),
        }
    }

    fn equalizer(&self) -> Result<&Equalizer, EngineError> {
        match self.pipeline.stage(EQUALIZER) {
            Some(Element::Equalizer(e)) => Ok(e),
            _ => Err(EngineError::MissingStage("equalizer")),
        }
    }

    /// 添加一个源，返回它在混音器中的序号
    pub fn add_source(&mut self, source: Box<dyn Source>) -> Result<usize, EngineError> {
        Ok(self.mixer_mut()?.add_source(source)?)
    }

    pub fn source_count(&self) -> usize {
        self.mixer().map(Mixer::len).unwrap_or(0)
    }

    /// 某个源 seek 之后清空其转换历史
    pub fn reset_source(&mut self, index: usize) -> Result<(), EngineError> {
        Ok(self.mixer_mut()?.reset_source(index)?)
    }

    /// 追加一个自定义阶段（位于均衡器和之前追加的阶段之后）
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) -> Result<usize, EngineError> {
        Ok(self.pipeline.add_stage(Element::Custom(stage))?)
    }

    /// 更换输出格式；失败时保持原格式
    ///
    /// 之后需要用 `create_buffer` 重新分配最终缓冲区。
    pub fn set_output_format(&mut self, format: Format) -> Result<(), EngineError> {
        self.mixer_mut()?.set_output_format(format)?;
        self.equalizer_mut()?.configure(format);
        self.spectrum.reset();
        self.config.output_format = format;
        Ok(())
    }

    pub fn set_volume(&mut self, volume: f64) -> Result<(), EngineError> {
        self.gain_mut()?.set_volume(volume);
        Ok(())
    }

    pub fn set_mute(&mut self, mute: bool) -> Result<(), EngineError> {
        self.gain_mut()?.set_mute(mute);
        Ok(())
    }

    pub fn volume(&self) -> f64 {
        self.gain().map(Gain::volume).unwrap_or(0.0)
    }

    pub fn is_mute(&self) -> bool {
        self.gain().map(Gain::is_mute).unwrap_or(false)
    }

    /// 整体替换均衡器频段
    pub fn set_equalizer(&mut self, bands: Vec<Band>) -> Result<(), EngineError> {
        Ok(self.equalizer_mut()?.set_bands(bands)?)
    }

    pub fn set_band(&mut self, band: Band) -> Result<(), EngineError> {
        Ok(self.equalizer_mut()?.set_band(band)?)
    }

    pub fn remove_band(&mut self, frequency: u32) -> Result<bool, EngineError> {
        Ok(self.equalizer_mut()?.remove_band(frequency))
    }

    pub fn equalizer_bands(&self) -> Vec<Band> {
        self.equalizer()
            .map(|e| e.bands().to_vec())
            .unwrap_or_default()
    }

    pub fn mixer_power(&self) -> &Power {
        &self.mixer_power
    }

    pub fn volume_power(&self) -> &Power {
        &self.volume_power
    }

    /// 均衡器默认开启，没有频段时直通
    pub fn equalizer_power(&self) -> &Power {
        &self.equalizer_power
    }

    /// 电平表默认关闭
    pub fn meter_power(&self) -> &Power {
        self.meter.power()
    }

    /// 频谱默认关闭
    pub fn spectrum_power(&self) -> &Power {
        self.spectrum.power()
    }

    pub fn spectrum_handle(&self) -> SpectrumHandle {
        self.spectrum.handle()
    }

    pub fn set_spectrum_log_axis(&mut self, on: bool) {
        self.spectrum.set_log_axis(on);
    }

    /// 分析抽头累计失败次数
    pub fn tap_failures(&self) -> u64 {
        self.tap_failures
    }

    /// 最近一个 pass 的电平
    pub fn level(&self) -> f64 {
        self.level.level()
    }

    pub fn level_handle(&self) -> LevelHandle {
        self.level.clone()
    }

    pub fn pipeline(&self) -> &Pipeline<Element> {
        &self.pipeline
    }

    pub fn cost_report(&self) -> CostReport {
        self.pipeline.cost_report()
    }

    pub fn last_cost(&self) -> Duration {
        self.pipeline.last_cost()
    }

    /// 跑一个 pass，返回最终缓冲区中的样本数
    ///
    /// 混音器关闭时整个流水线不运行，视为没有数据。
    /// 之后按各自开关运行分析抽头。
    pub fn render(&mut self, buffer: &mut SampleBuffer) -> usize {
        if self.pipeline.run(buffer) == 0 {
            buffer.set_last_filled(0);
            return 0;
        }

        if self.meter.is_enabled() && self.meter.process(buffer).is_err() {
            self.tap_failures += 1;
        }
        if self.spectrum.is_enabled() && self.spectrum.process(buffer).is_err() {
            self.tap_failures += 1;
        }
        buffer.last_filled_samples()
    }
}

impl Render for Engine {
    fn render(&mut self, buffer: &mut SampleBuffer) -> usize {
        Engine::render(self, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::{ChannelDest, Renderer};
    use crate::element::{PcmSource, StageError, ToneSource};

    fn constant(format: Format, value: f64) -> Box<dyn Source> {
        let planes = vec![vec![value; 48_000]; format.channels as usize];
        Box::new(PcmSource::new(format, planes))
    }

    fn stereo_f32() -> Format {
        Format::new(SampleRate::R48000, SampleBits::F32, 2)
    }

    struct Invert(Power);

    impl Stage for Invert {
        fn name(&self) -> &str {
            "Invert"
        }

        fn is_enabled(&self) -> bool {
            self.0.is_on()
        }

        fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
            let channels = buffer.format().channels as usize;
            for c in 0..channels {
                for i in 0..buffer.last_filled_samples() {
                    let v = buffer.sample_f64(c, i).unwrap_or(0.0);
                    buffer.set_sample_f64(c, i, -v)?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.output_format, stereo_f32());
        assert_eq!(config.max_sources, 15);
        assert_eq!(config.max_stages, 15);
        assert_eq!(config.buffer.block_ms, 10);
        assert_eq!(config.volume, 1.0);
    }

    #[test]
    fn test_render_mixes_sources() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.add_source(constant(stereo_f32(), 0.25)).unwrap();
        engine.add_source(constant(stereo_f32(), 0.125)).unwrap();
        assert_eq!(engine.source_count(), 2);

        let mut buf = engine.create_buffer().unwrap();
        assert_eq!(engine.render(&mut buf), 480);
        assert_eq!(buf.sample_f64(0, 0), Some(0.375));
        assert_eq!(buf.sample_f64(1, 479), Some(0.375));

        let names: Vec<_> = engine.pipeline().stages().map(|s| s.name()).collect();
        assert_eq!(names, ["Mixer", "Volume", "Equalizer"]);
    }

    #[test]
    fn test_volume_and_mute() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.add_source(constant(stereo_f32(), 0.5)).unwrap();
        let mut buf = engine.create_buffer().unwrap();

        engine.set_volume(0.5).unwrap();
        engine.render(&mut buf);
        assert_eq!(buf.sample_f64(0, 10), Some(0.25));

        engine.set_mute(true).unwrap();
        assert!(engine.is_mute());
        engine.render(&mut buf);
        assert_eq!(buf.sample_f64(1, 10), Some(0.0));

        engine.set_volume(3.0).unwrap();
        assert_eq!(engine.volume(), 1.0);
    }

    #[test]
    fn test_level_meter_reports_rms() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let tone = ToneSource::new(stereo_f32(), 1000.0, 0.5);
        engine.add_source(Box::new(tone)).unwrap();
        let mut buf = engine.create_buffer().unwrap();

        engine.render(&mut buf);
        assert_eq!(engine.level(), 0.0);

        engine.meter_power().on();
        engine.render(&mut buf);
        let expected = 0.5 / 2f64.sqrt();
        assert!((engine.level() - expected).abs() < 0.01, "{}", engine.level());
    }

    #[test]
    fn test_mixer_off_produces_nothing() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.add_source(constant(stereo_f32(), 0.5)).unwrap();
        let mut buf = engine.create_buffer().unwrap();

        engine.mixer_power().off();
        assert_eq!(engine.render(&mut buf), 0);
        engine.mixer_power().on();
        assert_eq!(engine.render(&mut buf), 480);
    }

    #[test]
    fn test_custom_stage_runs_with_meter_off() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.add_source(constant(stereo_f32(), 0.5)).unwrap();
        assert!(!engine.meter_power().is_on());
        assert!(!engine.spectrum_power().is_on());
        assert_eq!(engine.add_stage(Box::new(Invert(Power::default()))).unwrap(), 3);

        let mut buf = engine.create_buffer().unwrap();
        assert_eq!(engine.render(&mut buf), 480);
        assert_eq!(buf.sample_f64(0, 0), Some(-0.5));
        assert!(engine.cost_report().to_string().contains("Invert"));

        // 电平表读的是自定义阶段之后的缓冲区
        engine.meter_power().on();
        engine.render(&mut buf);
        assert_eq!(buf.sample_f64(1, 479), Some(-0.5));
        assert_eq!(engine.level(), 0.5);
        assert_eq!(engine.tap_failures(), 0);
    }

    #[test]
    fn test_equalizer_band_shapes_output() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let tone = ToneSource::new(stereo_f32(), 1000.0, 0.25);
        engine.add_source(Box::new(tone)).unwrap();
        engine.set_band(Band::peaking(1000, 6.0, 1.0)).unwrap();
        assert_eq!(engine.equalizer_bands().len(), 1);

        let mut buf = engine.create_buffer().unwrap();
        let mut peak = 0.0;
        for _ in 0..20 {
            engine.render(&mut buf);
            peak = (0..480)
                .map(|i| buf.sample_f64(0, i).unwrap_or(0.0).abs())
                .fold(0.0, f64::max);
        }
        assert!((peak - 0.5).abs() < 0.03, "peak {}", peak);

        // 关掉均衡器后面的阶段也不跑，但仍算作有输出
        engine.equalizer_power().off();
        assert_eq!(engine.render(&mut buf), 480);
        engine.equalizer_power().on();

        assert!(engine.remove_band(1000).unwrap());
        assert!(matches!(
            engine.set_band(Band::peaking(5, 6.0, 1.0)),
            Err(EngineError::Equalizer(EqualizerError::InvalidFrequency(5)))
        ));
    }

    #[test]
    fn test_spectrum_tap_publishes() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let tone = ToneSource::new(stereo_f32(), 1000.0, 0.5);
        engine.add_source(Box::new(tone)).unwrap();
        let handle = engine.spectrum_handle();
        let mut buf = engine.create_buffer().unwrap();

        for _ in 0..5 {
            engine.render(&mut buf);
        }
        assert_eq!(handle.updates(), 0);

        engine.spectrum_power().on();
        for _ in 0..5 {
            engine.render(&mut buf);
        }
        assert_eq!(handle.updates(), 1);
        assert!(handle.bins().iter().any(|&m| m > 0.3));
    }

    #[test]
    fn test_set_output_format() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.add_source(constant(stereo_f32(), 0.25)).unwrap();

        let s16 = Format::new(SampleRate::R48000, SampleBits::S16, 2);
        engine.set_output_format(s16).unwrap();
        let mut buf = engine.create_buffer().unwrap();
        assert_eq!(engine.render(&mut buf), 480);
        assert_eq!(buf.format().bits, SampleBits::S16);
        assert_eq!(buf.sample_f64(0, 0), Some(0.25));

        let bad = Format::new(SampleRate::R48000, SampleBits::S16, 0);
        assert!(engine.set_output_format(bad).is_err());
        assert_eq!(engine.output_format(), s16);
    }

    #[test]
    fn test_too_few_stages() {
        let config = EngineConfig {
            max_stages: 2,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(config),
            Err(EngineError::Pipeline(PipelineError::Full(2)))
        ));
    }

    #[test]
    fn test_renderer_drives_engine() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.add_source(constant(stereo_f32(), 0.5)).unwrap();
        let format = engine.output_format();
        let config = engine.config().buffer;
        let dests = ChannelDest::interleaved(2, 4);
        let mut renderer = Renderer::new(engine, format, &config, dests).unwrap();

        // 跨两个 pass
        let frames = 700;
        let mut out = vec![0u8; frames * 8];
        assert_eq!(renderer.fill(&mut out, frames).unwrap(), frames);
        let last = f32::from_le_bytes([
            out[out.len() - 4],
            out[out.len() - 3],
            out[out.len() - 2],
            out[out.len() - 1],
        ]);
        assert_eq!(last, 0.5);
        assert_eq!(renderer.stats().passes(), 2);

        renderer.source_mut().set_mute(true).unwrap();
        assert_eq!(renderer.pending(), 260);
    }
}
