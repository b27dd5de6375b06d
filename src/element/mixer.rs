//! 混音器
//!
//! 持有最多 `max_sources` 个源，每个源配一个格式转换器。
//! 每个 pass：输出缓冲写静音 → 逐个源：转换器队列不足一个输出块时拉取并送入，
//! 再取出一个输出块到暂存区 → 累加。
//! 单个源失败只跳过该源，不影响其它源。

use thiserror::Error;

use super::{Power, Source, Stage, StageError};
use crate::audio::buffer::{BufferConfig, BufferError, SampleBuffer};
use crate::audio::format::{Format, FormatError};
use crate::resample::{ConvertError, FormatConverter};

/// 默认源数量上限
pub const MAX_SOURCES: usize = 15;

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("mixer output format is not set")]
    NotConfigured,
    #[error("mixer already holds {0} sources")]
    Full(usize),
    #[error("no source at index {0}")]
    NoSuchSource(usize),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

struct MixerInput {
    source: Box<dyn Source>,
    converter: FormatConverter,
    /// 拉取或转换失败的次数
    failures: u64,
}

pub struct Mixer {
    name: String,
    power: Power,
    config: BufferConfig,
    max_sources: usize,
    inputs: Vec<MixerInput>,
    format: Option<Format>,
    /// 拉取/转换共用的暂存区，容量按所有源与输出格式合并后的格式分配
    scratch: Option<SampleBuffer>,
}

impl Mixer {
    pub fn new(config: BufferConfig) -> Self {
        Self::with_capacity(config, MAX_SOURCES)
    }

    pub fn with_capacity(config: BufferConfig, max_sources: usize) -> Self {
        Self {
            name: "Mixer".to_string(),
            power: Power::default(),
            config,
            max_sources,
            inputs: Vec::with_capacity(max_sources),
            format: None,
            scratch: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    pub fn output_format(&self) -> Option<Format> {
        self.format
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// 暂存区的分配格式（输出格式与所有源格式合并）
    pub fn scratch_format(&self) -> Option<Format> {
        self.scratch.as_ref().map(|s| *s.real_format())
    }

    pub fn max_sources(&self) -> usize {
        self.max_sources
    }

    /// 添加一个源，返回其序号
    ///
    /// 已设置输出格式时立即为新源配置转换器，失败则不添加。
    pub fn add_source(&mut self, source: Box<dyn Source>) -> Result<usize, MixerError> {
        if self.inputs.len() >= self.max_sources {
            log::warn!("{}: source limit {} reached", self.name, self.max_sources);
            return Err(MixerError::Full(self.max_sources));
        }

        let native = source.native_format();
        self.inputs.push(MixerInput {
            source,
            converter: FormatConverter::new(self.config),
            failures: 0,
        });

        if let Some(format) = self.format {
            if let Err(e) = self.set_output_format(format) {
                self.inputs.pop();
                return Err(e);
            }
        }

        log::debug!(
            "{}: added source #{} ({})",
            self.name,
            self.inputs.len() - 1,
            native
        );
        Ok(self.inputs.len() - 1)
    }

    /// 设置输出格式
    ///
    /// 先为所有源构建转换状态并分配暂存区，全部成功后才提交；
    /// 任何一步失败，混音器保持原来的配置。
    pub fn set_output_format(&mut self, format: Format) -> Result<(), MixerError> {
        format.validate()?;

        let mut merged = Format::empty().merged(&format);
        let mut plans = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let native = input.source.native_format();
            plans.push(input.converter.prepare(native, format)?);
            merged.merge(&native);
        }

        let scratch = SampleBuffer::new(merged, &self.config)?;

        for (input, plan) in self.inputs.iter_mut().zip(plans) {
            if let Some(state) = plan {
                input.converter.install(state);
            }
        }
        self.scratch = Some(scratch);
        self.format = Some(format);

        log::info!(
            "{}: output format {} ({} sources, scratch {})",
            self.name,
            format,
            self.inputs.len(),
            merged
        );
        Ok(())
    }

    /// 清空某个源的转换历史（源 seek 之后由调用方使用）
    pub fn reset_source(&mut self, index: usize) -> Result<(), MixerError> {
        let input = self
            .inputs
            .get_mut(index)
            .ok_or(MixerError::NoSuchSource(index))?;
        input.converter.reset();
        Ok(())
    }

    /// 某个源被跳过（拉取或转换失败）的次数
    pub fn source_failures(&self, index: usize) -> Option<u64> {
        self.inputs.get(index).map(|i| i.failures)
    }

    /// 混合所有源到 `out`，返回写入的样本数
    pub fn stream(&mut self, out: &mut SampleBuffer) -> Result<usize, MixerError> {
        let format = self.format.ok_or(MixerError::NotConfigured)?;
        let scratch = self.scratch.as_mut().ok_or(MixerError::NotConfigured)?;

        out.retag(format)?;
        out.zero();

        let mut mixed = 0;
        for input in &mut self.inputs {
            let converter = &mut input.converter;
            if converter.wants_input() {
                if scratch.reset_for(converter.input_block()).is_err() {
                    continue;
                }
                match input.source.pull(scratch) {
                    Ok(0) => {
                        if input.source.is_finished() && converter.flush().is_err() {
                            input.failures += 1;
                        }
                    }
                    Ok(_) => {
                        if converter.push(scratch).is_err() {
                            input.failures += 1;
                            continue;
                        }
                    }
                    Err(_) => {
                        input.failures += 1;
                        continue;
                    }
                }
            }

            match converter.drain(scratch) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(_) => {
                    input.failures += 1;
                    continue;
                }
            }

            mixed = mixed.max(out.mix_from(scratch));
        }

        out.set_last_filled(mixed);
        Ok(mixed)
    }
}

impl Stage for Mixer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.power.is_on()
    }

    fn process(&mut self, buffer: &mut SampleBuffer) -> Result<(), StageError> {
        self.stream(buffer)?;
        Ok(())
    }
}
