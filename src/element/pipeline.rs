//! 流水线
//!
//! 按顺序在同一个缓冲区上运行各阶段，并记录每个阶段和整个 pass 的耗时。
//! 遇到第一个关闭的阶段即停止，后面的阶段这一轮都不执行。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::{Element, Stage};
use crate::audio::buffer::SampleBuffer;
use crate::audio::output::Render;
use crate::audio::timing::{elapsed_since, now_ns};

/// 默认阶段数量上限
pub const MAX_STAGES: usize = 15;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already holds {0} stages")]
    Full(usize),
}

struct StageSlot<S> {
    stage: S,
    cost: Duration,
    runs: u64,
    failures: u64,
}

pub struct Pipeline<S: Stage = Element> {
    slots: Vec<StageSlot<S>>,
    max_stages: usize,
    cost: Duration,
    max_cost: Duration,
}

impl<S: Stage> Pipeline<S> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STAGES)
    }

    pub fn with_capacity(max_stages: usize) -> Self {
        Self {
            slots: Vec::with_capacity(max_stages),
            max_stages,
            cost: Duration::ZERO,
            max_cost: Duration::ZERO,
        }
    }

    /// 追加阶段，返回其位置
    pub fn add_stage(&mut self, stage: S) -> Result<usize, PipelineError> {
        if self.slots.len() >= self.max_stages {
            return Err(PipelineError::Full(self.max_stages));
        }
        log::debug!("Pipeline: stage #{} '{}'", self.slots.len(), stage.name());
        self.slots.push(StageSlot {
            stage,
            cost: Duration::ZERO,
            runs: 0,
            failures: 0,
        });
        Ok(self.slots.len() - 1)
    }

    /// 运行一个 pass，返回实际执行的阶段数
    ///
    /// 阶段出错只计数（见 `stage_failures`），不中断 pass。
    pub fn run(&mut self, buffer: &mut SampleBuffer) -> usize {
        let begin = now_ns();
        let mut executed = 0;

        for slot in &mut self.slots {
            if !slot.stage.is_enabled() {
                break;
            }
            let start = now_ns();
            if slot.stage.process(buffer).is_err() {
                slot.failures += 1;
            }
            slot.cost = elapsed_since(start);
            slot.runs += 1;
            executed += 1;
        }

        self.cost = elapsed_since(begin);
        if self.cost > self.max_cost {
            self.max_cost = self.cost;
        }
        executed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&S> {
        self.slots.get(index).map(|s| &s.stage)
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut S> {
        self.slots.get_mut(index).map(|s| &mut s.stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = &S> {
        self.slots.iter().map(|s| &s.stage)
    }

    pub fn stages_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.slots.iter_mut().map(|s| &mut s.stage)
    }

    /// 最近一次运行该阶段的耗时
    pub fn stage_cost(&self, index: usize) -> Option<Duration> {
        self.slots.get(index).map(|s| s.cost)
    }

    pub fn stage_runs(&self, index: usize) -> Option<u64> {
        self.slots.get(index).map(|s| s.runs)
    }

    pub fn stage_failures(&self, index: usize) -> Option<u64> {
        self.slots.get(index).map(|s| s.failures)
    }

    /// 最近一个 pass 的总耗时
    pub fn last_cost(&self) -> Duration {
        self.cost
    }

    pub fn max_cost(&self) -> Duration {
        self.max_cost
    }

    pub fn reset_max_cost(&mut self) {
        self.max_cost = Duration::ZERO;
    }

    pub fn cost_report(&self) -> CostReport {
        CostReport {
            stages: self
                .slots
                .iter()
                .map(|s| StageCost {
                    name: s.stage.name().to_string(),
                    cost: s.cost,
                    runs: s.runs,
                    failures: s.failures,
                })
                .collect(),
            total: self.cost,
            max: self.max_cost,
        }
    }
}

impl<S: Stage> Render for Pipeline<S> {
    fn render(&mut self, buffer: &mut SampleBuffer) -> usize {
        self.run(buffer);
        buffer.last_filled_samples()
    }
}

impl<S: Stage> Default for Pipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StageCost {
    pub name: String,
    pub cost: Duration,
    pub runs: u64,
    pub failures: u64,
}

/// 耗时快照
#[derive(Debug, Clone)]
pub struct CostReport {
    pub stages: Vec<StageCost>,
    pub total: Duration,
    pub max: Duration,
}

impl fmt::Display for CostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline Cost")?;
        writeln!(f, "=============")?;
        for (i, s) in self.stages.iter().enumerate() {
            writeln!(
                f,
                "  #{:<2} {:<12} {:>9.3} ms  runs {:<8} failures {}",
                i,
                s.name,
                s.cost.as_secs_f64() * 1000.0,
                s.runs,
                s.failures
            )?;
        }
        writeln!(f, "Last pass: {:.3} ms", self.total.as_secs_f64() * 1000.0)?;
        writeln!(f, "Max pass:  {:.3} ms", self.max.as_secs_f64() * 1000.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BufferConfig;
    use crate::audio::format::{Format, SampleBits, SampleRate};
    use crate::element::{Power, StageError};

    struct Dummy {
        name: String,
        power: Power,
        delay: Duration,
        fail: bool,
    }

    impl Dummy {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                power: Power::default(),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    impl Stage for Dummy {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            self.power.is_on()
        }

        fn process(&mut self, _buffer: &mut SampleBuffer) -> Result<(), StageError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail {
                return Err(StageError::Other("stage failure".into()));
            }
            Ok(())
        }
    }

    fn buffer() -> SampleBuffer {
        let format = Format::new(SampleRate::R48000, SampleBits::F32, 2);
        SampleBuffer::new(format, &BufferConfig::default()).unwrap()
    }

    #[test]
    fn test_disabled_stage_stops_pass() {
        let mut pipeline = Pipeline::new();
        let mut stages: Vec<Dummy> = (0..4).map(|i| Dummy::new(&format!("p{}", i))).collect();
        stages[0].delay = Duration::from_millis(2);
        let switch = stages[2].power.clone();
        for p in stages {
            pipeline.add_stage(p).unwrap();
        }

        let mut buf = buffer();
        assert_eq!(pipeline.run(&mut buf), 4);

        switch.off();
        assert_eq!(pipeline.run(&mut buf), 2);
        assert_eq!(pipeline.stage_runs(0), Some(2));
        assert_eq!(pipeline.stage_runs(1), Some(2));
        assert_eq!(pipeline.stage_runs(2), Some(1));
        assert_eq!(pipeline.stage_runs(3), Some(1));
        assert!(pipeline.stage_cost(0).unwrap() >= Duration::from_millis(1));
        assert!(pipeline.last_cost() >= Duration::from_millis(1));
        assert!(pipeline.max_cost() >= pipeline.last_cost());
    }

    #[test]
    fn test_failure_counted_and_pass_continues() {
        let mut pipeline = Pipeline::new();
        let mut broken = Dummy::new("broken");
        broken.fail = true;
        pipeline.add_stage(broken).unwrap();
        pipeline.add_stage(Dummy::new("after")).unwrap();

        let mut buf = buffer();
        assert_eq!(pipeline.run(&mut buf), 2);
        assert_eq!(pipeline.stage_failures(0), Some(1));
        assert_eq!(pipeline.stage_runs(1), Some(1));

        let report = pipeline.cost_report();
        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.stages[0].failures, 1);
        assert!(report.to_string().contains("broken"));
    }

    #[test]
    fn test_capacity() {
        let mut pipeline = Pipeline::with_capacity(2);
        pipeline.add_stage(Dummy::new("a")).unwrap();
        pipeline.add_stage(Dummy::new("b")).unwrap();
        assert!(matches!(
            pipeline.add_stage(Dummy::new("c")),
            Err(PipelineError::Full(2))
        ));
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn test_default_limit() {
        let mut pipeline: Pipeline<Dummy> = Pipeline::default();
        for i in 0..MAX_STAGES {
            pipeline.add_stage(Dummy::new(&i.to_string())).unwrap();
        }
        assert!(pipeline.add_stage(Dummy::new("overflow")).is_err());
    }
}
