//! 渲染统计
//!
//! 设备回调与流水线运行时累计计数；每次 pass 的耗时降频采样，
//! 所有写入都是 Relaxed 原子操作，可以在实时线程里调用。

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// 每 N 次流水线 pass 采样一次耗时
const SAMPLE_INTERVAL: u64 = 8;

/// 耗时样本槽位数
const COST_SLOTS: usize = 128;

pub struct RenderStats {
    callbacks: AtomicU64,
    passes: AtomicU64,
    frames: AtomicU64,
    underruns: AtomicU64,
    cost_ns: Box<[AtomicU64; COST_SLOTS]>,
    cost_idx: AtomicUsize,
}

impl RenderStats {
    pub fn new() -> Self {
        Self {
            callbacks: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            cost_ns: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            cost_idx: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn on_callback(&self) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次流水线 pass
    #[inline]
    pub fn on_pass(&self, cost: Duration) {
        let count = self.passes.fetch_add(1, Ordering::Relaxed);
        if count % SAMPLE_INTERVAL == 0 {
            let idx = self.cost_idx.fetch_add(1, Ordering::Relaxed) % COST_SLOTS;
            // 0 表示空槽，至少记 1ns
            self.cost_ns[idx].store((cost.as_nanos() as u64).max(1), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_frames(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `block_frames` / `sample_rate` 给出一次 pass 的实时预算
    pub fn report(&self, block_frames: usize, sample_rate: u32) -> StatsReport {
        let costs: Vec<u64> = self
            .cost_ns
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&ns| ns > 0)
            .collect();

        let (min_ns, max_ns, avg_ns) = match (costs.iter().min(), costs.iter().max()) {
            (Some(&min), Some(&max)) => (min, max, costs.iter().sum::<u64>() / costs.len() as u64),
            _ => (0, 0, 0),
        };

        let budget_ns = if sample_rate > 0 {
            block_frames as u64 * 1_000_000_000 / sample_rate as u64
        } else {
            0
        };

        StatsReport {
            callbacks: self.callbacks(),
            passes: self.passes(),
            frames: self.frames(),
            underruns: self.underruns(),
            budget_ns,
            min_ns,
            max_ns,
            avg_ns,
        }
    }

    pub fn reset(&self) {
        self.callbacks.store(0, Ordering::Relaxed);
        self.passes.store(0, Ordering::Relaxed);
        self.frames.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.cost_idx.store(0, Ordering::Relaxed);
        for slot in self.cost_ns.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for RenderStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callbacks: u64,
    pub passes: u64,
    pub frames: u64,
    pub underruns: u64,
    /// 单次 pass 的实时预算
    pub budget_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |ns: u64| ns as f64 / 1_000_000.0;

        writeln!(f, "Render Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Device callbacks: {}", self.callbacks)?;
        writeln!(f, "Pipeline passes: {}", self.passes)?;
        writeln!(f, "Frames delivered: {}", self.frames)?;
        writeln!(f)?;
        writeln!(f, "Pass cost (every {} passes):", SAMPLE_INTERVAL)?;
        writeln!(f, "  Budget: {:.3} ms", ms(self.budget_ns))?;
        writeln!(f, "  Min: {:.3} ms", ms(self.min_ns))?;
        writeln!(f, "  Max: {:.3} ms", ms(self.max_ns))?;
        writeln!(f, "  Avg: {:.3} ms", ms(self.avg_ns))?;
        if self.budget_ns > 0 {
            writeln!(
                f,
                "  Load: {:.1}%",
                self.avg_ns as f64 / self.budget_ns as f64 * 100.0
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Underruns: {}", self.underruns)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RenderStats::new();
        stats.on_callback();
        stats.on_callback();
        stats.add_frames(480);
        stats.record_underrun();

        assert_eq!(stats.callbacks(), 2);
        assert_eq!(stats.frames(), 480);
        assert_eq!(stats.underruns(), 1);

        stats.reset();
        assert_eq!(stats.callbacks(), 0);
        assert_eq!(stats.frames(), 0);
    }

    #[test]
    fn test_report_costs() {
        let stats = RenderStats::new();
        // 第 0 和第 8 次 pass 会被采样
        for i in 0..9u64 {
            stats.on_pass(Duration::from_micros(100 + i * 100));
        }
        let report = stats.report(480, 48_000);
        assert_eq!(report.passes, 9);
        assert_eq!(report.budget_ns, 10_000_000);
        assert_eq!(report.min_ns, 100_000);
        assert_eq!(report.max_ns, 900_000);
        assert_eq!(report.avg_ns, 500_000);
        assert!(report.to_string().contains("Underruns: 0"));
    }
}
