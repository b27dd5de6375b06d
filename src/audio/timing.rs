//! 单调时钟
//!
//! 流水线用它给每个阶段计时。macOS 上直接读 mach ticks，
//! 其它平台以进程内第一次取时为零点的 `Instant`。

use std::sync::OnceLock;
use std::time::Duration;

#[cfg(target_os = "macos")]
mod mach {
    #[repr(C)]
    pub struct TimebaseInfo {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn mach_absolute_time() -> u64;
        pub fn mach_timebase_info(info: *mut TimebaseInfo) -> i32;
    }
}

/// ticks → ns 的比例
#[derive(Clone, Copy)]
struct Timebase {
    numer: u64,
    denom: u64,
}

#[cfg(target_os = "macos")]
fn timebase() -> Timebase {
    static TIMEBASE: OnceLock<Timebase> = OnceLock::new();
    *TIMEBASE.get_or_init(|| {
        let mut info = mach::TimebaseInfo { numer: 0, denom: 0 };
        unsafe { mach::mach_timebase_info(&mut info) };
        if info.numer == 0 || info.denom == 0 {
            return Timebase { numer: 1, denom: 1 };
        }
        Timebase {
            numer: info.numer as u64,
            denom: info.denom as u64,
        }
    })
}

#[cfg(not(target_os = "macos"))]
fn timebase() -> Timebase {
    Timebase { numer: 1, denom: 1 }
}

/// 当前时间（平台 ticks）
#[cfg(target_os = "macos")]
#[inline]
pub fn now_ticks() -> u64 {
    unsafe { mach::mach_absolute_time() }
}

#[cfg(not(target_os = "macos"))]
#[inline]
pub fn now_ticks() -> u64 {
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let tb = timebase();
    // u128 中间值，长区间也不会溢出
    (ticks as u128 * tb.numer as u128 / tb.denom as u128) as u64
}

/// 当前时间（纳秒，单调）
#[inline]
pub fn now_ns() -> u64 {
    ticks_to_ns(now_ticks())
}

/// 从 `start_ns` 到现在经过的时间
#[inline]
pub fn elapsed_since(start_ns: u64) -> Duration {
    Duration::from_nanos(now_ns().saturating_sub(start_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timebase_non_zero() {
        let tb = timebase();
        assert!(tb.numer > 0);
        assert!(tb.denom > 0);
        assert!(ticks_to_ns(1_000_000) > 0);
    }

    #[test]
    fn test_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_elapsed() {
        let start = now_ns();
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = elapsed_since(start);
        assert!(
            elapsed >= Duration::from_millis(8),
            "expected at least 8ms, got {:?}",
            elapsed
        );
    }
}
