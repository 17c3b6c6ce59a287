//! 时间源

use crate::store::EventTime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 排序键时间源
pub trait Clock: Send + Sync {
    fn now(&self) -> EventTime;
}

/// 系统时钟，微秒精度
///
/// 进程内严格递增：同一微秒内的两次读取会得到相邻的不同值，
/// 因此同一进程写入同一分区时 `(Id, EventDate)` 不会重复。
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> EventTime {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return EventTime::from_micros(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// 手动时钟：从给定时间开始，每次读取前进固定步长
#[derive(Debug)]
pub struct ManualClock {
    next: AtomicU64,
    step: u64,
}

impl ManualClock {
    pub fn new(start: EventTime, step: Duration) -> Self {
        Self {
            next: AtomicU64::new(start.as_micros()),
            step: step.as_micros() as u64,
        }
    }

    /// 下一次读取将返回的值
    pub fn peek(&self) -> EventTime {
        EventTime::from_micros(self.next.load(Ordering::Acquire))
    }

    /// 跳到指定时间
    pub fn set(&self, at: EventTime) {
        self.next.store(at.as_micros(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> EventTime {
        EventTime::from_micros(self.next.fetch_add(self.step, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_strictly_increasing() {
        let clock = SystemClock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn manual_clock_steps() {
        let clock = ManualClock::new(EventTime::from_secs(10), Duration::from_secs(1));
        assert_eq!(clock.now(), EventTime::from_secs(10));
        assert_eq!(clock.now(), EventTime::from_secs(11));
        clock.set(EventTime::from_secs(100));
        assert_eq!(clock.peek(), EventTime::from_secs(100));
    }
}
