//! 指标模块
//! 每个逻辑操作产生一条结果记录，交给并发安全的指标汇

use crate::error::StoreError;
use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 逻辑操作名
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpName {
    Add,
    AddJumbo,
    Delete,
    AddBatch,
    DeleteBatch,
    Count,
}

impl OpName {
    pub const fn as_str(self) -> &'static str {
        match self {
            OpName::Add => "add",
            OpName::AddJumbo => "add_jumbo",
            OpName::Delete => "delete",
            OpName::AddBatch => "add_batch",
            OpName::DeleteBatch => "delete_batch",
            OpName::Count => "count",
        }
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 响应摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSummary {
    None,
    /// 已写入的条目数（失败时为失败前写入的数量）
    Written(usize),
    /// 已删除的条目数
    Deleted(usize),
    /// 计数结果
    Counted(u64),
}

impl fmt::Display for ResponseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSummary::None => f.write_str("-"),
            ResponseSummary::Written(n) => write!(f, "written={n}"),
            ResponseSummary::Deleted(n) => write!(f, "deleted={n}"),
            ResponseSummary::Counted(n) => write!(f, "count={n}"),
        }
    }
}

/// 一个逻辑操作的结果
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub name: OpName,
    pub start_time: SystemTime,
    pub elapsed: Duration,
    pub response: ResponseSummary,
    pub error: Option<StoreError>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// 响应时间统一以微秒上报
    pub fn elapsed_micros(&self) -> u64 {
        u64::try_from(self.elapsed.as_micros()).unwrap_or(u64::MAX)
    }

    pub fn start_micros(&self) -> u64 {
        self.start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// 指标汇trait，必须允许多个执行单元并发追加
pub trait MetricsSink: Send + Sync {
    fn record(&self, outcome: &OperationOutcome);
}

/// 延迟分位统计（微秒）
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    histogram: Histogram<u64>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(3).expect("valid histogram config"),
        }
    }

    pub fn record(&mut self, latency_us: u64) {
        self.histogram.record(latency_us).ok();
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn quantile(&self, q: f64) -> u64 {
        self.histogram.value_at_quantile(q)
    }

    pub fn max(&self) -> u64 {
        self.histogram.max()
    }

    pub fn mean(&self) -> f64 {
        self.histogram.mean()
    }
}

#[derive(Debug, Clone, Default)]
struct OpStats {
    successes: u64,
    failures: u64,
    latency: LatencyTracker,
    last_error: Option<String>,
}

/// 单个操作名的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct OpSummary {
    pub name: OpName,
    pub successes: u64,
    pub failures: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub last_error: Option<String>,
}

impl OpSummary {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "operation": self.name.as_str(),
            "successes": self.successes,
            "failures": self.failures,
            "p50_us": self.p50_us,
            "p95_us": self.p95_us,
            "p99_us": self.p99_us,
            "p999_us": self.p999_us,
            "max_us": self.max_us,
            "mean_us": self.mean_us,
            "last_error": self.last_error,
        })
        .to_string()
    }
}

/// 聚合型指标汇：按操作名统计成功/失败次数与延迟分布
#[derive(Debug, Default)]
pub struct StatsSink {
    stats: Mutex<BTreeMap<OpName, OpStats>>,
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> Vec<OpSummary> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats
            .iter()
            .map(|(name, s)| OpSummary {
                name: *name,
                successes: s.successes,
                failures: s.failures,
                p50_us: s.latency.quantile(0.50),
                p95_us: s.latency.quantile(0.95),
                p99_us: s.latency.quantile(0.99),
                p999_us: s.latency.quantile(0.999),
                max_us: s.latency.max(),
                mean_us: s.latency.mean(),
                last_error: s.last_error.clone(),
            })
            .collect()
    }

    /// 通过 tracing 输出汇总
    pub fn log_summary(&self) {
        for s in self.summary() {
            tracing::info!(
                operation = s.name.as_str(),
                successes = s.successes,
                failures = s.failures,
                p50_us = s.p50_us,
                p95_us = s.p95_us,
                p99_us = s.p99_us,
                max_us = s.max_us,
                mean_us = s.mean_us,
                "operation summary"
            );
            if let Some(err) = &s.last_error {
                tracing::info!(operation = s.name.as_str(), last_error = %err, "last failure");
            }
        }
    }
}

impl MetricsSink for StatsSink {
    fn record(&self, outcome: &OperationOutcome) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(outcome.name).or_default();
        entry.latency.record(outcome.elapsed_micros());
        match &outcome.error {
            None => entry.successes += 1,
            Some(err) => {
                entry.failures += 1;
                entry.last_error = Some(err.to_string());
            }
        }
    }
}

/// 按顺序保存所有结果
#[derive(Debug, Default)]
pub struct RecordingSink {
    outcomes: Mutex<Vec<OperationOutcome>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<OperationOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<OpName> {
        self.outcomes().iter().map(|o| o.name).collect()
    }

    pub fn clear(&self) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl MetricsSink for RecordingSink {
    fn record(&self, outcome: &OperationOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome.clone());
    }
}
