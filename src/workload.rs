//! 负载操作模块
//! 写入、窗口裁剪、窗口计数以及批量变体
//!
//! 每个逻辑操作向指标汇上报且仅上报一条结果。存储错误在操作边界被捕获，
//! 不会重试，也不会向上传播；只有配置类错误（键空间耗尽）会返回给调用方。

use crate::burst::BurstPolicy;
use crate::clock::Clock;
use crate::config::WorkloadConfig;
use crate::error::{Result, StoreError, StoreResult};
use crate::keys::{KeySelector, SelectedKey};
use crate::metrics::{MetricsSink, OpName, OperationOutcome, ResponseSummary};
use crate::store::{Cursor, EventTime, Item, ItemKey, KeyAttribute, Projection, Store, TimeRange};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::{Instant, SystemTime};

/// 交易 id 字符集：大写字母与数字
pub const PAYLOAD_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// 批量删除按完整主键去重
const BATCH_DEDUPE: [KeyAttribute; 2] = [KeyAttribute::Id, KeyAttribute::EventTime];

/// 单个键的写入计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPlan {
    pub key: SelectedKey,
    /// 第一个是基础条目，其余为 jumbo 额外条目
    pub payloads: Vec<String>,
    pub jumbo: bool,
}

impl KeyPlan {
    fn op_name(&self) -> OpName {
        if self.jumbo { OpName::AddJumbo } else { OpName::Add }
    }
}

/// 阶段计时
struct PhaseTimer {
    start_time: SystemTime,
    started: Instant,
}

impl PhaseTimer {
    fn start() -> Self {
        Self {
            start_time: SystemTime::now(),
            started: Instant::now(),
        }
    }

    fn finish(
        self,
        name: OpName,
        response: ResponseSummary,
        error: Option<StoreError>,
    ) -> OperationOutcome {
        OperationOutcome {
            name,
            start_time: self.start_time,
            elapsed: self.started.elapsed(),
            response,
            error,
        }
    }
}

/// 下一页游标；游标不前进视为分页协议错误
fn next_cursor(prev: Option<&Cursor>, next: Option<Cursor>) -> StoreResult<Option<Cursor>> {
    match (prev, next) {
        (Some(prev), Some(next)) if *prev == next => Err(StoreError::Pagination(format!(
            "cursor did not advance past {}@{}",
            next.last_evaluated().id,
            next.last_evaluated().event_time
        ))),
        (_, next) => Ok(next),
    }
}

/// 一个虚拟用户的负载驱动
pub struct Workload<'a, S: Store> {
    config: &'a WorkloadConfig,
    store: &'a S,
    sink: &'a dyn MetricsSink,
    clock: &'a dyn Clock,
    keys: KeySelector,
    burst: BurstPolicy,
    rng: ChaCha8Rng,
}

impl<'a, S: Store> Workload<'a, S> {
    pub fn new(
        config: &'a WorkloadConfig,
        store: &'a S,
        sink: &'a dyn MetricsSink,
        clock: &'a dyn Clock,
        rng: ChaCha8Rng,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            sink,
            clock,
            keys: KeySelector::new(config)?,
            burst: BurstPolicy::new(&config.jumbo)?,
            rng,
        })
    }

    pub fn keys(&self) -> &KeySelector {
        &self.keys
    }

    /// 按键分布选一个键
    pub fn select_key(&mut self) -> Result<SelectedKey> {
        self.keys.select(&mut self.rng)
    }

    /// 随机交易 id，长度在配置区间内均匀分布
    pub fn payload(&mut self) -> String {
        let len = self.rng.random_range(self.config.payload_chars.clone());
        (0..len)
            .map(|_| self.rng.random_range(0..PAYLOAD_ALPHABET.len()))
            .map(|i| PAYLOAD_ALPHABET[i] as char)
            .collect()
    }

    /// 为一个键生成基础条目与（可能的）jumbo 额外条目
    pub fn plan(&mut self, key: SelectedKey) -> KeyPlan {
        let extra = self.burst.decide(&key, &mut self.rng);
        let mut payloads = Vec::with_capacity(1 + extra.unwrap_or(0));
        payloads.push(self.payload());
        for _ in 0..extra.unwrap_or(0) {
            payloads.push(self.payload());
        }
        KeyPlan {
            key,
            payloads,
            jumbo: extra.is_some(),
        }
    }

    fn emit(&self, outcome: OperationOutcome) -> OperationOutcome {
        if let Some(err) = &outcome.error {
            tracing::debug!(operation = %outcome.name, error = %err, "operation failed");
        }
        self.sink.record(&outcome);
        outcome
    }

    /// 逐条写入一个键的条目，每条提交时取新的时间戳；首个错误即中止
    pub async fn write(&mut self, key: &SelectedKey) -> OperationOutcome {
        let plan = self.plan(key.clone());
        self.write_plan(&plan).await
    }

    pub async fn write_plan(&self, plan: &KeyPlan) -> OperationOutcome {
        let timer = PhaseTimer::start();
        let mut written = 0;
        let mut error = None;
        for payload in &plan.payloads {
            let item = Item {
                id: plan.key.name.clone(),
                event_time: self.clock.now(),
                payload: payload.clone(),
            };
            match self.store.put(item).await {
                Ok(()) => written += 1,
                Err(err) => {
                    error = Some(err);
                    break;
                }
            }
        }
        self.emit(timer.finish(
            plan.op_name(),
            ResponseSummary::Written(written),
            error,
        ))
    }

    /// 删除 `id` 下排序键早于 `as_of - retention_secs` 的全部条目
    ///
    /// `retention_secs == 0` 表示从不裁剪，不发起任何存储调用，返回 `None`。
    /// 先完整分页扫描再删除；已发出的删除不会回滚。
    pub async fn trim(
        &self,
        id: &str,
        retention_secs: u64,
        as_of: EventTime,
    ) -> Option<OperationOutcome> {
        if retention_secs == 0 {
            return None;
        }
        let timer = PhaseTimer::start();
        let range = TimeRange::before(as_of.saturating_sub_secs(retention_secs));
        let mut deleted = 0;
        let result = async {
            let expired = self.collect_keys(id, range, Projection::EventTime).await?;
            for key in &expired {
                self.store.delete(key).await?;
                deleted += 1;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        Some(self.emit(timer.finish(
            OpName::Delete,
            ResponseSummary::Deleted(deleted),
            result.err(),
        )))
    }

    /// 统计 `id` 下排序键位于 `[as_of - window_secs, as_of]` 的条目数
    pub async fn count_key(
        &self,
        id: &str,
        window_secs: u64,
        as_of: EventTime,
    ) -> OperationOutcome {
        let timer = PhaseTimer::start();
        let range = TimeRange::inclusive(as_of.saturating_sub_secs(window_secs), as_of);
        let mut total = 0;
        let result = async {
            let mut cursor: Option<Cursor> = None;
            loop {
                let page = self.store.query_count(id, range, cursor.as_ref()).await?;
                total += page.items;
                match next_cursor(cursor.as_ref(), page.next)? {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            Ok::<_, StoreError>(())
        }
        .await;
        self.emit(timer.finish(
            OpName::Count,
            ResponseSummary::Counted(total),
            result.err(),
        ))
    }

    /// 批量写入 `num_keys` 个键，再按键扫描过期条目，一次批量删除
    ///
    /// 裁剪时刻在构建批次之前取一次，写入与删除阶段共用。
    pub async fn batch_write_and_trim(&mut self, num_keys: usize) -> Result<()> {
        let as_of = self.clock.now();
        let mut plans = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            let key = self.select_key()?;
            plans.push(self.plan(key));
        }

        let timer = PhaseTimer::start();
        let clock = self.clock;
        let items: Vec<Item> = plans
            .iter()
            .flat_map(|plan| {
                plan.payloads.iter().map(move |payload| Item {
                    id: plan.key.name.clone(),
                    event_time: clock.now(),
                    payload: payload.clone(),
                })
            })
            .collect();
        let submitted = items.len();
        let error = self.store.put_batch(items).await.err();
        let written = if error.is_none() { submitted } else { 0 };
        self.emit(timer.finish(
            OpName::AddBatch,
            ResponseSummary::Written(written),
            error,
        ));

        let retention_secs = self.config.retention_secs;
        if retention_secs == 0 {
            return Ok(());
        }
        let timer = PhaseTimer::start();
        let range = TimeRange::before(as_of.saturating_sub_secs(retention_secs));
        let mut deleted = 0;
        let result = async {
            let mut expired = Vec::new();
            for plan in &plans {
                let keys = self.collect_keys(&plan.key.name, range, Projection::Key);
                expired.extend(keys.await?);
            }
            if !expired.is_empty() {
                // 同一批内可能多次选中同一个键，按主键去重后计数
                let unique = expired.iter().collect::<HashSet<_>>().len();
                self.store.delete_batch(expired, &BATCH_DEDUPE).await?;
                deleted = unique;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        self.emit(timer.finish(
            OpName::DeleteBatch,
            ResponseSummary::Deleted(deleted),
            result.err(),
        ));
        Ok(())
    }

    /// 选键、写入，然后按保留期裁剪同一个键
    pub async fn add(&mut self) -> Result<()> {
        let key = self.select_key()?;
        self.write(&key).await;
        let as_of = self.clock.now();
        self.trim(&key.name, self.config.retention_secs, as_of).await;
        Ok(())
    }

    /// 按配置的批大小执行批量写入与裁剪
    pub async fn add_batch(&mut self) -> Result<()> {
        self.batch_write_and_trim(self.config.batch_size).await
    }

    /// 选键并统计最近窗口内的条目数
    pub async fn count(&mut self) -> Result<OperationOutcome> {
        let key = self.select_key()?;
        let as_of = self.clock.now();
        let window_secs = self.config.count_window_secs;
        Ok(self.count_key(&key.name, window_secs, as_of).await)
    }

    /// 分页扫描并收集落在 `range` 内的主键
    async fn collect_keys(
        &self,
        id: &str,
        range: TimeRange,
        projection: Projection,
    ) -> StoreResult<Vec<ItemKey>> {
        let mut keys = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = self
                .store
                .query_items(id, range, projection, cursor.as_ref())
                .await?;
            for found in page.items {
                if !range.contains(found.event_time) {
                    return Err(StoreError::Validation(format!(
                        "scan returned {} outside the requested range",
                        found.event_time
                    )));
                }
                let item_id = match (found.id, projection) {
                    (Some(item_id), _) => item_id,
                    (None, Projection::EventTime) => id.to_string(),
                    (None, Projection::Key) => {
                        return Err(StoreError::Validation(
                            "scan projected without the partition key".into(),
                        ));
                    }
                };
                keys.push(ItemKey::new(item_id, found.event_time));
            }
            match next_cursor(cursor.as_ref(), page.next)? {
                Some(next) => cursor = Some(next),
                None => return Ok(keys),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{JumboConfig, ZipfConfig};
    use crate::metrics::RecordingSink;
    use crate::store::{MemoryStore, MemoryStoreOptions};
    use rand::SeedableRng;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        compio::runtime::Runtime::new()
            .expect("Failed to create Compio runtime")
            .block_on(future)
    }

    fn config() -> WorkloadConfig {
        WorkloadConfig {
            zipf: ZipfConfig {
                shape: 1.5,
                direction: 1,
                max_keys: 1000,
                offset: 0,
            },
            jumbo: JumboConfig {
                frequency: 50,
                initial_exclude: 100,
                sizes: vec![3],
            },
            ..WorkloadConfig::default()
        }
    }

    #[test]
    fn payloads_use_the_alphabet_and_bounds() {
        let config = config();
        let store = MemoryStore::with_table("Log", MemoryStoreOptions::default());
        let sink = RecordingSink::new();
        let clock = ManualClock::new(EventTime::from_secs(1), Duration::from_micros(1));
        let rng = ChaCha8Rng::seed_from_u64(5);
        let mut workload = Workload::new(&config, &store, &sink, &clock, rng).unwrap();
        for _ in 0..200 {
            let p = workload.payload();
            assert_eq!(p.len(), 15);
            assert!(p.bytes().all(|b| PAYLOAD_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn payload_lengths_spread_over_the_bounds() {
        let config = WorkloadConfig {
            payload_chars: 5..=20,
            ..config()
        };
        let store = MemoryStore::with_table("Log", MemoryStoreOptions::default());
        let sink = RecordingSink::new();
        let clock = ManualClock::new(EventTime::from_secs(1), Duration::from_micros(1));
        let rng = ChaCha8Rng::seed_from_u64(9);
        let mut workload = Workload::new(&config, &store, &sink, &clock, rng).unwrap();
        let lengths: BTreeSet<usize> = (0..500).map(|_| workload.payload().len()).collect();
        assert_eq!(lengths.first(), Some(&5));
        assert_eq!(lengths.last(), Some(&20));
        assert_eq!(lengths.len(), 16);
    }

    #[test]
    fn unvalidated_configs_are_rejected_up_front() {
        let no_menu = WorkloadConfig {
            jumbo: JumboConfig {
                sizes: vec![],
                ..config().jumbo
            },
            ..config()
        };
        #[allow(clippy::reversed_empty_ranges)]
        let inverted = WorkloadConfig {
            payload_chars: 16..=15,
            ..config()
        };
        let store = MemoryStore::with_table("Log", MemoryStoreOptions::default());
        let sink = RecordingSink::new();
        let clock = ManualClock::new(EventTime::from_secs(1), Duration::from_micros(1));
        for bad in [&no_menu, &inverted] {
            let rng = ChaCha8Rng::seed_from_u64(5);
            let result = Workload::new(bad, &store, &sink, &clock, rng);
            assert!(matches!(result, Err(err) if err.is_config()));
        }
        assert_eq!(store.stats(), Default::default());
        assert!(sink.outcomes().is_empty());
    }

    #[test]
    fn jumbo_plan_adds_menu_items() {
        let config = config();
        let store = MemoryStore::with_table("Log", MemoryStoreOptions::default());
        let sink = RecordingSink::new();
        let clock = ManualClock::new(EventTime::from_secs(1), Duration::from_micros(1));
        let rng = ChaCha8Rng::seed_from_u64(5);
        let mut workload = Workload::new(&config, &store, &sink, &clock, rng).unwrap();
        let hot = workload.keys().key_for(150);
        let plan = workload.plan(hot);
        assert!(plan.jumbo);
        assert_eq!(plan.payloads.len(), 4);
        let cold = workload.keys().key_for(149);
        let plan = workload.plan(cold);
        assert!(!plan.jumbo);
        assert_eq!(plan.payloads.len(), 1);
    }

    #[test]
    fn jumbo_items_get_increasing_timestamps() {
        let config = config();
        let store = MemoryStore::with_table("Log", MemoryStoreOptions::default());
        let sink = RecordingSink::new();
        let clock = ManualClock::new(EventTime::from_secs(1), Duration::from_micros(3));
        let rng = ChaCha8Rng::seed_from_u64(5);
        let mut workload = Workload::new(&config, &store, &sink, &clock, rng).unwrap();
        let key = workload.keys().key_for(200);
        let outcome = block_on(workload.write(&key));
        assert_eq!(outcome.name, OpName::AddJumbo);
        assert_eq!(outcome.response, ResponseSummary::Written(4));
        let items = store.items_for(&key.name);
        assert_eq!(items.len(), 4);
        assert!(items.windows(2).all(|w| w[0].event_time < w[1].event_time));
    }

    #[test]
    fn stuck_cursor_is_a_pagination_error() {
        let cursor = Cursor::new(ItemKey::new("a", EventTime::from_secs(1)));
        assert!(matches!(
            next_cursor(Some(&cursor), Some(cursor.clone())),
            Err(StoreError::Pagination(_))
        ));
        assert_eq!(next_cursor(Some(&cursor), None), Ok(None));
    }
}
