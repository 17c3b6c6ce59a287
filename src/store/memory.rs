//! 内存存储
//! 线程安全的进程内 `Store` 实现，用于测试、基准测试与空跑

use super::{
    Cursor, Item, ItemKey, KeyAttribute, Page, ProjectedItem, Projection, RangeEnd, Store,
    TableSchema, TableStatus, TimeRange,
};
use crate::error::{StoreError, StoreResult};
use rand::prelude::*;
use rand::rngs::SmallRng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Bound, RangeInclusive};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 内存存储参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStoreOptions {
    /// 每页最多评估的条目数
    pub page_size: usize,
    /// 模拟的单次调用延迟
    pub latency: RangeInclusive<Duration>,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            page_size: crate::config::defaults::PAGE_SIZE,
            latency: Duration::ZERO..=Duration::ZERO,
        }
    }
}

/// 调用种类，用于计数与故障注入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Put,
    PutBatch,
    Delete,
    DeleteBatch,
    QueryCount,
    QueryItems,
}

/// 各类调用次数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub puts: u64,
    pub put_batches: u64,
    pub deletes: u64,
    pub delete_batches: u64,
    pub count_queries: u64,
    pub item_queries: u64,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    put_batches: AtomicU64,
    deletes: AtomicU64,
    delete_batches: AtomicU64,
    count_queries: AtomicU64,
    item_queries: AtomicU64,
}

impl Counters {
    fn slot(&self, call: StoreCall) -> &AtomicU64 {
        match call {
            StoreCall::Put => &self.puts,
            StoreCall::PutBatch => &self.put_batches,
            StoreCall::Delete => &self.deletes,
            StoreCall::DeleteBatch => &self.delete_batches,
            StoreCall::QueryCount => &self.count_queries,
            StoreCall::QueryItems => &self.item_queries,
        }
    }

    /// 返回本次调用的序号（从 1 开始）
    fn bump(&self, call: StoreCall) -> u64 {
        self.slot(call).fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            put_batches: self.put_batches.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            delete_batches: self.delete_batches.load(Ordering::Relaxed),
            count_queries: self.count_queries.load(Ordering::Relaxed),
            item_queries: self.item_queries.load(Ordering::Relaxed),
        }
    }
}

/// 注入的故障：该类调用在成功 `after` 次之后全部失败
#[derive(Debug, Clone)]
struct Fault {
    after: u64,
    error: StoreError,
}

/// 内存存储，绑定到一张表
pub struct MemoryStore {
    table: String,
    options: MemoryStoreOptions,
    rows: Mutex<Option<BTreeMap<ItemKey, String>>>,
    counters: Counters,
    faults: Mutex<HashMap<StoreCall, Fault>>,
    latency_rng: Mutex<SmallRng>,
}

impl MemoryStore {
    /// 创建绑定到 `table` 的存储；表需经 `ensure_table` 创建后才可读写
    pub fn new(table: impl Into<String>, options: MemoryStoreOptions) -> Self {
        Self {
            table: table.into(),
            options,
            rows: Mutex::new(None),
            counters: Counters::default(),
            faults: Mutex::new(HashMap::new()),
            latency_rng: Mutex::new(SmallRng::from_rng(&mut rand::rng())),
        }
    }

    /// 创建并立即建表
    pub fn with_table(table: impl Into<String>, options: MemoryStoreOptions) -> Self {
        let store = Self::new(table, options);
        store.create_table();
        store
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }

    /// 当前条目总数
    pub fn len(&self) -> usize {
        self.with_rows(|rows| rows.map_or(0, BTreeMap::len))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 某个分区下的全部条目，按排序键升序
    pub fn items_for(&self, id: &str) -> Vec<Item> {
        self.with_rows(|rows| {
            rows.map(|rows| {
                rows.iter()
                    .filter(|(key, _)| key.id == id)
                    .map(|(key, payload)| Item {
                        id: key.id.clone(),
                        event_time: key.event_time,
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    /// 让 `call` 在再成功 `after` 次后持续返回 `error`
    pub fn inject_failure(&self, call: StoreCall, after: u64, error: StoreError) {
        let base = self.counters.slot(call).load(Ordering::Relaxed);
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(
            call,
            Fault {
                after: base + after,
                error,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn create_table(&self) -> TableStatus {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        if rows.is_some() {
            TableStatus::AlreadyExists
        } else {
            *rows = Some(BTreeMap::new());
            TableStatus::Created
        }
    }

    fn with_rows<R>(&self, f: impl FnOnce(Option<&BTreeMap<ItemKey, String>>) -> R) -> R {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        f(rows.as_ref())
    }

    fn with_rows_mut<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<ItemKey, String>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        match rows.as_mut() {
            Some(rows) => f(rows),
            None => Err(StoreError::ResourceNotFound(format!(
                "table {} does not exist",
                self.table
            ))),
        }
    }

    /// 计数、模拟延迟、检查注入的故障
    async fn enter(&self, call: StoreCall) -> StoreResult<()> {
        let seq = self.counters.bump(call);
        self.simulate_backend_latency().await;
        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.get(&call) {
            Some(fault) if seq > fault.after => Err(fault.error.clone()),
            _ => Ok(()),
        }
    }

    /// 模拟后端延迟
    async fn simulate_backend_latency(&self) {
        let (lo, hi) = (*self.options.latency.start(), *self.options.latency.end());
        if hi.is_zero() {
            return;
        }
        let delay_us = {
            let mut rng = self.latency_rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random_range(lo.as_micros() as u64..=hi.as_micros() as u64)
        };
        compio::time::sleep(Duration::from_micros(delay_us)).await;
    }

    /// 在一页内扫描 `id` 下落在 `range` 中的键
    fn scan_page(
        &self,
        rows: &BTreeMap<ItemKey, String>,
        id: &str,
        range: TimeRange,
        cursor: Option<&Cursor>,
    ) -> StoreResult<Page<Vec<ItemKey>>> {
        let lower = match cursor {
            Some(cursor) => {
                let last = cursor.last_evaluated();
                if last.id != id {
                    return Err(StoreError::Validation(format!(
                        "cursor belongs to partition {}, not {id}",
                        last.id
                    )));
                }
                Bound::Excluded(last.clone())
            }
            None => Bound::Included(ItemKey::new(id, range.start)),
        };
        let upper = match range.end {
            RangeEnd::Inclusive(end) => Bound::Included(ItemKey::new(id, end)),
            RangeEnd::Exclusive(end) => Bound::Excluded(ItemKey::new(id, end)),
        };
        if bounds_empty(&lower, &upper) {
            return Ok(Page {
                items: Vec::new(),
                next: None,
            });
        }

        let page_size = self.options.page_size.max(1);
        let mut keys: Vec<ItemKey> = rows
            .range((lower, upper))
            .take(page_size + 1)
            .map(|(key, _)| key.clone())
            .collect();
        let next = if keys.len() > page_size {
            keys.truncate(page_size);
            keys.last().cloned().map(Cursor::new)
        } else {
            None
        };
        Ok(Page { items: keys, next })
    }
}

/// `BTreeMap::range` 对空区间会 panic，这里先判断
fn bounds_empty(lower: &Bound<ItemKey>, upper: &Bound<ItemKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

impl Store for MemoryStore {
    async fn ensure_table(&self, schema: &TableSchema) -> StoreResult<TableStatus> {
        if schema.name != self.table {
            return Err(StoreError::Validation(format!(
                "store is bound to table {}, not {}",
                self.table, schema.name
            )));
        }
        Ok(self.create_table())
    }

    async fn put(&self, item: Item) -> StoreResult<()> {
        self.enter(StoreCall::Put).await?;
        self.with_rows_mut(|rows| {
            rows.insert(ItemKey::new(item.id, item.event_time), item.payload);
            Ok(())
        })
    }

    async fn put_batch(&self, items: Vec<Item>) -> StoreResult<()> {
        self.enter(StoreCall::PutBatch).await?;
        self.with_rows_mut(|rows| {
            for item in items {
                rows.insert(ItemKey::new(item.id, item.event_time), item.payload);
            }
            Ok(())
        })
    }

    async fn delete(&self, key: &ItemKey) -> StoreResult<()> {
        self.enter(StoreCall::Delete).await?;
        self.with_rows_mut(|rows| {
            rows.remove(key);
            Ok(())
        })
    }

    async fn delete_batch(
        &self,
        keys: Vec<ItemKey>,
        dedupe_on: &[KeyAttribute],
    ) -> StoreResult<()> {
        self.enter(StoreCall::DeleteBatch).await?;
        let dedupe = dedupe_on.contains(&KeyAttribute::Id)
            && dedupe_on.contains(&KeyAttribute::EventTime);
        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(key) && !dedupe {
                return Err(StoreError::Validation(format!(
                    "batch contains duplicate key {}@{}",
                    key.id, key.event_time
                )));
            }
        }
        self.with_rows_mut(|rows| {
            for key in &keys {
                rows.remove(key);
            }
            Ok(())
        })
    }

    async fn query_count(
        &self,
        id: &str,
        range: TimeRange,
        cursor: Option<&Cursor>,
    ) -> StoreResult<Page<u64>> {
        self.enter(StoreCall::QueryCount).await?;
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let rows = rows.as_ref().ok_or_else(|| {
            StoreError::ResourceNotFound(format!("table {} does not exist", self.table))
        })?;
        let page = self.scan_page(rows, id, range, cursor)?;
        Ok(Page {
            items: page.items.len() as u64,
            next: page.next,
        })
    }

    async fn query_items(
        &self,
        id: &str,
        range: TimeRange,
        projection: Projection,
        cursor: Option<&Cursor>,
    ) -> StoreResult<Page<Vec<ProjectedItem>>> {
        self.enter(StoreCall::QueryItems).await?;
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let rows = rows.as_ref().ok_or_else(|| {
            StoreError::ResourceNotFound(format!("table {} does not exist", self.table))
        })?;
        let page = self.scan_page(rows, id, range, cursor)?;
        let items = page
            .items
            .into_iter()
            .map(|key| ProjectedItem {
                id: match projection {
                    Projection::Key => Some(key.id),
                    Projection::EventTime => None,
                },
                event_time: key.event_time,
            })
            .collect();
        Ok(Page {
            items,
            next: page.next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventTime;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        compio::runtime::Runtime::new()
            .expect("Failed to create Compio runtime")
            .block_on(future)
    }

    fn item(id: &str, secs: u64) -> Item {
        Item {
            id: id.to_string(),
            event_time: EventTime::from_secs(secs),
            payload: format!("P{secs}"),
        }
    }

    fn paged_store(page_size: usize) -> MemoryStore {
        MemoryStore::with_table(
            "Log",
            MemoryStoreOptions {
                page_size,
                ..MemoryStoreOptions::default()
            },
        )
    }

    #[test]
    fn ensure_table_is_idempotent() {
        block_on(async {
            let store = MemoryStore::new("Log", MemoryStoreOptions::default());
            assert!(matches!(
                store.put(item("a", 1)).await,
                Err(StoreError::ResourceNotFound(_))
            ));
            let schema = TableSchema::composite("Log");
            assert_eq!(store.ensure_table(&schema).await, Ok(TableStatus::Created));
            assert_eq!(
                store.ensure_table(&schema).await,
                Ok(TableStatus::AlreadyExists)
            );
            let other = TableSchema::composite("Other");
            assert!(store.ensure_table(&other).await.is_err());
        });
    }

    #[test]
    fn counts_follow_cursors_across_pages() {
        block_on(async {
            let store = paged_store(2);
            for secs in 1..=5 {
                store.put(item("a", secs)).await.unwrap();
            }
            store.put(item("b", 3)).await.unwrap();

            let range = TimeRange::inclusive(EventTime::from_secs(1), EventTime::from_secs(5));
            let mut total = 0;
            let mut pages = 0;
            let mut cursor = None;
            loop {
                let page = store
                    .query_count("a", range, cursor.as_ref())
                    .await
                    .unwrap();
                total += page.items;
                pages += 1;
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            assert_eq!(total, 5);
            assert_eq!(pages, 3);
            assert_eq!(store.stats().count_queries, 3);
        });
    }

    #[test]
    fn exclusive_end_and_projection() {
        block_on(async {
            let store = paged_store(10);
            for secs in [1, 2, 3] {
                store.put(item("a", secs)).await.unwrap();
            }
            let before = TimeRange::before(EventTime::from_secs(3));
            let page = store
                .query_items("a", before, Projection::EventTime, None)
                .await
                .unwrap();
            assert_eq!(page.next, None);
            assert_eq!(page.items.len(), 2);
            assert!(page.items.iter().all(|p| p.id.is_none()));

            let page = store
                .query_items("a", before, Projection::Key, None)
                .await
                .unwrap();
            assert_eq!(page.items[0].id.as_deref(), Some("a"));
        });
    }

    #[test]
    fn empty_ranges_do_not_panic() {
        block_on(async {
            let store = paged_store(1);
            store.put(item("a", 1)).await.unwrap();
            let page = store
                .query_count("a", TimeRange::before(EventTime::ZERO), None)
                .await
                .unwrap();
            assert_eq!((page.items, page.next), (0, None));
            let inverted = TimeRange::inclusive(EventTime::from_secs(9), EventTime::from_secs(1));
            let page = store.query_count("a", inverted, None).await.unwrap();
            assert_eq!(page.items, 0);
        });
    }

    #[test]
    fn batch_delete_rejects_duplicates_unless_deduped() {
        block_on(async {
            let store = paged_store(10);
            let items = vec![item("a", 1), item("a", 2)];
            store.put_batch(items).await.unwrap();
            let key = ItemKey::new("a", EventTime::from_secs(1));
            let dup = vec![key.clone(), key.clone()];
            assert!(matches!(
                store.delete_batch(dup.clone(), &[]).await,
                Err(StoreError::Validation(_))
            ));
            assert_eq!(store.len(), 2);
            store
                .delete_batch(dup, &[KeyAttribute::Id, KeyAttribute::EventTime])
                .await
                .unwrap();
            assert_eq!(store.len(), 1);
            assert_eq!(store.stats().delete_batches, 2);
        });
    }

    #[test]
    fn injected_failures_start_after_threshold() {
        block_on(async {
            let store = paged_store(10);
            store.inject_failure(StoreCall::Put, 1, StoreError::Throttled("busy".into()));
            assert!(store.put(item("a", 1)).await.is_ok());
            assert_eq!(
                store.put(item("a", 2)).await,
                Err(StoreError::Throttled("busy".into()))
            );
            store.clear_failures();
            assert!(store.put(item("a", 3)).await.is_ok());
            assert_eq!(store.items_for("a").len(), 2);
        });
    }

    #[test]
    fn foreign_cursor_is_rejected() {
        block_on(async {
            let store = paged_store(10);
            let cursor = Cursor::new(ItemKey::new("b", EventTime::from_secs(1)));
            let range = TimeRange::inclusive(EventTime::ZERO, EventTime::from_secs(9));
            assert!(matches!(
                store.query_count("a", range, Some(&cursor)).await,
                Err(StoreError::Validation(_))
            ));
        });
    }
}
