//! 存储抽象模块
//! 定义复合键（分区键 `Id` + 数值排序键 `EventDate`）存储的统一接口

pub mod memory;

use crate::error::StoreResult;
use std::fmt;
use std::time::Duration;

pub use memory::{MemoryStore, MemoryStoreOptions, StoreStats};

/// 分区键属性名
pub const PARTITION_KEY: &str = "Id";
/// 排序键属性名
pub const SORT_KEY: &str = "EventDate";

/// 排序键：自 Unix 纪元起的微秒数
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventTime(u64);

impl EventTime {
    pub const ZERO: EventTime = EventTime(0);

    pub const fn from_micros(micros: u64) -> Self {
        EventTime(micros)
    }

    pub const fn from_secs(secs: u64) -> Self {
        EventTime(secs.saturating_mul(1_000_000))
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// 回退若干秒，下限为 0
    pub fn saturating_sub_secs(self, secs: u64) -> Self {
        self.saturating_sub(Duration::from_secs(secs))
    }

    pub fn saturating_sub(self, delta: Duration) -> Self {
        let delta = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        EventTime(self.0.saturating_sub(delta))
    }

    pub fn saturating_add(self, delta: Duration) -> Self {
        let delta = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        EventTime(self.0.saturating_add(delta))
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// 条目主键
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub id: String,
    pub event_time: EventTime,
}

impl ItemKey {
    pub fn new(id: impl Into<String>, event_time: EventTime) -> Self {
        Self {
            id: id.into(),
            event_time,
        }
    }
}

/// 条目：只追加，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub event_time: EventTime,
    /// 交易 id
    pub payload: String,
}

impl Item {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.id.clone(), self.event_time)
    }
}

/// 区间终点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    Inclusive(EventTime),
    Exclusive(EventTime),
}

/// 排序键区间，起点总是包含
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: EventTime,
    pub end: RangeEnd,
}

impl TimeRange {
    /// `[start, end]`
    pub fn inclusive(start: EventTime, end: EventTime) -> Self {
        Self {
            start,
            end: RangeEnd::Inclusive(end),
        }
    }

    /// `[0, cutoff)`
    pub fn before(cutoff: EventTime) -> Self {
        Self {
            start: EventTime::ZERO,
            end: RangeEnd::Exclusive(cutoff),
        }
    }

    pub fn contains(&self, t: EventTime) -> bool {
        t >= self.start
            && match self.end {
                RangeEnd::Inclusive(end) => t <= end,
                RangeEnd::Exclusive(end) => t < end,
            }
    }

    pub fn is_empty(&self) -> bool {
        match self.end {
            RangeEnd::Inclusive(end) => end < self.start,
            RangeEnd::Exclusive(end) => end <= self.start,
        }
    }
}

/// 扫描时返回的属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// 仅 `EventDate`
    EventTime,
    /// `Id,EventDate`
    Key,
}

/// 投影后的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedItem {
    pub id: Option<String>,
    pub event_time: EventTime,
}

/// 批量删除时用于去重的属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAttribute {
    Id,
    EventTime,
}

/// 续页游标：上一页最后一个被评估的键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(ItemKey);

impl Cursor {
    pub fn new(last_evaluated: ItemKey) -> Self {
        Cursor(last_evaluated)
    }

    pub fn last_evaluated(&self) -> &ItemKey {
        &self.0
    }
}

/// 一页结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: T,
    pub next: Option<Cursor>,
}

/// 表结构
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub partition_key: &'static str,
    pub sort_key: &'static str,
    pub read_capacity: u64,
    pub write_capacity: u64,
}

impl TableSchema {
    /// 字符串分区键 `Id`，数值排序键 `EventDate`
    pub fn composite(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: PARTITION_KEY,
            sort_key: SORT_KEY,
            read_capacity: 5,
            write_capacity: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Created,
    AlreadyExists,
}

/// 存储操作trait，统一接口
///
/// 每个方法都是一个阻塞 I/O 边界（协作式调度下即挂起点）。
/// 实现需允许多个虚拟用户并发调用，自行处理连接池等并发细节。
#[allow(async_fn_in_trait)]
pub trait Store: Sync {
    /// 不存在时建表，幂等
    async fn ensure_table(&self, schema: &TableSchema) -> StoreResult<TableStatus>;

    async fn put(&self, item: Item) -> StoreResult<()>;

    /// 合并为一次提交的批量写
    async fn put_batch(&self, items: Vec<Item>) -> StoreResult<()>;

    async fn delete(&self, key: &ItemKey) -> StoreResult<()>;

    /// 合并为一次提交的批量删除；`dedupe` 为空时重复键是错误
    async fn delete_batch(&self, keys: Vec<ItemKey>, dedupe: &[KeyAttribute]) -> StoreResult<()>;

    /// 单页计数
    async fn query_count(
        &self,
        id: &str,
        range: TimeRange,
        cursor: Option<&Cursor>,
    ) -> StoreResult<Page<u64>>;

    /// 单页条目扫描
    async fn query_items(
        &self,
        id: &str,
        range: TimeRange,
        projection: Projection,
        cursor: Option<&Cursor>,
    ) -> StoreResult<Page<Vec<ProjectedItem>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_honour_their_bounds() {
        let a = EventTime::from_secs(10);
        let b = EventTime::from_secs(20);
        let closed = TimeRange::inclusive(a, b);
        assert!(closed.contains(a));
        assert!(closed.contains(b));
        assert!(!closed.contains(b.saturating_add(Duration::from_micros(1))));

        let open = TimeRange::before(b);
        assert!(open.contains(EventTime::ZERO));
        assert!(!open.contains(b));
        assert!(TimeRange::before(EventTime::ZERO).is_empty());
    }

    #[test]
    fn event_time_arithmetic_saturates() {
        let t = EventTime::from_secs(5);
        assert_eq!(t.saturating_sub_secs(300), EventTime::ZERO);
        assert_eq!(t.saturating_sub_secs(2), EventTime::from_secs(3));
        assert_eq!(t.to_string(), "5.000000");
    }
}
