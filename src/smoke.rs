//! 冒烟检查
//! 建表、写入两条检查条目、用一次计数查询读回；计数必须在单页内完成

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::{Item, Store, TableSchema, TimeRange};
use std::time::Duration;

/// 冒烟检查使用的分区键
pub const SMOKE_KEY: &str = "rloc:smoke";

/// 返回读回的条目数，正常情况下为 2
pub async fn check<S: Store>(store: &S, table: &str, clock: &dyn Clock) -> StoreResult<u64> {
    let status = store.ensure_table(&TableSchema::composite(table)).await?;
    tracing::debug!(table, ?status, "smoke table ready");

    let first = clock.now();
    let second = first.saturating_add(Duration::from_secs(1));
    for (event_time, payload) in [(first, "SMOKE0"), (second, "SMOKE1")] {
        store
            .put(Item {
                id: SMOKE_KEY.to_string(),
                event_time,
                payload: payload.to_string(),
            })
            .await?;
    }

    let range = TimeRange::inclusive(
        first.saturating_sub(Duration::from_secs(8)),
        second.saturating_add(Duration::from_secs(1)),
    );
    let page = store.query_count(SMOKE_KEY, range, None).await?;
    if page.next.is_some() {
        return Err(StoreError::Pagination(
            "smoke count spans more than one page".into(),
        ));
    }
    tracing::info!(table, count = page.items, "smoke count");
    Ok(page.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{EventTime, MemoryStore, MemoryStoreOptions};

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        compio::runtime::Runtime::new()
            .expect("Failed to create Compio runtime")
            .block_on(future)
    }

    #[test]
    fn smoke_check_counts_both_items() {
        let store = MemoryStore::new("LogSmoke", MemoryStoreOptions::default());
        let clock = ManualClock::new(EventTime::from_secs(12_345_678), Duration::from_secs(1));
        assert_eq!(block_on(check(&store, "LogSmoke", &clock)), Ok(2));
    }

    #[test]
    fn paginated_smoke_count_is_an_error() {
        let store = MemoryStore::new(
            "LogSmoke",
            MemoryStoreOptions {
                page_size: 1,
                ..MemoryStoreOptions::default()
            },
        );
        let clock = ManualClock::new(EventTime::from_secs(12_345_678), Duration::from_secs(1));
        assert!(matches!(
            block_on(check(&store, "LogSmoke", &clock)),
            Err(StoreError::Pagination(_))
        ));
    }
}
