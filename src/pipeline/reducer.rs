use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::record::{AggregateRecord, GroupKey, PartialCount};

/// Folds one group into a single record stamped with `now`.
pub fn reduce_group(key: GroupKey, group: &[PartialCount], now: DateTime<Utc>) -> AggregateRecord {
    let count = group.iter().map(|pc| pc.count).sum();

    AggregateRecord {
        server_id: key.server_id,
        dimension: key.dimension,
        value: key.value,
        count,
        created_at: now,
        updated_at: now,
    }
}

/// Reduces every group of a window. All records share one reduction instant.
pub fn reduce_all(
    groups: BTreeMap<GroupKey, Vec<PartialCount>>,
    now: DateTime<Utc>,
) -> Vec<AggregateRecord> {
    groups
        .into_iter()
        .map(|(key, group)| reduce_group(key, &group, now))
        .collect()
}
