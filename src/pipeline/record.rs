use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ingest::event::Dimension;

/// Map-phase output: one observation of `value` along `dimension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCount {
    pub server_id: Arc<str>,
    pub dimension: Dimension,
    pub value: String,
    pub count: u64,
}

impl PartialCount {
    /// Returns the bucket this record folds into.
    pub fn key(&self) -> GroupKey {
        GroupKey {
            server_id: Arc::clone(&self.server_id),
            dimension: self.dimension,
            value: self.value.clone(),
        }
    }
}

/// Identifies one aggregate bucket. Equality is exact, with no normalisation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub server_id: Arc<str>,
    pub dimension: Dimension,
    pub value: String,
}

/// Reduce-phase output: the count seen for one key during one window.
///
/// Each record is an independent snapshot; records are never merged with
/// totals from earlier windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRecord {
    pub server_id: Arc<str>,
    pub dimension: Dimension,
    pub value: String,
    pub count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
