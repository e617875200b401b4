use std::collections::BTreeMap;

use super::record::{GroupKey, PartialCount};

/// Partitions a window's records by key.
///
/// Groups iterate in key order; records keep arrival order within a group.
pub fn group_by_key(batch: Vec<PartialCount>) -> BTreeMap<GroupKey, Vec<PartialCount>> {
    let mut groups: BTreeMap<GroupKey, Vec<PartialCount>> = BTreeMap::new();

    for pc in batch {
        groups.entry(pc.key()).or_default().push(pc);
    }

    groups
}
