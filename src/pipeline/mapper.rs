use std::sync::Arc;

use crate::ingest::event::{Dimension, Event};

use super::record::PartialCount;

/// Emits one unit count per configured dimension, in `dimensions` order.
pub fn map_event(event: &Event, dimensions: &[Dimension]) -> Vec<PartialCount> {
    dimensions
        .iter()
        .map(|&dimension| PartialCount {
            server_id: Arc::clone(&event.server_id),
            dimension,
            value: dimension.value_of(event),
            count: 1,
        })
        .collect()
}
