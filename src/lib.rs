//! Streaming map-reduce aggregation of web-server access logs.
//!
//! Lines flow through parse and map into a window accumulator, which groups
//! and reduces them once per interval into per-(server, dimension, value)
//! counts. A sink accumulator batches those counts into the configured
//! stores. Both hand-offs are bounded queues, so a slow store eventually
//! slows reads from the source.

pub mod agent;
pub mod config;
pub mod health;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod store;
