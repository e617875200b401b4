use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::pipeline::record::AggregateRecord;

use super::{to_ndjson, Store};

/// Prints each batch to stdout as NDJSON.
#[derive(Debug, Default)]
pub struct StdoutStore;

impl StdoutStore {
    pub fn new() -> Self {
        Self
    }
}

impl Store for StdoutStore {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn store(&self, batch: &[AggregateRecord]) -> Result<()> {
        let buf = to_ndjson(batch).context("serializing aggregate records")?;

        let mut out = tokio::io::stdout();
        out.write_all(&buf).await.context("writing to stdout")?;
        out.flush().await.context("flushing stdout")?;

        Ok(())
    }
}
