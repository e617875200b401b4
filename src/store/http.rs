use std::io::Write;

use anyhow::{bail, Context, Result};

use crate::config::HttpStoreConfig;
use crate::pipeline::record::AggregateRecord;

use super::{to_ndjson, Store};

/// Sends each batch as one compressed NDJSON POST (e.g., to Vector).
pub struct HttpStore {
    cfg: HttpStoreConfig,
    client: reqwest::Client,
}

impl HttpStore {
    /// Builds the HTTP client. No request is made until the first batch.
    pub fn new(cfg: HttpStoreConfig) -> Result<Self> {
        // Reject unknown algorithms up front rather than on every batch.
        compress(&[], &cfg.compression)?;

        let mut client_builder = reqwest::Client::builder().timeout(cfg.export_timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        Ok(Self { cfg, client })
    }
}

impl Store for HttpStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn store(&self, batch: &[AggregateRecord]) -> Result<()> {
        let buf = to_ndjson(batch).context("serializing aggregate records to JSON")?;
        let raw_len = buf.len();

        let body = compress(&buf, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.context("sending HTTP store request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP store unexpected status: {status}");
        }

        tracing::debug!(records = batch.len(), bytes = raw_len, "stored batch via HTTP");

        Ok(())
    }
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}
