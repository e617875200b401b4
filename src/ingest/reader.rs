use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use super::LineSource;

/// Reads newline-delimited log lines from stdin, a file, or any buffered reader.
///
/// Lines are returned as raw bytes; decoding happens in the parser so one
/// non-UTF-8 line does not end the stream.
pub struct ReaderSource<R> {
    name: String,
    reader: R,
    buf: Vec<u8>,
}

impl ReaderSource<BufReader<tokio::io::Stdin>> {
    /// Reads from the process's standard input.
    pub fn stdin() -> Self {
        Self::new("stdin", BufReader::new(tokio::io::stdin()))
    }
}

impl ReaderSource<BufReader<tokio::fs::File>> {
    /// Opens `path` for reading.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening log file {}", path.display()))?;
        let name = format!("file:{}", PathBuf::from(path).display());
        Ok(Self::new(name, BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin + Send> ReaderSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            buf: Vec::new(),
        }
    }
}

impl<R: AsyncBufRead + Unpin + Send> LineSource for ReaderSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        // Partial reads stay in `buf` if this future is dropped.
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .with_context(|| format!("reading line from {}", self.name))?;

        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }
}
