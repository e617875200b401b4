use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use super::event::Event;

/// Timestamp layout inside the bracketed log field, e.g. `22/Apr/2025:13:37:42 +0000`.
pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Combined-log-format grammar with an optional `serverid: ` prefix.
///
/// Groups: 1 server id, 2 client ip, 3 timestamp, 4 method, 5 path,
/// 6 status, 7 user agent.
static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:([^\s:]+): )?([0-9A-Fa-f:.]+) - \S+ \[([^\]]+)\] "([A-Z]+) ([^"]+) HTTP/\d\.\d" (\S+) (?:\d+|-) "[^"]*" "([^"]*)"$"#,
    )
    .expect("log line pattern is valid")
});

/// Fixed-width shape of the timestamp field. chrono alone accepts
/// single-digit fields and `+00:00` offsets.
static TIMESTAMP_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{2}/[A-Za-z]{3}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}$")
        .expect("timestamp shape pattern is valid")
});

/// Errors from parsing a raw access-log line. Each variant carries the line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match access log grammar: {line}")]
    Malformed { line: String },

    #[error("invalid timestamp {value:?} in line: {line}")]
    InvalidTimestamp { value: String, line: String },

    #[error("invalid status {value:?} in line: {line}")]
    InvalidStatus { value: String, line: String },

    #[error("no server id for line: {line}")]
    MissingServerId { line: String },

    /// The raw bytes were not UTF-8. `line` is the lossy decoding.
    #[error("line is not valid UTF-8: {line}")]
    InvalidEncoding { line: String },
}

impl ParseError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::InvalidTimestamp { .. } => "timestamp",
            Self::InvalidStatus { .. } => "status",
            Self::MissingServerId { .. } => "server_id",
            Self::InvalidEncoding { .. } => "encoding",
        }
    }

    /// The offending raw line.
    pub fn line(&self) -> &str {
        match self {
            Self::Malformed { line }
            | Self::InvalidTimestamp { line, .. }
            | Self::InvalidStatus { line, .. }
            | Self::MissingServerId { line }
            | Self::InvalidEncoding { line } => line,
        }
    }
}

/// Decodes a raw line as UTF-8, then parses it with [`parse_line`].
pub fn parse_raw(raw: &[u8], server_id: Option<&Arc<str>>) -> Result<Event, ParseError> {
    match std::str::from_utf8(raw) {
        Ok(line) => parse_line(line, server_id),
        Err(_) => Err(ParseError::InvalidEncoding {
            line: String::from_utf8_lossy(raw).into_owned(),
        }),
    }
}

/// Parses one access-log line into an [`Event`].
///
/// A `serverid: ` prefix embedded in the line takes precedence over
/// `server_id`. Never returns a partially populated event.
pub fn parse_line(line: &str, server_id: Option<&Arc<str>>) -> Result<Event, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);

    let Some(caps) = LINE_PATTERN.captures(line) else {
        return Err(ParseError::Malformed {
            line: line.to_string(),
        });
    };

    let server_id = match (caps.get(1), server_id) {
        (Some(embedded), _) => Arc::from(embedded.as_str()),
        (None, Some(external)) => Arc::clone(external),
        (None, None) => {
            return Err(ParseError::MissingServerId {
                line: line.to_string(),
            })
        }
    };

    let raw_ts = &caps[3];
    let timestamp = parse_timestamp(raw_ts).ok_or_else(|| ParseError::InvalidTimestamp {
        value: raw_ts.to_string(),
        line: line.to_string(),
    })?;

    let raw_status = &caps[6];
    let status = parse_status(raw_status).ok_or_else(|| ParseError::InvalidStatus {
        value: raw_status.to_string(),
        line: line.to_string(),
    })?;

    Ok(Event {
        server_id,
        ip: caps[2].to_string(),
        timestamp,
        method: caps[4].to_string(),
        endpoint: caps[5].to_string(),
        status,
        user_agent: caps[7].to_string(),
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if !TIMESTAMP_SHAPE.is_match(raw) {
        return None;
    }
    DateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Status codes are exactly three ASCII digits.
fn parse_status(raw: &str) -> Option<u16> {
    if raw.len() != 3 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}
