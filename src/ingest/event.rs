use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single parsed access-log record.
///
/// Built by [`super::parse::parse_line`] and consumed once by the mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Identifies the web server that produced the line.
    pub server_id: Arc<str>,
    /// Client address as written in the log (IPv4 or IPv6).
    pub ip: String,
    /// Request instant, normalised to UTC.
    pub timestamp: DateTime<Utc>,
    /// HTTP method, e.g. "GET".
    pub method: String,
    /// Requested path including any query string.
    pub endpoint: String,
    /// HTTP response status.
    pub status: u16,
    /// Raw user-agent header value.
    pub user_agent: String,
}

/// Aggregation axis for request counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Ip,
    Endpoint,
    Method,
    Status,
}

impl Dimension {
    /// Every supported dimension in emission order.
    pub const ALL: [Dimension; 4] = [
        Dimension::Ip,
        Dimension::Endpoint,
        Dimension::Method,
        Dimension::Status,
    ];

    /// Dimensions aggregated when none are configured.
    pub const DEFAULT: [Dimension; 2] = [Dimension::Ip, Dimension::Endpoint];

    /// Returns the stable label used in storage and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Endpoint => "endpoint",
            Self::Method => "method",
            Self::Status => "status",
        }
    }

    /// Parses a dimension from its storage label.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    /// Extracts this dimension's value from an event.
    pub fn value_of(self, event: &Event) -> String {
        match self {
            Self::Ip => event.ip.clone(),
            Self::Endpoint => event.endpoint.clone(),
            Self::Method => event.method.clone(),
            Self::Status => event.status.to_string(),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
