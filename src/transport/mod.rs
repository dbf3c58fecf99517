//! Line-oriented transports to instrument helper processes
//!
//! Every instrument helper speaks the same request/response protocol over its
//! standard streams:
//!
//! - Requests are single UTF-8 lines terminated by `\n`.
//! - Responses are single lines; success starts with the literal `OK`, anything
//!   else is an error whose full text is the diagnostic.
//! - Some responses carry `KEY=value` metadata tokens after the status token
//!   (`OK HIST CH=4 LEN=1024 BYTES=16384`).
//! - An acquisition response is followed immediately by one raw base64 line.
//!
//! [`LineTransport`] is the seam the instrument clients are written against.
//! [`ProcessTransport`] drives a real child process, [`MockTransport`] replays
//! scripted responses for protocol tests.

pub mod mock;
pub mod process;

pub use mock::MockTransport;
pub use process::ProcessTransport;

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Default bound for the handshake and for ordinary commands.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Request/response channel to one instrument helper.
///
/// Exactly one request may be in flight per transport; `&mut self` enforces that.
#[async_trait]
pub trait LineTransport: Send {
    /// Human readable name used in errors and logs.
    fn name(&self) -> &str;

    /// Write `line` plus a newline, then wait up to `timeout` for the response line.
    ///
    /// # Errors
    /// `Timeout` when nothing arrives in time, `Closed` when the stream ended,
    /// `Rejected` (carrying the raw text) when the line does not start with `OK`.
    async fn send(&mut self, line: &str, timeout: Duration) -> AppResult<String>;

    /// Read one more raw line without sending anything.
    ///
    /// Only valid right after a response that declared a trailing payload.
    async fn read_extra_line(&mut self, timeout: Duration) -> AppResult<String>;

    /// Best-effort `exit`, then terminate the helper. Safe to call more than once.
    async fn close(&mut self) -> AppResult<()>;
}

/// Classify a response line: `OK...` passes through, anything else is `Rejected`.
pub fn check_ok(line: String) -> AppResult<String> {
    if line.starts_with("OK") {
        Ok(line)
    } else {
        Err(DaqError::Rejected(line))
    }
}

/// Strip a trailing `\n` or `\r\n` from a raw line.
pub(crate) fn trim_line_ending(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// `KEY=value` tokens parsed out of a response line.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    fields: HashMap<String, String>,
}

impl ResponseMetadata {
    /// Collect every whitespace separated token that contains `=`.
    ///
    /// Bare tokens such as the `OK` status or the `HIST` tag are ignored.
    pub fn parse(response: &str) -> Self {
        let fields = response
            .split_whitespace()
            .filter_map(|token| token.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Self { fields }
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Value for `key` parsed as `T`.
    ///
    /// # Errors
    /// `Protocol` if the key is absent or the value does not parse.
    pub fn require<T: std::str::FromStr>(&self, key: &str) -> AppResult<T> {
        let raw = self
            .get(key)
            .ok_or_else(|| DaqError::Protocol(format!("response missing '{}='", key)))?;
        raw.parse::<T>()
            .map_err(|_| DaqError::Protocol(format!("'{}={}' is not a valid number", key, raw)))
    }
}
