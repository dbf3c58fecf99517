//! Scripted transport for protocol tests.
//!
//! Replies are consumed in order by both `send` and `read_extra_line`, the same
//! way a real helper's output would be. Every request line is recorded in a log
//! that stays readable after the transport has been moved into a client.

use super::{check_ok, LineTransport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the scripted helper does in answer to the next read.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Emit this line
    Line(String),
    /// Say nothing until the read bound expires
    Silence,
    /// Close the output stream
    Hangup,
}

/// Shared record of the traffic seen by a [`MockTransport`].
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    inner: Arc<Mutex<MockLogInner>>,
}

#[derive(Debug, Default)]
struct MockLogInner {
    sent: Vec<String>,
    timeouts: Vec<Duration>,
    close_calls: usize,
}

impl MockLog {
    fn lock(&self) -> MutexGuard<'_, MockLogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every request line, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// The read bound passed with each request.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.lock().timeouts.clone()
    }

    /// How many request lines equal `line`.
    pub fn count(&self, line: &str) -> usize {
        self.lock().sent.iter().filter(|s| s.as_str() == line).count()
    }

    /// How many times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }
}

/// In-memory [`LineTransport`] replaying a script.
#[derive(Debug)]
pub struct MockTransport {
    name: String,
    replies: VecDeque<MockReply>,
    default_reply: Option<String>,
    fail_close: bool,
    closed: bool,
    log: MockLog,
}

impl MockTransport {
    /// A transport with an empty script; unanswered reads behave like silence.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: VecDeque::new(),
            default_reply: None,
            fail_close: false,
            closed: false,
            log: MockLog::default(),
        }
    }

    /// Queue a response line.
    pub fn reply(mut self, line: impl Into<String>) -> Self {
        self.replies.push_back(MockReply::Line(line.into()));
        self
    }

    /// Queue a non-line reply.
    pub fn then(mut self, reply: MockReply) -> Self {
        self.replies.push_back(reply);
        self
    }

    /// Line used once the script is exhausted (e.g. `"OK"`).
    pub fn with_default_reply(mut self, line: impl Into<String>) -> Self {
        self.default_reply = Some(line.into());
        self
    }

    /// Make `close` report an error after recording the call.
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Handle to the traffic log.
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }

    fn next_line(&mut self, timeout: Duration) -> AppResult<String> {
        if self.closed {
            return Err(DaqError::Closed(self.name.clone()));
        }
        let reply = self
            .replies
            .pop_front()
            .or_else(|| self.default_reply.clone().map(MockReply::Line))
            .unwrap_or(MockReply::Silence);
        match reply {
            MockReply::Line(line) => Ok(line),
            MockReply::Silence => Err(DaqError::Timeout {
                target: self.name.clone(),
                timeout,
            }),
            MockReply::Hangup => {
                self.closed = true;
                Err(DaqError::Closed(self.name.clone()))
            }
        }
    }
}

#[async_trait]
impl LineTransport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, line: &str, timeout: Duration) -> AppResult<String> {
        {
            let mut log = self.log.lock();
            log.sent.push(line.to_string());
            log.timeouts.push(timeout);
        }
        let response = self.next_line(timeout)?;
        check_ok(response)
    }

    async fn read_extra_line(&mut self, timeout: Duration) -> AppResult<String> {
        self.next_line(timeout)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log.lock().close_calls += 1;
        self.closed = true;
        if self.fail_close {
            return Err(DaqError::Io(std::io::Error::other("terminate failed")));
        }
        Ok(())
    }
}
