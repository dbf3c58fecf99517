//! Child-process transport
//!
//! Spawns a helper executable with piped standard streams and keeps one long-lived
//! session with it. Reading is inherently blocking, so two background tasks pump
//! stdout and stderr into a single channel (stderr is merged the way a console
//! helper's diagnostics would be); every read is then a bounded wait on that
//! channel and can never stall the caller past its timeout.

use super::{check_ok, trim_line_ending, LineTransport, DEFAULT_READ_TIMEOUT};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound for the courtesy `exit` sent while closing.
const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum ReaderEvent {
    Line(String),
    Eof,
}

/// One helper process and its standard streams.
///
/// Owned by exactly one instrument client; never shared.
pub struct ProcessTransport {
    name: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<ReaderEvent>,
    readers: Vec<JoinHandle<()>>,
    eof: bool,
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("name", &self.name)
            .field("pid", &self.pid())
            .field("eof", &self.eof)
            .finish()
    }
}

impl ProcessTransport {
    /// Spawn `program` and wait for its `OK` handshake with the default 10 s bound.
    pub async fn start(program: impl AsRef<Path>, args: &[String]) -> AppResult<Self> {
        Self::start_with_timeout(program, args, DEFAULT_READ_TIMEOUT).await
    }

    /// Spawn `program` and wait up to `handshake_timeout` for its first line.
    ///
    /// # Errors
    /// `SpawnFailed` if the executable cannot be launched or exits before
    /// answering; `NotReady` if the first line is not an `OK` line or never comes.
    pub async fn start_with_timeout(
        program: impl AsRef<Path>,
        args: &[String],
        handshake_timeout: Duration,
    ) -> AppResult<Self> {
        let program = program.as_ref();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaqError::SpawnFailed {
                program: program.display().to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), true));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx, false));
        }

        let mut transport = Self {
            name,
            stdin: child.stdin.take(),
            child: Some(child),
            lines: rx,
            readers,
            eof: false,
        };

        match transport.read_line(handshake_timeout).await {
            Ok(greeting) if greeting.starts_with("OK") => {
                info!(
                    "Helper '{}' ready (pid {:?}): {}",
                    transport.name,
                    transport.pid(),
                    greeting
                );
                Ok(transport)
            }
            Ok(greeting) => {
                transport.kill().await;
                Err(DaqError::NotReady {
                    program: transport.name.clone(),
                    greeting,
                })
            }
            Err(DaqError::Closed(_)) => {
                transport.kill().await;
                Err(DaqError::SpawnFailed {
                    program: transport.name.clone(),
                    reason: "exited before the handshake".to_string(),
                })
            }
            Err(DaqError::Timeout { timeout, .. }) => {
                transport.kill().await;
                Err(DaqError::NotReady {
                    program: transport.name.clone(),
                    greeting: format!("no handshake within {:?}", timeout),
                })
            }
            Err(e) => {
                transport.kill().await;
                Err(e)
            }
        }
    }

    /// OS process id while the helper is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    async fn read_line(&mut self, timeout: Duration) -> AppResult<String> {
        if self.eof {
            return Err(DaqError::Closed(self.name.clone()));
        }
        match tokio::time::timeout(timeout, self.lines.recv()).await {
            Err(_) => Err(DaqError::Timeout {
                target: self.name.clone(),
                timeout,
            }),
            Ok(Some(ReaderEvent::Line(line))) => Ok(line),
            Ok(Some(ReaderEvent::Eof)) | Ok(None) => {
                self.eof = true;
                Err(DaqError::Closed(self.name.clone()))
            }
        }
    }

    /// Drop lines that arrived after an earlier request timed out, so they are not
    /// mistaken for the answer to the next request.
    fn discard_stale(&mut self) {
        while let Ok(event) = self.lines.try_recv() {
            match event {
                ReaderEvent::Line(line) => {
                    warn!("[{}] Discarding unsolicited line: {}", self.name, line)
                }
                ReaderEvent::Eof => {
                    self.eof = true;
                    break;
                }
            }
        }
    }

    async fn kill(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("[{}] kill: {}", self.name, e);
            }
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(
    stream: R,
    tx: mpsc::UnboundedSender<ReaderEvent>,
    report_eof: bool,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(ReaderEvent::Line(trim_line_ending(line))).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Helper stream read failed: {}", e);
                    break;
                }
            }
        }
        if report_eof {
            let _ = tx.send(ReaderEvent::Eof);
        }
    })
}

#[async_trait]
impl LineTransport for ProcessTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, line: &str, timeout: Duration) -> AppResult<String> {
        if line.contains('\n') || line.contains('\r') {
            return Err(DaqError::Protocol(format!(
                "request contains an embedded newline: {:?}",
                line
            )));
        }
        self.discard_stale();
        if self.eof {
            return Err(DaqError::Closed(self.name.clone()));
        }

        let name = self.name.clone();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DaqError::Closed(name.clone()))?;

        let payload = format!("{}\n", line);
        let written = match stdin.write_all(payload.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("[{}] write failed: {}", name, e);
            return Err(DaqError::Closed(name));
        }
        debug!("[{}] -> {}", name, line);

        let response = self.read_line(timeout).await?;
        debug!("[{}] <- {}", name, response);
        check_ok(response)
    }

    async fn read_extra_line(&mut self, timeout: Duration) -> AppResult<String> {
        let line = self.read_line(timeout).await?;
        debug!("[{}] <- ({} byte payload line)", self.name, line.len());
        Ok(line)
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if self.stdin.is_some() && !self.eof {
            if let Err(e) = self.send("exit", EXIT_TIMEOUT).await {
                debug!("[{}] exit ignored: {}", self.name, e);
            }
        }
        self.stdin = None;

        let result = match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(DaqError::Io(e)),
        };
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        info!("Helper '{}' stopped", self.name);
        result
    }
}
