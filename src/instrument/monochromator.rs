//! Monochromator collaborator
//!
//! The monochromator has no persistent session: every call launches
//! `<program> <args...> <command> [value]`, waits for it to exit and returns its
//! trimmed standard output.
//!
//! Settling after a `goto` is a [`SettleStrategy`]. The default is a fixed wait;
//! polling `position()` is available for drivers that report motion honestly.

use super::Monochromator;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Default bound for one collaborator call.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(45);

/// [`Monochromator`] driven by one short-lived process per call.
#[derive(Debug, Clone)]
pub struct CommandMonochromator {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandMonochromator {
    /// `args` are placed before the command name on every call.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-call bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one command and return its trimmed standard output.
    ///
    /// # Errors
    /// `SpawnFailed` if the program cannot be launched, `Timeout` (after killing
    /// the child) if it outlives the bound, `Monochromator` on a non-zero exit.
    pub async fn run(&self, command: &str, value: Option<f64>) -> AppResult<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(value) = value {
            cmd.arg(format_value(value));
        }

        let child = cmd.spawn().map_err(|e| DaqError::SpawnFailed {
            program: self.program.display().to_string(),
            reason: e.to_string(),
        })?;

        // Dropping the pending wait on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| DaqError::Timeout {
                target: format!("monochromator '{}'", command),
                timeout: self.timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(DaqError::Monochromator {
                command: command.to_string(),
                message,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("monochromator {} {:?} -> {}", command, value, stdout);
        Ok(stdout)
    }
}

/// Render a wavelength argument, always with a decimal point (`510.0`).
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

#[async_trait]
impl Monochromator for CommandMonochromator {
    async fn goto(&self, wavelength_nm: f64) -> AppResult<()> {
        self.run("goto", Some(wavelength_nm)).await?;
        info!("Monochromator -> {:.1} nm", wavelength_nm);
        Ok(())
    }

    async fn position(&self) -> AppResult<f64> {
        let output = self.run("position", None).await?;
        output.parse::<f64>().map_err(|_| {
            DaqError::Protocol(format!("monochromator position '{}' is not a number", output))
        })
    }

    async fn open_shutter(&self) -> AppResult<()> {
        self.run("open_shutter", None).await.map(|_| ())
    }

    async fn close_shutter(&self) -> AppResult<()> {
        self.run("close_shutter", None).await.map(|_| ())
    }
}

/// How the scan waits for the monochromator after a `goto`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SettleStrategy {
    /// Sleep for the scan's `mono_settle_ms`.
    #[default]
    Fixed,
    /// Poll `position()` until it is within `tolerance_nm` of the target.
    PollPosition {
        /// Accepted distance from the target
        tolerance_nm: f64,
        /// Wait between polls
        poll_interval_ms: u64,
        /// Give up after this long
        timeout_ms: u64,
    },
}

impl SettleStrategy {
    /// Wait until the monochromator has settled at `target_nm`.
    ///
    /// `fixed_delay` is only used by [`SettleStrategy::Fixed`].
    pub async fn settle(
        &self,
        mono: &dyn Monochromator,
        target_nm: f64,
        fixed_delay: Duration,
    ) -> AppResult<()> {
        match *self {
            SettleStrategy::Fixed => {
                sleep(fixed_delay).await;
                Ok(())
            }
            SettleStrategy::PollPosition {
                tolerance_nm,
                poll_interval_ms,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(timeout_ms);
                let deadline = Instant::now() + timeout;
                loop {
                    let position = mono.position().await?;
                    if (position - target_nm).abs() <= tolerance_nm {
                        debug!("monochromator settled at {:.2} nm", position);
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(DaqError::Timeout {
                            target: format!("monochromator settling at {:.1} nm", target_nm),
                            timeout,
                        });
                    }
                    sleep(Duration::from_millis(poll_interval_ms)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockMonochromator;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(510.0), "510.0");
        assert_eq!(format_value(510.25), "510.25");
    }

    #[tokio::test]
    async fn test_poll_position_settles_when_within_tolerance() {
        let mono = MockMonochromator::new().with_lag(2);
        mono.goto(520.0).await.unwrap();
        let strategy = SettleStrategy::PollPosition {
            tolerance_nm: 0.1,
            poll_interval_ms: 1,
            timeout_ms: 1_000,
        };
        strategy
            .settle(&mono, 520.0, Duration::ZERO)
            .await
            .unwrap();
        assert!(mono.position_queries() >= 3);
    }

    #[tokio::test]
    async fn test_poll_position_times_out() {
        let mono = MockMonochromator::new();
        mono.goto(500.0).await.unwrap();
        let strategy = SettleStrategy::PollPosition {
            tolerance_nm: 0.1,
            poll_interval_ms: 1,
            timeout_ms: 5,
        };
        assert!(matches!(
            strategy.settle(&mono, 700.0, Duration::ZERO).await,
            Err(DaqError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_never_queries_position() {
        let mono = MockMonochromator::new();
        SettleStrategy::Fixed
            .settle(&mono, 500.0, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(mono.position_queries(), 0);
    }

    #[test]
    fn test_strategy_from_toml_shape() {
        let strategy: SettleStrategy = serde_json::from_str(
            r#"{"mode":"poll_position","tolerance_nm":0.2,"poll_interval_ms":50,"timeout_ms":5000}"#,
        )
        .unwrap();
        assert_eq!(
            strategy,
            SettleStrategy::PollPosition {
                tolerance_nm: 0.2,
                poll_interval_ms: 50,
                timeout_ms: 5000
            }
        );
    }
}
