//! Piezo stage client
//!
//! ```text
//! -> open <serial_x> <serial_y> <vmax_tenths>   (or: open <vmax_tenths>)
//! -> move_ix <ix> <iy> <width> <height>
//! -> setdac <vx_code> <vy_code>
//! -> status
//! <- OK X=<0|1> Y=<0|1>
//! -> disable
//! ```

use super::{AxisStatus, Stage, StageOpen};
use crate::error::{AppResult, DaqError};
use crate::transport::{LineTransport, ResponseMetadata, DEFAULT_READ_TIMEOUT};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// [`Stage`] over a line transport.
#[derive(Debug)]
pub struct StageClient<T: LineTransport> {
    transport: T,
    command_timeout: Duration,
    opened: bool,
}

impl<T: LineTransport> StageClient<T> {
    /// Wrap a transport whose handshake already succeeded.
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, DEFAULT_READ_TIMEOUT)
    }

    /// Wrap a transport with a custom command bound.
    pub fn with_timeout(transport: T, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_timeout,
            opened: false,
        }
    }

    /// Whether `open` has succeeded on this session.
    pub fn is_open(&self) -> bool {
        self.opened
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.opened {
            Ok(())
        } else {
            Err(DaqError::NotConnected("Stage (axes not opened)"))
        }
    }

    async fn command(&mut self, line: &str) -> AppResult<String> {
        self.transport.send(line, self.command_timeout).await
    }
}

/// Format the `open` request; the serial-less form lets the helper use its own defaults.
fn open_command(params: &StageOpen) -> String {
    match (&params.serial_x, &params.serial_y) {
        (Some(x), Some(y)) => format!("open {} {} {}", x, y, params.max_voltage_tenths),
        _ => format!("open {}", params.max_voltage_tenths),
    }
}

fn parse_flag(meta: &ResponseMetadata, key: &str) -> AppResult<bool> {
    match meta.require::<u8>(key)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DaqError::Protocol(format!(
            "'{}={}' is not a connectivity flag",
            key, other
        ))),
    }
}

#[async_trait]
impl<T: LineTransport> Stage for StageClient<T> {
    async fn open(&mut self, params: &StageOpen) -> AppResult<()> {
        let command = open_command(params);
        self.command(&command).await?;
        self.opened = true;
        info!(
            "[{}] axes open (vmax {} tenths)",
            self.transport.name(),
            params.max_voltage_tenths
        );
        Ok(())
    }

    async fn move_to_index(&mut self, ix: u32, iy: u32, width: u32, height: u32) -> AppResult<()> {
        self.ensure_open()?;
        self.command(&format!("move_ix {} {} {} {}", ix, iy, width, height))
            .await?;
        debug!("[{}] at index ({}, {})", self.transport.name(), ix, iy);
        Ok(())
    }

    async fn set_dac(&mut self, vx_code: i16, vy_code: i16) -> AppResult<()> {
        self.ensure_open()?;
        self.command(&format!("setdac {} {}", vx_code, vy_code))
            .await
            .map(|_| ())
    }

    async fn status(&mut self) -> AppResult<AxisStatus> {
        let response = self.command("status").await?;
        let meta = ResponseMetadata::parse(&response);
        Ok(AxisStatus {
            axis_x_connected: parse_flag(&meta, "X")?,
            axis_y_connected: parse_flag(&meta, "Y")?,
        })
    }

    async fn disable(&mut self) {
        if let Err(e) = self.command("disable").await {
            warn!("[{}] disable failed: {}", self.transport.name(), e);
        }
        self.opened = false;
    }

    async fn close(&mut self) -> AppResult<()> {
        self.disable().await;
        self.transport.close().await
    }
}
