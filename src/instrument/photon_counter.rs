//! Photon counter client
//!
//! Protocol spoken by the histogramming counter helper:
//!
//! ```text
//! -> init <binning> <offset_ps> <sync_div> <sync_offset_ps>
//! <- OK
//! -> info
//! <- OK RES=<ps> CH=<channels> LEN=<bins>
//! -> acquire <ms>
//! <- OK HIST CH=<channels> LEN=<bins> BYTES=<n>
//! <- <base64 of channels*bins little-endian u32, row-major>
//! -> reset
//! <- OK
//! ```

use super::{CounterInit, Histogram, HistogramGeometry, PhotonCounter};
use crate::error::{AppResult, DaqError};
use crate::transport::{LineTransport, ResponseMetadata, DEFAULT_READ_TIMEOUT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Default floor of the acquisition bound.
pub const DEFAULT_ACQUIRE_FLOOR: Duration = Duration::from_secs(10);
/// Default slack on top of the integration time.
pub const DEFAULT_ACQUIRE_SLACK: Duration = Duration::from_secs(5);

/// Read bounds used by [`CounterClient`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterTimeouts {
    /// Plain commands (`info`)
    pub command: Duration,
    /// Hardware initialization (`init`, `reset`)
    pub init: Duration,
    /// The base64 line following an acquisition response
    pub payload: Duration,
    /// Lower bound for an `acquire` round trip
    pub acquire_floor: Duration,
    /// Added to the integration time to bound an `acquire` round trip
    pub acquire_slack: Duration,
}

impl Default for CounterTimeouts {
    fn default() -> Self {
        Self {
            command: DEFAULT_READ_TIMEOUT,
            init: Duration::from_secs(20),
            payload: Duration::from_secs(20),
            acquire_floor: DEFAULT_ACQUIRE_FLOOR,
            acquire_slack: DEFAULT_ACQUIRE_SLACK,
        }
    }
}

impl CounterTimeouts {
    /// Bound for an `acquire` round trip: `max(floor, integration time + slack)`.
    pub fn acquisition(&self, acquisition_ms: u32) -> Duration {
        (Duration::from_millis(u64::from(acquisition_ms)) + self.acquire_slack)
            .max(self.acquire_floor)
    }
}

/// Default bound for an `acquire` round trip: `max(10 s, integration time + 5 s)`.
pub fn acquisition_timeout(acquisition_ms: u32) -> Duration {
    CounterTimeouts::default().acquisition(acquisition_ms)
}

/// Decode a histogram payload line and check it against its declared shape.
///
/// # Errors
/// `Protocol` for malformed base64; `SizeMismatch` if the element count is not
/// `channels * bins` or the byte count disagrees with `declared_bytes`.
pub fn decode_histogram(
    payload: &str,
    channels: usize,
    bins: usize,
    declared_bytes: usize,
) -> AppResult<Histogram> {
    let expected = channels
        .checked_mul(bins)
        .ok_or_else(|| DaqError::Protocol(format!("CH={} LEN={} overflows", channels, bins)))?;

    let raw = STANDARD
        .decode(payload.trim())
        .map_err(|e| DaqError::Protocol(format!("invalid base64 payload: {}", e)))?;

    if raw.len() % 4 != 0 {
        return Err(DaqError::SizeMismatch {
            unit: "bytes",
            expected: expected.saturating_mul(4),
            actual: raw.len(),
        });
    }
    let elements = raw.len() / 4;
    if elements != expected {
        return Err(DaqError::SizeMismatch {
            unit: "elements",
            expected,
            actual: elements,
        });
    }
    if raw.len() != declared_bytes {
        return Err(DaqError::SizeMismatch {
            unit: "bytes",
            expected: declared_bytes,
            actual: raw.len(),
        });
    }

    let values: Vec<u32> = raw
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let counts = Array2::from_shape_vec((channels, bins), values)
        .map_err(|e| DaqError::Protocol(e.to_string()))?;
    Ok(Histogram::new(counts))
}

/// Encode counts the way the helper does (row-major little-endian u32, base64).
pub fn encode_histogram(counts: &Array2<u32>) -> String {
    let bytes: Vec<u8> = counts.iter().flat_map(|c| c.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

/// [`PhotonCounter`] over a line transport.
#[derive(Debug)]
pub struct CounterClient<T: LineTransport> {
    transport: T,
    timeouts: CounterTimeouts,
    initialized: bool,
    geometry: Option<HistogramGeometry>,
}

impl<T: LineTransport> CounterClient<T> {
    /// Wrap a transport whose handshake already succeeded.
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, CounterTimeouts::default())
    }

    /// Wrap a transport with custom read bounds.
    pub fn with_timeouts(transport: T, timeouts: CounterTimeouts) -> Self {
        Self {
            transport,
            timeouts,
            initialized: false,
            geometry: None,
        }
    }

    /// Geometry from the last successful `describe`.
    pub fn geometry(&self) -> Option<HistogramGeometry> {
        self.geometry
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DaqError::NotConnected("Photon counter (not initialized)"))
        }
    }
}

#[async_trait]
impl<T: LineTransport> PhotonCounter for CounterClient<T> {
    async fn initialize(&mut self, init: &CounterInit) -> AppResult<()> {
        let command = format!(
            "init {} {} {} {}",
            init.binning, init.offset_ps, init.sync_div, init.sync_offset_ps
        );
        self.transport.send(&command, self.timeouts.init).await?;
        self.initialized = true;
        self.geometry = None;
        info!("[{}] initialized: {:?}", self.transport.name(), init);
        Ok(())
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.transport.send("reset", self.timeouts.init).await?;
        self.initialized = true;
        self.geometry = None;
        info!("[{}] reset to defaults", self.transport.name());
        Ok(())
    }

    async fn describe(&mut self) -> AppResult<HistogramGeometry> {
        self.ensure_initialized()?;
        let response = self.transport.send("info", self.timeouts.command).await?;
        let meta = ResponseMetadata::parse(&response);
        let geometry = HistogramGeometry {
            resolution_ps: meta.require("RES")?,
            channels: meta.require("CH")?,
            bins: meta.require("LEN")?,
        };
        self.geometry = Some(geometry);
        Ok(geometry)
    }

    async fn acquire(&mut self, acquisition_ms: u32) -> AppResult<Histogram> {
        self.ensure_initialized()?;
        let response = self
            .transport
            .send(
                &format!("acquire {}", acquisition_ms),
                self.timeouts.acquisition(acquisition_ms),
            )
            .await?;

        let meta = ResponseMetadata::parse(&response);
        let channels: usize = meta.require("CH")?;
        let bins: usize = meta.require("LEN")?;
        let bytes: usize = meta.require("BYTES")?;

        // Exactly one payload line follows the metadata line.
        let payload = self.transport.read_extra_line(self.timeouts.payload).await?;
        let histogram = decode_histogram(&payload, channels, bins, bytes)?;
        debug!(
            "[{}] acquired {}x{} histogram in {} ms",
            self.transport.name(),
            channels,
            bins,
            acquisition_ms
        );
        Ok(histogram)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.initialized = false;
        self.transport.close().await
    }
}
