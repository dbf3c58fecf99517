//! Intensity detector client
//!
//! A single-value detector (lock-in amplifier or photodiode readout) used by
//! wavelength sweeps.
//!
//! ```text
//! -> record
//! <- OK VALUE=<float>
//! ```

use super::IntensityDetector;
use crate::error::{AppResult, DaqError};
use crate::transport::{LineTransport, ResponseMetadata, DEFAULT_READ_TIMEOUT};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// [`IntensityDetector`] over a line transport.
#[derive(Debug)]
pub struct DetectorClient<T: LineTransport> {
    transport: T,
    command_timeout: Duration,
}

impl<T: LineTransport> DetectorClient<T> {
    /// Wrap a transport whose handshake already succeeded.
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, DEFAULT_READ_TIMEOUT)
    }

    /// Wrap a transport with a custom command bound.
    pub fn with_timeout(transport: T, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_timeout,
        }
    }
}

#[async_trait]
impl<T: LineTransport> IntensityDetector for DetectorClient<T> {
    async fn record(&mut self) -> AppResult<f64> {
        let response = self.transport.send("record", self.command_timeout).await?;
        let value: f64 = ResponseMetadata::parse(&response).require("VALUE")?;
        if !value.is_finite() {
            return Err(DaqError::Protocol(format!(
                "detector reported non-finite intensity {}",
                value
            )));
        }
        debug!("[{}] intensity {}", self.transport.name(), value);
        Ok(value)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockReply, MockTransport};

    #[tokio::test]
    async fn test_record_parses_value() {
        let transport = MockTransport::new("detector").reply("OK VALUE=0.125");
        let log = transport.log();
        let mut detector = DetectorClient::new(transport);
        let value = detector.record().await.unwrap();
        assert!((value - 0.125).abs() < f64::EPSILON);
        assert_eq!(log.sent(), vec!["record"]);
    }

    #[tokio::test]
    async fn test_missing_value_is_protocol_error() {
        let transport = MockTransport::new("detector").reply("OK");
        let mut detector = DetectorClient::new(transport);
        assert!(matches!(
            detector.record().await,
            Err(DaqError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_nan_is_refused() {
        let transport = MockTransport::new("detector").reply("OK VALUE=NaN");
        let mut detector = DetectorClient::new(transport);
        assert!(matches!(
            detector.record().await,
            Err(DaqError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_rejection_and_hangup_propagate() {
        let transport = MockTransport::new("detector")
            .reply("ERR overload")
            .then(MockReply::Hangup);
        let mut detector = DetectorClient::with_timeout(transport, Duration::from_millis(50));
        assert!(matches!(
            detector.record().await,
            Err(DaqError::Rejected(ref line)) if line == "ERR overload"
        ));
        assert!(detector.record().await.unwrap_err().is_session_dead());
    }
}
