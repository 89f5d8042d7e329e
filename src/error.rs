//! Typed error taxonomy for the sensor-to-status pipeline.
//!
//! Sensor faults (transient/persistent) are represented as QC state on a
//! `Sample`, not as errors here — they are recovered locally, never thrown.
//! This enum covers the kinds that cross a module boundary: storage,
//! configuration, protocol, and fatal pipeline faults.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgriScanError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fatal pipeline error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, AgriScanError>;

impl AgriScanError {
    /// Maps a fault to the HTTP status the read API should report, per the
    /// propagation policy: storage faults surface to callers, protocol
    /// faults are the caller's fault, fatal faults are a hard 500.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            AgriScanError::Storage(_) | AgriScanError::StorageIo(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AgriScanError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AgriScanError::Protocol(_) => StatusCode::BAD_REQUEST,
            AgriScanError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for AgriScanError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn protocol_fault_is_400() {
        let e = AgriScanError::Protocol("bad start/end".into());
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn configuration_fault_is_500() {
        let e = AgriScanError::Configuration("missing crop table".into());
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
