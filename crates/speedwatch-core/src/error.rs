use thiserror::Error;

pub const FIREWALL_HINT: &str =
    "allow outbound TCP from the speedtest binary through the local firewall and retry";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeasurementError {
    #[error("speed tests may only run during the scheduled windows: {windows}")]
    OutsideWindow { windows: String },
    #[error("could not detect the current internet provider; check the connection manually")]
    DetectionFailed,
    #[error("provider mismatch: selected {claimed} but the connection belongs to {detected}")]
    IdentityMismatch { claimed: String, detected: String },
    #[error("network unavailable: {detail}")]
    NetworkUnavailable { detail: String },
    #[error("socket error: {detail} ({hint})")]
    SocketError { detail: String, hint: String },
    #[error("speed test failed: {detail}")]
    UnknownToolError { detail: String },
    #[error("transient speed test warning: {detail}")]
    ProtocolNoise { detail: String },
    #[error("speed test timed out after {secs} seconds")]
    Timeout { secs: u64 },
    #[error("failed to parse results: {detail}")]
    ParseFailure { detail: String },
    #[error("result already recorded for this measurement")]
    DuplicateCompletion,
    #[error("could not start the speed test tool: {detail}")]
    Spawn { detail: String },
}

impl MeasurementError {
    pub fn socket(detail: impl Into<String>) -> Self {
        Self::SocketError {
            detail: detail.into(),
            hint: FIREWALL_HINT.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MeasurementError::OutsideWindow { .. } => "outside_window",
            MeasurementError::DetectionFailed => "detection_failed",
            MeasurementError::IdentityMismatch { .. } => "identity_mismatch",
            MeasurementError::NetworkUnavailable { .. } => "network_unavailable",
            MeasurementError::SocketError { .. } => "socket_error",
            MeasurementError::UnknownToolError { .. } => "unknown_tool_error",
            MeasurementError::ProtocolNoise { .. } => "protocol_noise",
            MeasurementError::Timeout { .. } => "timeout",
            MeasurementError::ParseFailure { .. } => "parse_failure",
            MeasurementError::DuplicateCompletion => "duplicate_completion",
            MeasurementError::Spawn { .. } => "spawn_failed",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            MeasurementError::UnknownToolError { .. } | MeasurementError::Timeout { .. }
        )
    }

    /// Kinds that are logged but never reported to the observer.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            MeasurementError::ProtocolNoise { .. } | MeasurementError::DuplicateCompletion
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_names_both_identities() {
        let err = MeasurementError::IdentityMismatch {
            claimed: "Globe".to_string(),
            detected: "PLDT".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("Globe"));
        assert!(message.contains("PLDT"));
        assert!(!err.retryable());
        assert!(!err.is_silent());
    }

    #[test]
    fn timeout_message_is_user_visible_and_retryable() {
        let err = MeasurementError::Timeout { secs: 300 };
        assert!(err.to_string().contains("timed out"));
        assert!(err.retryable());
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn socket_error_carries_hint() {
        let err = MeasurementError::socket("Cannot open socket");
        assert!(err.to_string().contains("firewall"));
        assert!(!err.is_silent());
        assert!(MeasurementError::DuplicateCompletion.is_silent());
    }
}
