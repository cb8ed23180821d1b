//! Error types for the stream relay gateway

use serde::Serialize;

/// Errors that can occur while resolving a relay session
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Upstream metadata could not be fetched or parsed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered but offered nothing we are willing to relay
    #[error("No usable source for '{0}'")]
    NoUsableSource(String),

    /// The relay process could not be started
    #[error("Failed to launch relay process: {0}")]
    ProcessLaunch(String),

    /// Every port in the configured range is in use
    #[error("Relay ports exhausted ({start_port}+1..={last_port})")]
    PortsExhausted { start_port: u16, last_port: u16 },

    #[error("Identifier must not be empty")]
    InvalidIdentifier,
}

impl RelayError {
    /// Machine-readable kind, reported to clients next to the port
    pub fn kind(&self) -> RelayErrorKind {
        match self {
            RelayError::UpstreamUnavailable(_) => RelayErrorKind::UpstreamUnavailable,
            RelayError::NoUsableSource(_) => RelayErrorKind::NoUsableSource,
            RelayError::ProcessLaunch(_) => RelayErrorKind::ProcessLaunchFailure,
            RelayError::PortsExhausted { .. } => RelayErrorKind::PortsExhausted,
            RelayError::InvalidIdentifier => RelayErrorKind::InvalidIdentifier,
        }
    }
}

/// Kind of a [`RelayError`], serialized in snake_case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorKind {
    UpstreamUnavailable,
    NoUsableSource,
    ProcessLaunchFailure,
    PortsExhausted,
    InvalidIdentifier,
}

impl std::fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayErrorKind::UpstreamUnavailable => write!(f, "upstream_unavailable"),
            RelayErrorKind::NoUsableSource => write!(f, "no_usable_source"),
            RelayErrorKind::ProcessLaunchFailure => write!(f, "process_launch_failure"),
            RelayErrorKind::PortsExhausted => write!(f, "ports_exhausted"),
            RelayErrorKind::InvalidIdentifier => write!(f, "invalid_identifier"),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let kind = RelayError::PortsExhausted {
            start_port: 6000,
            last_port: 7000,
        }
        .kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"ports_exhausted\"");
        assert_eq!(kind.to_string(), "ports_exhausted");
    }

    #[test]
    fn test_launch_failure_kind() {
        let err = RelayError::ProcessLaunch("bash: not found".to_string());
        assert_eq!(err.kind(), RelayErrorKind::ProcessLaunchFailure);
        assert!(err.to_string().contains("bash: not found"));
    }
}
