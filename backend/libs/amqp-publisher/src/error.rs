//! Publish failure taxonomy.
//!
//! The batch processor decides whether to retry based on `kind`, never on
//! error message text; the substring heuristics below are only a fallback
//! for driver errors that carry no structure of their own.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for publisher operations.
pub type PublishResult<T> = Result<T, PublishError>;

/// Why a publish failed, as seen by the batch processor.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Broker or channel unreachable. Retriable.
    #[error("broker transport error: {0}")]
    Transport(String),

    /// Publisher confirm did not arrive in time. Retriable.
    #[error("publisher confirm timed out after {0:?}")]
    Timeout(Duration),

    /// Mandatory publish returned by the broker: no queue is bound to the
    /// routing key. The destination is wrong, retrying will not help.
    #[error("message returned by broker: {0}")]
    Returned(String),

    /// Malformed frame, authentication failure, or other protocol-level
    /// rejection. Not retriable.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl PublishError {
    /// Transport and timeout failures are worth retrying; returned and
    /// protocol failures are not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PublishError::Transport(_) | PublishError::Timeout(_))
    }

    /// Taxonomy class name, used as the `error_type` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::Transport(_) => "transport",
            PublishError::Timeout(_) => "timeout",
            PublishError::Returned(_) => "returned",
            PublishError::Protocol(_) => "protocol",
        }
    }

    /// Stable label for metrics and settle records.
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Transport(_) => "broker_transport",
            PublishError::Timeout(_) => "publish_timeout",
            PublishError::Returned(_) => "unroutable",
            PublishError::Protocol(_) => "protocol",
        }
    }
}

/// Classify a lapin error into the publish taxonomy.
///
/// Structural classification first; for opaque variants fall back to
/// transport markers in the message, treating anything clearly attributable
/// to the network path as retriable.
pub(crate) fn classify_lapin(err: &lapin::Error) -> PublishError {
    use lapin::Error as Lapin;

    match err {
        Lapin::IOError(_) => PublishError::Transport(err.to_string()),
        Lapin::ProtocolError(_) => PublishError::Protocol(err.to_string()),
        Lapin::InvalidChannelState(_) | Lapin::InvalidConnectionState(_) => {
            PublishError::Transport(err.to_string())
        }
        other => classify_message(&other.to_string()),
    }
}

/// Fallback classification over an error message.
pub(crate) fn classify_message(message: &str) -> PublishError {
    const TRANSPORT_MARKERS: [&str; 5] =
        ["connection", "timeout", "network", "broken pipe", "reset"];

    let lowered = message.to_lowercase();
    if TRANSPORT_MARKERS.iter().any(|m| lowered.contains(m)) {
        PublishError::Transport(message.to_string())
    } else {
        PublishError::Protocol(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(PublishError::Transport("down".into()).is_retriable());
        assert!(PublishError::Timeout(Duration::from_secs(5)).is_retriable());
        assert!(!PublishError::Returned("no route".into()).is_retriable());
        assert!(!PublishError::Protocol("bad frame".into()).is_retriable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(PublishError::Transport("x".into()).code(), "broker_transport");
        assert_eq!(
            PublishError::Timeout(Duration::ZERO).code(),
            "publish_timeout"
        );
        assert_eq!(PublishError::Returned("x".into()).code(), "unroutable");
        assert_eq!(PublishError::Protocol("x".into()).code(), "protocol");
    }

    #[test]
    fn message_fallback_spots_transport_markers() {
        assert!(classify_message("Connection refused").is_retriable());
        assert!(classify_message("request timeout while waiting").is_retriable());
        assert!(classify_message("Broken pipe (os error 32)").is_retriable());
        assert!(classify_message("network unreachable").is_retriable());
        assert!(!classify_message("ACCESS_REFUSED for vhost /").is_retriable());
    }
}
