use thiserror::Error;

/// Domain failures for the buffer, assembler and clip protocol.
///
/// None of these are fatal to the process: they are either transient and
/// retryable, or they point at a caller bug that should be surfaced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClipError {
    /// Producer bug: the frame is not strictly newer than the newest buffered frame.
    #[error("out of order frame: timestamp {timestamp:.6} is not after {newest:.6}")]
    OutOfOrderFrame { timestamp: f64, newest: f64 },

    /// Transient: nothing buffered in the requested span yet.
    #[error("no frames available")]
    NoFramesAvailable,

    /// Assembler was handed an empty frame sequence.
    #[error("empty range")]
    EmptyRange,

    #[error("clip encoding failed: {0}")]
    Encode(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server unreachable after the configured number of attempts.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request reached the server but its reply did not come back. The
    /// server may already have advanced its cursor past the lost span.
    #[error("reply lost: {0}")]
    ReplyLost(String),

    #[error("cancelled")]
    Cancelled,
}

impl ClipError {
    /// Failures the consumer should simply retry without advancing any state.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClipError::NoFramesAvailable | ClipError::EmptyRange)
    }

    /// Map a wire error string back onto the taxonomy.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "no frames available" => ClipError::NoFramesAvailable,
            "empty range" => ClipError::EmptyRange,
            other => ClipError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_reason_round_trips_for_transient_errors() {
        let reason = ClipError::NoFramesAvailable.to_string();
        assert_eq!(ClipError::from_wire(&reason), ClipError::NoFramesAvailable);
        assert!(ClipError::from_wire(&reason).is_transient());
    }

    #[test]
    fn unknown_reason_is_protocol_error() {
        let err = ClipError::from_wire("disk on fire");
        assert_eq!(err, ClipError::Protocol("disk on fire".to_string()));
        assert!(!err.is_transient());
    }
}
