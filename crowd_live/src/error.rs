// THEORY:
// Every failure the live pipeline can hit is one of a handful of kinds, and
// the kind alone decides what happens next. A malformed message is absorbed
// where it is found; everything else tears the whole session down and leaves a
// single readable message behind for the operator. Keeping that decision in
// `is_fatal` means the session driver never has to inspect error strings.

use crate::session::SessionState;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// The capture device could not be acquired (permission denied, busy, missing).
    #[error("Could not access the video source: {0}")]
    SourceUnavailable(String),

    /// The analyzer handshake never completed.
    #[error("Connection to the analysis server failed: {0}")]
    ConnectFailed(String),

    /// A message arrived but did not match any known analytics shape.
    #[error("Malformed analyzer message: {0}")]
    ProtocolError(String),

    /// The analyzer ended the connection.
    #[error("The analysis server closed the connection: {0}")]
    RemoteClosed(String),

    /// The analyzer reported a failure on its side.
    #[error("The analysis server reported an error: {0}")]
    PayloadError(String),

    #[error("cannot {action} while the session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    /// A captured frame could not be encoded. The sample is skipped.
    #[error("Frame encoding failed: {0}")]
    Encode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LiveError {
    /// Fatal errors force the full stop sequence and end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::SourceUnavailable(_)
                | LiveError::ConnectFailed(_)
                | LiveError::RemoteClosed(_)
                | LiveError::PayloadError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_and_encode_errors_are_absorbed() {
        assert!(!LiveError::ProtocolError("bad".into()).is_fatal());
        assert!(!LiveError::Encode("bad".into()).is_fatal());
        assert!(LiveError::RemoteClosed("bye".into()).is_fatal());
        assert!(LiveError::PayloadError("boom".into()).is_fatal());
        assert!(LiveError::ConnectFailed("refused".into()).is_fatal());
        assert!(LiveError::SourceUnavailable("busy".into()).is_fatal());
    }

    #[test]
    fn transition_errors_name_the_state() {
        let err = LiveError::InvalidTransition {
            action: "start",
            state: SessionState::Live,
        };
        assert_eq!(err.to_string(), "cannot start while the session is live");
    }
}
