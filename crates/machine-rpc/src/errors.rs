//! Errors raised while talking to a driver plugin

use std::time::Duration;

/// Everything that can go wrong on either end of a plugin channel.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// Reading or writing the underlying pipe failed
    #[error("plugin channel I/O: {0}")]
    Io(#[from] std::io::Error),
    /// A frame was not valid JSON, or did not match the expected shape
    #[error("malformed plugin frame: {0}")]
    Json(#[from] serde_json::Error),
    /// A peer announced a frame larger than we are willing to buffer
    #[error("plugin frame of {0} bytes exceeds the {max} byte limit", max = crate::codec::MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    /// The peer closed the channel
    #[error("plugin channel closed")]
    Closed,
    /// The driver returned an error for the call
    #[error("{0}")]
    Remote(String),
    /// A call did not complete within its deadline
    #[error("plugin call {method} timed out after {timeout:?}")]
    Timeout {
        /// The method that timed out
        method: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },
    /// The parent stopped sending heartbeats
    #[error("no heartbeat received for {0:?}")]
    HeartbeatTimeout(Duration),
    /// A reply arrived with an id that matches no outstanding call
    #[error("unexpected reply id {got} (expected {want})")]
    UnexpectedReply {
        /// The id that was received
        got: u64,
        /// The id of the pending call
        want: u64,
    },
}

impl RpcError {
    /// True when the error came from the driver rather than the transport.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_errors_render_verbatim() {
        let err = RpcError::Remote("machine does not exist".to_owned());
        assert_eq!(err.to_string(), "machine does not exist");
        assert!(err.is_remote());
        assert!(!RpcError::Closed.is_remote());
    }
}
