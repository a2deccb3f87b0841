// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Closed error taxonomy for the INC runtime's connection/protocol layers.
// Generalizes the teacher's io::Result-at-the-syscall-boundary style (see
// shm.rs, platform/*.rs) into a single enum once callers need to dispatch
// on error kind rather than just propagate.

/// Errors surfaced by the INC runtime's public API.
#[derive(Debug, thiserror::Error)]
pub enum IncError {
    #[error("invalid state for requested operation")]
    InvalidState,
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),
    #[error("disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("message too large: {len} bytes exceeds {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("outbound queue full")]
    QueueFull,
    #[error("write failed")]
    WriteFailed(#[source] std::io::Error),
    #[error("operation timed out")]
    Timeout,
}

impl From<std::io::Error> for IncError {
    fn from(e: std::io::Error) -> Self {
        IncError::ConnectionFailed(e)
    }
}

pub type Result<T> = std::result::Result<T, IncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_too_large_renders_both_lengths() {
        let e = IncError::MessageTooLarge { len: 100, max: 64 };
        assert_eq!(e.to_string(), "message too large: 100 bytes exceeds 64");
    }

    #[test]
    fn io_error_converts_to_connection_failed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: IncError = io_err.into();
        assert!(matches!(err, IncError::ConnectionFailed(_)));
    }
}
