use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Why a broker refused a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BadCredentials,
    Unreachable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BadCredentials => write!(f, "bad username or password"),
            RejectReason::Unreachable => write!(f, "broker unreachable"),
        }
    }
}

/// Buckets a transport failure reason. Credential failures carry the
/// conventional "bad username or password" wording; everything else is
/// treated as the broker being unreachable.
pub fn classify_rejection(reason: &str) -> RejectReason {
    if reason
        .to_ascii_lowercase()
        .contains("bad username or password")
    {
        RejectReason::BadCredentials
    } else {
        RejectReason::Unreachable
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid broker configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("a connection is already open or being opened")]
    AlreadyConnected,

    #[error("connection attempt timed out")]
    Timeout,

    #[error("broker rejected the connection: {0}")]
    BrokerRejected(RejectReason),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to a broker")]
    NotConnected,

    #[error("publish topic must not be empty")]
    EmptyTopic,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("not connected to a broker")]
    NotConnected,

    #[error("already subscribed to this topic")]
    AlreadySubscribed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum UnsubscribeError {
    #[error("not connected to a broker")]
    NotConnected,

    #[error("not subscribed to this topic")]
    NotSubscribed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_signature_is_recognized() {
        assert_eq!(
            classify_rejection("Bad username or password"),
            RejectReason::BadCredentials
        );
        assert_eq!(
            classify_rejection("connack error: bad username or password"),
            RejectReason::BadCredentials
        );
    }

    #[test]
    fn everything_else_is_unreachable() {
        assert_eq!(
            classify_rejection("Connection refused: ServiceUnavailable"),
            RejectReason::Unreachable
        );
        assert_eq!(classify_rejection("I/O: timed out"), RejectReason::Unreachable);
        assert_eq!(classify_rejection(""), RejectReason::Unreachable);
    }
}
