use std::fmt;

use thiserror::Error;

/// Why a transport session ended. Every variant is reported through the
/// event channel; none of them are raised to the caller of `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    LocalIntent,
    HeartbeatTimeout,
    TransportClosed(String),
    TransportError(String),
    ReconnectExhausted { attempts: u32 },
}

impl DisconnectReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, DisconnectReason::LocalIntent)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalIntent => f.write_str("closed locally"),
            DisconnectReason::HeartbeatTimeout => f.write_str("heartbeat acknowledgment timed out"),
            DisconnectReason::TransportClosed(reason) => write!(f, "transport closed: {reason}"),
            DisconnectReason::TransportError(reason) => write!(f, "transport error: {reason}"),
            DisconnectReason::ReconnectExhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("conversation id is required")]
    MissingConversationId,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("no pending message with temp id {0}")]
    UnknownPendingMessage(String),
    #[error("realtime connection is not running")]
    NotConnected,
    #[error("sync session has not been started")]
    SessionNotStarted,
    #[error("api request failed: {0}")]
    Api(#[source] anyhow::Error),
}
