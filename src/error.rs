// Error taxonomy for the Infinichat client engine

use thiserror::Error;

/// Errors surfaced by the client library.
///
/// Faults local to a single inbound packet are logged and absorbed rather
/// than returned; these variants cover transport-wide failures and caller
/// contract violations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to a server")]
    NotConnected,

    #[error("operation requires a logged-in session")]
    NotLoggedIn,

    #[error("the transport closed before the request resolved")]
    TransportClosed,

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("the conversation has ended")]
    ConversationEnded,

    #[error("malformed packet: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode packet: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
