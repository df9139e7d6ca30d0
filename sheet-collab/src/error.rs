//! Error types for the synchronization core.

use uuid::Uuid;

/// Errors surfaced by the collaboration client.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("message encode failed: {0}")]
    Encode(String),

    #[error("message decode failed: {0}")]
    Decode(String),

    #[error("not connected")]
    NotConnected,

    #[error("not joined to a room")]
    NotInRoom,

    #[error("transport closed")]
    TransportClosed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("token refresh failed: {0}")]
    Auth(String),

    #[error("identity is missing a stable user id")]
    MissingIdentity,

    /// A message referenced a room other than the one currently joined.
    /// The single message is discarded; the connection stays up.
    #[error("message for room {received} while joined to {joined}")]
    RoomMismatch { joined: Uuid, received: Uuid },

    /// The document engine rejected an operation batch. Non-retryable:
    /// resubmission would fail the same way.
    #[error("document engine rejected operations: {0}")]
    Engine(String),
}
