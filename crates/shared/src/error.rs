use thiserror::Error;

/// Failure to translate between wire frames and typed events.
///
/// Decode failures are expected in the field (a newer server may emit
/// events this client does not know); callers log and drop the frame
/// rather than tearing the connection down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode channel frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode channel event: {0}")]
    Encode(#[source] serde_json::Error),
}
