use thiserror::Error;

/// Failures of the `send_message` entry point. An attachment upload
/// failure aborts the send before any optimistic insert happens, so no
/// partial message is ever created.
#[derive(Debug, Error)]
pub enum SendMessageError {
    #[error("not logged in: no active session")]
    NotLoggedIn,
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("attachment upload failed: {0}")]
    MediaUpload(#[source] anyhow::Error),
    /// The optimistic insert already happened when the emit failed; the
    /// message stays in `Sending` like any send that never gets acked.
    #[error("event channel emit failed: {0}")]
    Channel(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("invalid channel endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("channel is closed")]
    Closed,
}
