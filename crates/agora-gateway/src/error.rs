use thiserror::Error;

/// Failure modes of a post-authentication gateway command. Everything here is
/// recoverable: it is serialized into a private `error` event to the
/// originating connection and the connection stays open. Authentication
/// failures are terminal and never reach this type; the socket is closed at
/// the handshake instead.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("you are not a participant of this conversation")]
    Forbidden,

    #[error("conversation not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    /// The persistence layer was unavailable. The command was rejected before
    /// anything was broadcast; the client may retry.
    #[error("temporary storage failure, please retry")]
    Store(#[source] anyhow::Error),
}

impl CommandError {
    /// Human-readable text for the private `error` event.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
