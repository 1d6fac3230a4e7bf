use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    /// Malformed, tampered and expired tokens all land here.
    #[error("credential invalid")]
    Invalid,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message needs content or an attachment")]
    EmptyMessage,
    #[error("participant does not exist")]
    MissingParticipant,
    #[error("cannot open a conversation with yourself")]
    SelfConversation,
    #[error("emoji must not be empty")]
    EmptyEmoji,
    #[error("message does not belong to this conversation")]
    ForeignMessage,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("not a member of this conversation")]
    Forbidden,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Run blocking store work off the async runtime.
pub async fn run_blocking<F, T>(f: F) -> ChatResult<T>
where
    F: FnOnce() -> ChatResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Persistence(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
}
