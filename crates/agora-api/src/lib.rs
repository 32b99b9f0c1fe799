pub mod auth;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod notifications;
pub mod unread;

use error::ApiError;

/// Run a blocking store call off the async runtime.
pub(crate) async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, ApiError> {
    let out = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?;
    out.map_err(ApiError::from)
}
