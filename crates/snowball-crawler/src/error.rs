/// Conditions a caller of the crawler needs to tell apart from plain I/O
/// failures. Carried inside `anyhow::Error`, recover them with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("No usable credentials in {0}")]
    NoCredentials(String),

    #[error("Credential {credential} was rejected: {message}")]
    Unauthorized { credential: String, message: String },

    #[error("Couldn't fetch {what} after {attempts} attempts: {message}")]
    FetchFailed {
        what: String,
        attempts: u32,
        message: String,
    },
}
