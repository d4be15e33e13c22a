use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Missing API key, base URL, or model selection. Raised synchronously
    /// before any network call and never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Non-2xx HTTP status or network failure. Retry policy, if any, belongs
    /// to the host.
    #[error("Request failed: {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    /// A normalized stream supports at most one consumption.
    #[error("stream already consumed")]
    StreamConsumed,
}
