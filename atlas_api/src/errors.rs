//! Error types for the Atlas client.

/// Errors that can occur when talking to the Atlas API.
#[derive(thiserror::Error, Debug)]
pub enum AtlasError {
    /// The configured base URL could not be parsed.
    #[error("invalid Atlas base URL: {0}")]
    BaseUrl(#[from] url::ParseError),
    /// A rate-limit header was present but not numeric.
    #[error("rate limit header {name} is not numeric: {value:?}")]
    MalformedRateLimitHeader { name: &'static str, value: String },
    /// The HTTP transport failed (connect, DNS, read).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}
