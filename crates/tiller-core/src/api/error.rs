use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Rate limited by {provider}: {details}")]
    RateLimited {
        provider: String,
        details: String,
        retry_after: Option<Duration>,
    },

    #[error("Request timed out for {provider}")]
    Timeout { provider: String },

    #[error("{provider} server error: {details}")]
    ServerError { provider: String, details: String },

    #[error("Stream error from {provider}: {details}")]
    StreamError { provider: String, details: String },

    #[error("Invalid request to {provider}: {details}")]
    InvalidRequest { provider: String, details: String },

    #[error("Authentication failed for {provider}: {details}")]
    AuthenticationFailed { provider: String, details: String },

    #[error("Request cancelled for {provider}")]
    Cancelled { provider: String },
}

impl ProviderError {
    /// Failures worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::ServerError { .. }
                | Self::StreamError { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::RateLimited { provider, .. }
            | Self::Timeout { provider }
            | Self::ServerError { provider, .. }
            | Self::StreamError { provider, .. }
            | Self::InvalidRequest { provider, .. }
            | Self::AuthenticationFailed { provider, .. }
            | Self::Cancelled { provider } => provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn provider() -> String {
        "scripted".to_string()
    }

    #[rstest]
    #[case::rate_limited(
        ProviderError::RateLimited { provider: provider(), details: "slow down".into(), retry_after: None },
        true
    )]
    #[case::timeout(ProviderError::Timeout { provider: provider() }, true)]
    #[case::server(ProviderError::ServerError { provider: provider(), details: "503".into() }, true)]
    #[case::stream(ProviderError::StreamError { provider: provider(), details: "reset".into() }, true)]
    #[case::invalid(ProviderError::InvalidRequest { provider: provider(), details: "bad".into() }, false)]
    #[case::auth(ProviderError::AuthenticationFailed { provider: provider(), details: "401".into() }, false)]
    #[case::cancelled(ProviderError::Cancelled { provider: provider() }, false)]
    fn classifies_transient_failures(#[case] error: ProviderError, #[case] transient: bool) {
        assert_eq!(error.is_transient(), transient);
        assert_eq!(error.provider(), "scripted");
    }
}
