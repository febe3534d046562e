use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Another conversation is in progress")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(String),

}

impl Error {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map a non-2xx status and its decoded error text onto a variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Error::Auth(message),
            429 => Error::RateLimit(message),
            400 => Error::InvalidRequest(message),
            _ => Error::api(status, message),
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Text suitable for the host's message surface.
    ///
    /// Protocol errors show only the decoded server text; everything else
    /// gets a short generic prefix.
    pub fn host_message(&self) -> String {
        match self {
            Error::Api { message, .. }
            | Error::Auth(message)
            | Error::RateLimit(message)
            | Error::InvalidRequest(message) => message.clone(),
            Error::Serialization(_) => "Failed to parse the response stream".to_string(),
            Error::Network(message) => format!("Connection failed: {}", message),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::api(500, "server exploded");
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("server exploded"));
    }

    #[test]
    fn test_from_status() {
        assert!(Error::from_status(401, "invalid_api_key").is_auth_error());
        assert!(matches!(Error::from_status(429, "slow down"), Error::RateLimit(_)));
        assert!(matches!(Error::from_status(400, "bad"), Error::InvalidRequest(_)));
        assert!(matches!(Error::from_status(503, "down"), Error::Api { status: 503, .. }));
    }

    #[test]
    fn test_host_message_keeps_server_code() {
        let err = Error::from_status(401, "invalid_api_key");
        assert_eq!(err.host_message(), "invalid_api_key");

        let err: Error = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.host_message(), "Failed to parse the response stream");
    }
}
