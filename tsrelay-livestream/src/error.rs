use thiserror::Error;

/// Errors raised by the relay engine.
///
/// Grouped the way callers react to them: configuration problems are reported
/// and never retried, upstream problems are retried and escalated by the
/// stream manager, coordination problems fail closed, client problems stay
/// isolated to the client that caused them.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No stream assigned to channel {0}")]
    NoStream(String),

    #[error("No usable delivery profile: {0}")]
    NoProfile(String),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Upstream stalled: {0}")]
    UpstreamStalled(String),

    #[error("Upstream sources exhausted for channel {0}")]
    Exhausted(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Channel {0} is being stopped")]
    ChannelStopping(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Store(err.to_string())
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::UpstreamConnect(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamConnect(err.to_string())
    }
}

impl RelayError {
    /// True for failures of the shared store, as opposed to upstream or caller errors.
    #[must_use]
    pub const fn is_coordination(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_io_error_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RelayError = redis::RedisError::from(io).into();
        assert!(matches!(err, RelayError::Unavailable(_)));
        assert!(err.is_coordination());
    }

    #[test]
    fn test_display() {
        let err = RelayError::ChannelNotFound("c1".to_string());
        assert_eq!(err.to_string(), "Channel not found: c1");
        assert!(!err.is_coordination());
    }
}
