use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    #[error("Collector run was cancelled")]
    Cancelled,

    #[error("Unknown collector fault: {reason}")]
    Unknown { reason: String },

    #[error("No consumer client bound to the collector")]
    NoClient,

    #[error("Poll timeout must be greater than zero")]
    InvalidPollTimeout,
}

/// Faults reported by a [`crate::client::ConsumerClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The pending poll was interrupted by `wakeup`.
    #[error("Consumer was woken up")]
    Wakeup,

    #[error("Broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    #[error("Consumer has already been closed")]
    Closed,

    #[error("Consumer is not subscribed to any topic")]
    NotSubscribed,

    #[error("Failed to decode record: {0}")]
    Codec(#[from] CodecError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("{reason}")]
    Other { reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload is not valid UTF-8: {reason}")]
    Utf8 { reason: String },

    #[error("Expected {expected} bytes for {type_name}, got {actual}")]
    Size {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("JSON decoding failed: {reason}")]
    Json { reason: String },
}

pub type Result<T> = std::result::Result<T, CollectorError>;

impl From<ClientError> for CollectorError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Wakeup => CollectorError::Cancelled,
            ClientError::BrokerUnavailable { reason } => {
                CollectorError::BrokerUnavailable { reason }
            }
            other => CollectorError::Unknown {
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
        }
    }
}

impl CollectorError {
    /// Whether the caller may simply invoke `run` again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectorError::BrokerUnavailable { .. })
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            CollectorError::BrokerUnavailable { .. } => 5000,
            _ => 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_mapping() {
        assert!(matches!(
            CollectorError::from(ClientError::Wakeup),
            CollectorError::Cancelled
        ));

        let err = CollectorError::from(ClientError::BrokerUnavailable {
            reason: "no resolvable bootstrap urls".to_string(),
        });
        assert!(matches!(err, CollectorError::BrokerUnavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.get_retry_delay_ms(), 5000);

        let err = CollectorError::from(ClientError::Closed);
        match err {
            CollectorError::Unknown { reason } => assert!(reason.contains("closed")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_codec_error_is_unknown() {
        let err = CollectorError::from(ClientError::Codec(CodecError::Size {
            type_name: "i32",
            expected: 4,
            actual: 2,
        }));
        assert!(!err.is_retryable());
        assert!(!CollectorError::NoClient.is_retryable());
        assert!(err.to_string().contains("Expected 4 bytes for i32, got 2"));
    }
}
