use rdkafka::error::KafkaError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("topic is required")]
    MissingTopic,
    #[error("{0}")]
    Usage(String),
    #[error("failed to connect to brokers {brokers}: {source}")]
    Connection {
        brokers: String,
        #[source]
        source: KafkaError,
    },
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("failed to open {topic}({partition}): {reason}")]
    PartitionOpen {
        topic: String,
        partition: i32,
        reason: String,
    },
    #[error("{topic}({partition}): {reason}")]
    Stream {
        topic: String,
        partition: i32,
        reason: String,
    },
    #[error("consumer error: {0}")]
    Consumer(String),
    #[error("invalid format template: {0}")]
    Template(String),
    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send to {topic}: {source}")]
    Send {
        topic: String,
        #[source]
        source: KafkaError,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Kafka(#[from] KafkaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CliError {
    /// Failures the command has already explained on its own output.
    pub fn already_reported(&self) -> bool {
        matches!(self, CliError::MissingTopic)
    }
}

impl From<regex::Error> for CliError {
    fn from(e: regex::Error) -> Self {
        CliError::Template(format!("regex error: {}", e))
    }
}
