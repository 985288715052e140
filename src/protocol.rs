use crate::error::CliError;
use crate::format::Template;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Where a partition stream starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// The next message produced after the stream opens.
    Newest,
    /// The earliest message the broker still retains.
    Oldest,
    At(i64),
}

impl Offset {
    pub const NEWEST: i64 = -1;
    pub const OLDEST: i64 = -2;

    pub fn from_raw(value: i64) -> Result<Self, CliError> {
        match value {
            Self::NEWEST => Ok(Offset::Newest),
            Self::OLDEST => Ok(Offset::Oldest),
            n if n >= 0 => Ok(Offset::At(n)),
            n => Err(CliError::Usage(format!(
                "invalid offset {} (newest=-1, oldest=-2, or a non-negative offset)",
                n
            ))),
        }
    }
}

impl FromStr for Offset {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest" => Ok(Offset::Newest),
            "oldest" => Ok(Offset::Oldest),
            other => {
                let raw: i64 = other
                    .parse()
                    .map_err(|_| CliError::Usage(format!("invalid offset '{}'", s)))?;
                Offset::from_raw(raw)
            }
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Newest => write!(f, "newest"),
            Offset::Oldest => write!(f, "oldest"),
            Offset::At(n) => write!(f, "{}", n),
        }
    }
}

/// A single (topic, partition) pair to stream from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Assignment {
    pub topic: String,
    pub partition: i32,
}

impl Assignment {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.topic, self.partition)
    }
}

/// A message as delivered by a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Set by the producer.
    pub create_time: Option<DateTime<Utc>>,
    /// Set by the broker when the topic uses log-append timestamps.
    pub log_append_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

/// Where the cluster stored a produced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Everything `consume` needs, fixed once the command line is parsed.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub topics: Vec<String>,
    /// `None` consumes every partition of each topic.
    pub partition: Option<i32>,
    pub offset: Offset,
    pub template: Template,
}

impl ConsumeRequest {
    /// Negative partition numbers select every partition.
    pub fn partition_selector(raw: i32) -> Option<i32> {
        (raw >= 0).then_some(raw)
    }
}
