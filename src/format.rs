//! Output templates for consumed records.
//!
//! A template is plain text with `{Name}` placeholders. `{{` and `}}` stand
//! for literal braces. Every render produces exactly one line.

use crate::error::CliError;
use crate::protocol::Record;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

pub const DEFAULT_TEMPLATE: &str = "{ConsumeTime} {Topic}({Partition}:{Offset}) {Value}";

pub const TEMPLATE_HELP: &str = "the format of output, supported variables:
  CreateTime, LogAppendTime, ConsumeTime, Topic, Partition, Offset, Key, Value
* CreateTime: the time when producer created the message, in RFC 3339 format.
* LogAppendTime: the time when broker handled the message.
* ConsumeTime: the time when consumer received the message.";

const MISSING_TIME: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    CreateTime,
    LogAppendTime,
    ConsumeTime,
    Topic,
    Partition,
    Offset,
    Key,
    Value,
}

impl FromStr for Field {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CreateTime" => Ok(Field::CreateTime),
            "LogAppendTime" => Ok(Field::LogAppendTime),
            "ConsumeTime" => Ok(Field::ConsumeTime),
            "Topic" => Ok(Field::Topic),
            "Partition" => Ok(Field::Partition),
            "Offset" => Ok(Field::Offset),
            "Key" => Ok(Field::Key),
            "Value" => Ok(Field::Value),
            other => Err(CliError::Template(format!("unknown variable '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, CliError> {
        let tokens = Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|[{}]")?;
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for caps in tokens.captures_iter(source) {
            let Some(token) = caps.get(0) else {
                continue;
            };
            literal.push_str(&source[last..token.start()]);
            last = token.end();

            match (token.as_str(), caps.get(1)) {
                ("{{", _) => literal.push('{'),
                ("}}", _) => literal.push('}'),
                (_, Some(name)) => {
                    let field = name.as_str().parse()?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                (brace, None) => {
                    return Err(CliError::Template(format!(
                        "unbalanced '{}' at position {}",
                        brace,
                        token.start()
                    )));
                }
            }
        }
        literal.push_str(&source[last..]);
        literal.push('\n');
        segments.push(Segment::Literal(literal));

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Writes one line for `record`. Create and log-append times are shown in
    /// the zone of `consume_time`.
    pub fn render<W, Tz>(
        &self,
        out: &mut W,
        record: &Record,
        consume_time: &DateTime<Tz>,
    ) -> io::Result<()>
    where
        W: Write + ?Sized,
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let mut line = Vec::with_capacity(64 + record.value.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => line.extend_from_slice(text.as_bytes()),
                Segment::Field(Field::Value) => line.extend_from_slice(&record.value),
                Segment::Field(Field::Key) => {
                    line.extend_from_slice(record.key.as_deref().unwrap_or_default())
                }
                Segment::Field(Field::Topic) => line.extend_from_slice(record.topic.as_bytes()),
                Segment::Field(Field::Partition) => write!(line, "{}", record.partition)?,
                Segment::Field(Field::Offset) => write!(line, "{}", record.offset)?,
                Segment::Field(Field::ConsumeTime) => {
                    line.extend_from_slice(rfc3339(consume_time).as_bytes())
                }
                Segment::Field(Field::CreateTime) => line.extend_from_slice(
                    zoned(record.create_time, &consume_time.timezone()).as_bytes(),
                ),
                Segment::Field(Field::LogAppendTime) => line.extend_from_slice(
                    zoned(record.log_append_time, &consume_time.timezone()).as_bytes(),
                ),
            }
        }
        out.write_all(&line)
    }
}

impl Default for Template {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
            segments: vec![
                Segment::Field(Field::ConsumeTime),
                Segment::Literal(" ".to_string()),
                Segment::Field(Field::Topic),
                Segment::Literal("(".to_string()),
                Segment::Field(Field::Partition),
                Segment::Literal(":".to_string()),
                Segment::Field(Field::Offset),
                Segment::Literal(") ".to_string()),
                Segment::Field(Field::Value),
                Segment::Literal("\n".to_string()),
            ],
        }
    }
}

fn rfc3339<Tz>(time: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn zoned<Tz>(time: Option<DateTime<Utc>>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    match time {
        Some(t) => rfc3339(&t.with_timezone(tz)),
        None => MISSING_TIME.to_string(),
    }
}
