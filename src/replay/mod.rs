//! Replay log: a line-oriented record of client operations
//!
//! Every operation the model runner performs is written as one line:
//!
//! ```text
//! 26/07/2010 16:28:46.972 connect [cleanSession:false]
//! 26/07/2010 16:28:46.972 subscribe [topic:5f00344b][qos:2][expectRetained:true]
//! 26/07/2010 16:28:46.972 publish [topic:5f00344b][payload:0dbc3ef9][qos:2][retained:true][subscribed:false][waitForCompletion:false]
//! 26/07/2010 16:28:46.972 pendingDeliveryTokens [count:0]
//! ```
//!
//! The leading timestamp is optional. Lines that are not events (stack traces,
//! connection-lost notes) are skipped when a log is parsed, so a log written
//! during a failing run can be replayed as is.

pub mod model;

pub use model::{ModelError, ModelReport, ModelRunner, ModelSettings};

use crate::protocol::QoS;
use chrono::{Local, NaiveDateTime};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// `dd/mm/yyyy HH:MM:SS.mmm`
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S%.3f";

const EVENT_NAMES: [&str; 6] = [
    "connect",
    "disconnect",
    "subscribe",
    "unsubscribe",
    "publish",
    "pendingDeliveryTokens",
];

/// One recorded client operation with the expectations checked on replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    Connect {
        clean_session: bool,
    },
    Disconnect {
        clean_session: bool,
        is_connected: bool,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        expect_retained: bool,
    },
    Unsubscribe {
        topic: String,
        existing: bool,
    },
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        retained: bool,
        subscribed: bool,
        wait_for_completion: bool,
    },
    PendingDeliveryTokens {
        count: usize,
    },
}

impl ReplayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ReplayEvent::Connect { .. } => "connect",
            ReplayEvent::Disconnect { .. } => "disconnect",
            ReplayEvent::Subscribe { .. } => "subscribe",
            ReplayEvent::Unsubscribe { .. } => "unsubscribe",
            ReplayEvent::Publish { .. } => "publish",
            ReplayEvent::PendingDeliveryTokens { .. } => "pendingDeliveryTokens",
        }
    }
}

impl fmt::Display for ReplayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.name())?;
        match self {
            ReplayEvent::Connect { clean_session } => write!(f, "[cleanSession:{clean_session}]"),
            ReplayEvent::Disconnect {
                clean_session,
                is_connected,
            } => write!(f, "[cleanSession:{clean_session}][isConnected:{is_connected}]"),
            ReplayEvent::Subscribe {
                topic,
                qos,
                expect_retained,
            } => write!(
                f,
                "[topic:{topic}][qos:{}][expectRetained:{expect_retained}]",
                qos.as_u8()
            ),
            ReplayEvent::Unsubscribe { topic, existing } => {
                write!(f, "[topic:{topic}][existing:{existing}]")
            }
            ReplayEvent::Publish {
                topic,
                payload,
                qos,
                retained,
                subscribed,
                wait_for_completion,
            } => write!(
                f,
                "[topic:{topic}][payload:{payload}][qos:{}][retained:{retained}][subscribed:{subscribed}][waitForCompletion:{wait_for_completion}]",
                qos.as_u8()
            ),
            ReplayEvent::PendingDeliveryTokens { count } => write!(f, "[count:{count}]"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReplayParseError {
    #[error("not a replay event: {0}")]
    NotAnEvent(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("malformed fields in '{0}'")]
    MalformedFields(String),

    #[error("{event} is missing field '{field}'")]
    MissingField { event: &'static str, field: &'static str },

    #[error("invalid value '{value}' for field '{field}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("line {line}: {source}")]
    AtLine {
        line: usize,
        #[source]
        source: Box<ReplayParseError>,
    },
}

struct Fields<'a> {
    event: &'static str,
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    fn parse(event: &'static str, text: &'a str) -> Result<Self, ReplayParseError> {
        let inner = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or_else(|| ReplayParseError::MalformedFields(text.to_string()))?;

        let pairs = inner
            .split("][")
            .map(|pair| {
                pair.split_once(':')
                    .ok_or_else(|| ReplayParseError::MalformedFields(text.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { event, pairs })
    }

    fn raw(&self, field: &'static str) -> Result<&'a str, ReplayParseError> {
        self.pairs
            .iter()
            .find(|(key, _)| *key == field)
            .map(|(_, value)| *value)
            .ok_or(ReplayParseError::MissingField {
                event: self.event,
                field,
            })
    }

    fn string(&self, field: &'static str) -> Result<String, ReplayParseError> {
        self.raw(field).map(str::to_string)
    }

    fn boolean(&self, field: &'static str) -> Result<bool, ReplayParseError> {
        let value = self.raw(field)?;
        value.parse().map_err(|_| ReplayParseError::InvalidValue {
            field,
            value: value.to_string(),
        })
    }

    fn count(&self, field: &'static str) -> Result<usize, ReplayParseError> {
        let value = self.raw(field)?;
        value.parse().map_err(|_| ReplayParseError::InvalidValue {
            field,
            value: value.to_string(),
        })
    }

    fn qos(&self, field: &'static str) -> Result<QoS, ReplayParseError> {
        let value = self.raw(field)?;
        value
            .parse::<u8>()
            .ok()
            .and_then(|n| QoS::try_from(n).ok())
            .ok_or_else(|| ReplayParseError::InvalidValue {
                field,
                value: value.to_string(),
            })
    }
}

/// Parse one line.
///
/// Returns `Ok(None)` for lines that carry no event; malformed event lines
/// are errors.
pub fn parse_line(line: &str) -> Result<Option<ReplayEvent>, ReplayParseError> {
    let line = line.trim();
    let Some(bracket) = line.find('[') else {
        return Ok(None);
    };
    let (head, fields) = line.split_at(bracket);
    let head = head.trim_end();

    let (prefix, name) = match head.rsplit_once(' ') {
        Some((prefix, name)) => (prefix.trim(), name),
        None => ("", head),
    };
    let Some(event) = EVENT_NAMES.iter().copied().find(|known| *known == name) else {
        return Ok(None);
    };
    if !prefix.is_empty() && NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT).is_err() {
        return Err(ReplayParseError::InvalidTimestamp(prefix.to_string()));
    }

    let fields = Fields::parse(event, fields)?;
    let parsed = match event {
        "connect" => ReplayEvent::Connect {
            clean_session: fields.boolean("cleanSession")?,
        },
        "disconnect" => ReplayEvent::Disconnect {
            clean_session: fields.boolean("cleanSession")?,
            is_connected: fields.boolean("isConnected")?,
        },
        "subscribe" => ReplayEvent::Subscribe {
            topic: fields.string("topic")?,
            qos: fields.qos("qos")?,
            expect_retained: fields.boolean("expectRetained")?,
        },
        "unsubscribe" => ReplayEvent::Unsubscribe {
            topic: fields.string("topic")?,
            existing: fields.boolean("existing")?,
        },
        "publish" => ReplayEvent::Publish {
            topic: fields.string("topic")?,
            payload: fields.string("payload")?,
            qos: fields.qos("qos")?,
            retained: fields.boolean("retained")?,
            subscribed: fields.boolean("subscribed")?,
            wait_for_completion: fields.boolean("waitForCompletion")?,
        },
        _ => ReplayEvent::PendingDeliveryTokens {
            count: fields.count("count")?,
        },
    };
    Ok(Some(parsed))
}

impl FromStr for ReplayEvent {
    type Err = ReplayParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_line(s)?.ok_or_else(|| ReplayParseError::NotAnEvent(s.to_string()))
    }
}

/// Parse a whole log, skipping lines that are not events
pub fn parse_log(text: &str) -> Result<Vec<ReplayEvent>, ReplayParseError> {
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {
                if !line.trim().is_empty() {
                    debug!(line = index + 1, "Skipping non-event line");
                }
            }
            Err(source) => {
                return Err(ReplayParseError::AtLine {
                    line: index + 1,
                    source: Box::new(source),
                })
            }
        }
    }
    Ok(events)
}

/// Writes timestamped events, one per line
pub struct ReplayRecorder {
    out: Box<dyn Write + Send>,
    timestamps: bool,
}

impl ReplayRecorder {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            timestamps: true,
        }
    }

    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }

    /// Omit the leading timestamp
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn record(&mut self, event: &ReplayEvent) -> io::Result<()> {
        if self.timestamps {
            writeln!(self.out, "{} {event}", Local::now().format(TIMESTAMP_FORMAT))
        } else {
            writeln!(self.out, "{event}")
        }
    }

    /// Record a free-form note; replay ignores it
    pub fn note(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{} {text}", Local::now().format(TIMESTAMP_FORMAT))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
