use std::fmt::Display;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Producer-supplied job data: a JSON object.
pub type Payload = Map<String, Value>;

/// Timestamp layout of the envelope's `create_at` field.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Broker-assigned job identifier, unique while the job exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Broker priority; lower values are served first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub u32);

impl JobPriority {
    /// Priority used for enqueues and releases unless configured otherwise.
    pub const DEFAULT: JobPriority = JobPriority(1024);
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-owned lifecycle state of a job. Observed, never set directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Ready,
    Reserved,
    Buried,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Ready => "ready",
            JobState::Reserved => "reserved",
            JobState::Buried => "buried",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as handed out by `reserve` or `peek`: the id and its opaque body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub body: Vec<u8>,
}

impl Job {
    pub fn new(id: JobId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    /// Decode the body as a job envelope.
    pub fn envelope(&self) -> Result<Envelope, serde_json::Error> {
        Envelope::decode(&self.body)
    }
}

/// Options accepted by `Producer::push`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PushOptions {
    /// Seconds before the job becomes ready; 0 means immediately.
    pub delay_secs: u32,
    pub priority: JobPriority,
    /// Seconds a consumer may hold the job before the broker releases it.
    pub ttr_secs: u32,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            delay_secs: 0,
            priority: JobPriority::DEFAULT,
            ttr_secs: 60,
        }
    }
}

impl PushOptions {
    pub fn with_delay(mut self, secs: u32) -> Self {
        self.delay_secs = secs;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttr(mut self, secs: u32) -> Self {
        self.ttr_secs = secs;
        self
    }
}

/// Wire envelope carried in every job body:
/// `{ "tag": string, "data": object, "create_at": "YYYY-MM-DD HH:MM:SS" }`.
///
/// Every field is optional on the decoding side so that malformed messages
/// can still be classified (and discarded) by the dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_at: Option<String>,
}

impl Envelope {
    /// Wrap a payload for `tag`, stamped with the current local time.
    pub fn new(tag: impl Into<String>, payload: Payload) -> Self {
        Self::stamped(tag, payload, Local::now().naive_local())
    }

    pub fn stamped(
        tag: impl Into<String>,
        payload: Payload,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            tag: Some(tag.into()),
            data: Value::Object(payload),
            create_at: Some(created_at.format(CREATED_AT_FORMAT).to_string()),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The payload object, if `data` holds one.
    pub fn payload(&self) -> Option<&Payload> {
        self.data.as_object()
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.create_at
            .as_deref()
            .and_then(|raw| NaiveDateTime::parse_from_str(raw, CREATED_AT_FORMAT).ok())
    }
}
