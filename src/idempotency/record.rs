use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordState {
    Running,
    Done,
}

/// Ordered multimap of response headers. Insertion order and duplicate names are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseHeaders(Vec<(String, String)>);

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.append(name, value);
        self
    }

    /// Values for `name`, compared case-insensitively, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value for `name`. The result borrows only from `self`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies every valid header out of an `http::HeaderMap`, keeping repeated values.
    pub fn from_header_map(map: &http::HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map.iter() {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        headers
    }
}

/// Response captured on first presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    #[serde(with = "body_hex", default)]
    pub body: Option<Vec<u8>>,
    pub content_descriptor: String,
    pub headers: ResponseHeaders,
    pub status: u16,
}

/// Failure registered on first presentation and re-raised on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFailure {
    pub error_descriptor: String,
    pub message: String,
}

impl StoredFailure {
    pub fn new(error_descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_descriptor: error_descriptor.into(),
            message: message.into(),
        }
    }

    /// Error kind, as reported by the handler that raised it.
    pub fn kind(&self) -> &str {
        &self.error_descriptor
    }
}

impl fmt::Display for StoredFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_descriptor, self.message)
    }
}

impl std::error::Error for StoredFailure {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outcome {
    Response(StoredResponse),
    Failure(StoredFailure),
}

/// Persisted unit of idempotency state.
///
/// Fields are private so that a record can only move `Running -> Done` once:
/// `outcome` is absent while running and present once done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord", into = "RawRecord")]
pub struct IdempotencyRecord {
    key: String,
    created_at: DateTime<Utc>,
    state: RecordState,
    outcome: Option<Outcome>,
}

impl IdempotencyRecord {
    pub fn running(key: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            created_at,
            state: RecordState::Running,
            outcome: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.state == RecordState::Running
    }

    pub fn is_done(&self) -> bool {
        self.state == RecordState::Done
    }

    /// Time spent processing as seen at `now`. Never negative.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now.signed_duration_since(self.created_at);
        if elapsed < Duration::zero() {
            Duration::zero()
        } else {
            elapsed
        }
    }

    /// Returns the completed record, or `None` when this record is already done.
    pub fn finish(&self, outcome: Outcome) -> Option<IdempotencyRecord> {
        if self.is_done() {
            return None;
        }
        Some(Self {
            key: self.key.clone(),
            created_at: self.created_at,
            state: RecordState::Done,
            outcome: Some(outcome),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct RawRecord {
    key: String,
    created_at: DateTime<Utc>,
    state: RecordState,
    #[serde(default)]
    outcome: Option<Outcome>,
}

impl TryFrom<RawRecord> for IdempotencyRecord {
    type Error = String;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        match (raw.state, &raw.outcome) {
            (RecordState::Running, Some(_)) => {
                Err(format!("running record '{}' carries an outcome", raw.key))
            }
            (RecordState::Done, None) => Err(format!("done record '{}' has no outcome", raw.key)),
            _ => Ok(Self {
                key: raw.key,
                created_at: raw.created_at,
                state: raw.state,
                outcome: raw.outcome,
            }),
        }
    }
}

impl From<IdempotencyRecord> for RawRecord {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            key: record.key,
            created_at: record.created_at,
            state: record.state,
            outcome: record.outcome,
        }
    }
}

/// Body bytes stored as lowercase hex so records stay plain JSON.
mod body_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
