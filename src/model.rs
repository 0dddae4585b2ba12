//! Tape data model and its human-editable serialization.
//!
//! Tapes are persisted as permissive JSON (comments, trailing commas, and
//! unquoted keys are accepted on load) so they can be edited by hand. Wire
//! keys are camelCase regardless of field naming here, binary payloads fall
//! back to base64 with an explicit flag, and unknown fields round-trip
//! through load and save untouched.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReplayError;
use crate::modes::RecordMode;

/// A single slice of process output with timing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Elapsed milliseconds since the previous chunk. The first chunk of an
    /// exchange is measured from the moment the input was submitted.
    #[serde(default)]
    pub delay_ms: u64,
    /// Raw output bytes, base64 on the wire.
    #[serde(rename = "dataB64", with = "b64")]
    pub data: Vec<u8>,
    /// UTF-8 validity hint, derivable from `data`.
    #[serde(rename = "isUtf8", default = "default_true")]
    pub is_utf8: bool,
}

impl Chunk {
    pub fn new(delay_ms: u64, data: Vec<u8>) -> Self {
        let is_utf8 = std::str::from_utf8(&data).is_ok();
        Self {
            delay_ms,
            data,
            is_utf8,
        }
    }
}

/// How an input was submitted: as a line (the recorder appended a newline)
/// or byte-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Line,
    Raw,
}

/// A stimulus submitted to the process.
///
/// Exactly one of `data_text` (valid UTF-8) or `data_bytes` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IOInput {
    #[serde(rename = "type", default)]
    pub kind: InputKind,
    #[serde(rename = "dataText", default, skip_serializing_if = "Option::is_none")]
    pub data_text: Option<String>,
    #[serde(
        rename = "dataBytesB64",
        default,
        with = "b64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub data_bytes: Option<Vec<u8>>,
}

impl IOInput {
    /// Build an input from raw bytes, preferring the text representation
    /// when the bytes are valid UTF-8.
    pub fn from_bytes(kind: InputKind, data: &[u8]) -> Self {
        match std::str::from_utf8(data) {
            Ok(text) => Self {
                kind,
                data_text: Some(text.to_string()),
                data_bytes: None,
            },
            Err(_) => Self {
                kind,
                data_text: None,
                data_bytes: Some(data.to_vec()),
            },
        }
    }

    /// Reconstruct the submitted bytes.
    pub fn bytes(&self) -> Vec<u8> {
        if let Some(text) = &self.data_text {
            text.as_bytes().to_vec()
        } else if let Some(bytes) = &self.data_bytes {
            bytes.clone()
        } else {
            Vec::new()
        }
    }
}

/// Ordered sequence of output chunks for one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IOOutput {
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

impl IOOutput {
    /// Concatenation of all chunk bytes in recorded order.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    /// Sum of recorded inter-chunk delays.
    pub fn total_delay_ms(&self) -> u64 {
        self.chunks.iter().map(|c| c.delay_ms).sum()
    }
}

/// Context captured just before an input was submitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExchangePre {
    /// Text observed on the stream immediately before the input.
    #[serde(default)]
    pub prompt: String,
    /// Opaque user-supplied state hash, compared when both sides carry one.
    #[serde(rename = "stateHash", default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Child exit captured during an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// One stimulus/response unit: input submitted, output received, optional
/// exit. `exit` may appear only on the terminal exchange of a tape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Exchange {
    #[serde(default)]
    pub pre: ExchangePre,
    #[serde(default)]
    pub input: IOInput,
    #[serde(default)]
    pub output: IOOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
    /// Total wall-clock duration; at least the sum of chunk delays.
    #[serde(default)]
    pub dur_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Terminal geometry captured at record time. Metadata only; replay does
/// not emulate TTY ioctls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

/// Latency hint persisted with a tape: a fixed delay or a `[lo, hi]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LatencyHint {
    Fixed(u64),
    Range(u64, u64),
}

/// Error-rate hint persisted with a tape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorRateHint {
    Fixed(f64),
}

/// Metadata describing the recorded invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeMeta {
    #[serde(rename = "createdAt", default = "default_created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pty: Option<PtySize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyHint>,
    #[serde(rename = "errorRate", default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<ErrorRateHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for TapeMeta {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            program: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: default_cwd(),
            pty: None,
            tag: None,
            latency: None,
            error_rate: None,
            seed: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Session block identifying the recording software.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeSession {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub record_mode: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TapeSession {
    pub fn current(mode: RecordMode) -> Self {
        Self {
            platform: "claudecontrol".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            record_mode: mode.as_str().to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Default for TapeSession {
    fn default() -> Self {
        Self::current(RecordMode::New)
    }
}

/// A complete tape: one logical invocation of `program` as a totally
/// ordered script of exchanges.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tape {
    #[serde(default)]
    pub meta: TapeMeta,
    #[serde(default)]
    pub session: TapeSession,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Tape {
    /// Parse a tape from permissive JSON (comments, trailing commas, and
    /// unquoted keys accepted).
    pub fn from_json5(text: &str) -> Result<Self, ReplayError> {
        json5::from_str(text).map_err(|e| ReplayError::Schema {
            message: e.to_string(),
            path: Default::default(),
        })
    }

    /// Serialize to pretty JSON. Plain JSON is a subset of what
    /// [`Tape::from_json5`] accepts, so `parse(serialize(t)) == t`.
    pub fn to_json5(&self) -> Result<String, ReplayError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ReplayError::Recording(format!("tape serialization failed: {e}")))
    }

    /// The terminal exchange, if any.
    pub fn last_exchange(&self) -> Option<&Exchange> {
        self.exchanges.last()
    }
}

fn default_true() -> bool {
    true
}

fn default_cwd() -> String {
    ".".to_string()
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

mod b64 {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => ser.serialize_some(&BASE64.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(de)?;
        match s {
            Some(s) => BASE64
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
