//! The message envelope shared by every peer message.
//!
//! Business payloads are opaque to this layer. Only two fields are read:
//! the `status` discriminant (required; `type` is accepted when `status` is
//! absent) and the optional `requestId` correlation id. Everything else is
//! kept verbatim in [`Envelope::body`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{Result, TetherError};
use crate::ids::RequestId;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Message kind discriminant.
///
/// The named variants are kinds the connection layer itself reacts to.
/// Every other tag is carried as [`Status::Other`] so callers can still
/// route on it (e.g. `"search_results"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    /// Request completed successfully.
    Success,
    /// Request failed; the body usually carries an `error` string.
    Error,
    /// Intermediate progress for a long-running request.
    Progress,
    /// Final message of a streamed response.
    Complete,
    /// Keep-alive reply.
    Pong,
    /// A kind this layer does not interpret.
    Other(String),
}

impl Status {
    /// Wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Pong => "pong",
            Self::Other(tag) => tag,
        }
    }

    /// Whether this is a kind the layer does not interpret.
    #[must_use]
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Other(_))
    }
}

impl From<&str> for Status {
    fn from(tag: &str) -> Self {
        match tag {
            "success" => Self::Success,
            "error" => Self::Error,
            "progress" => Self::Progress,
            "complete" => Self::Complete,
            "pong" => Self::Pong,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl From<String> for Status {
    fn from(tag: String) -> Self {
        match Self::from(tag.as_str()) {
            Self::Other(_) => Self::Other(tag),
            known => known,
        }
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        match status {
            Status::Other(tag) => tag,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed peer message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct Envelope {
    /// Kind discriminant.
    pub status: Status,
    /// Correlation id, when the peer echoed one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// All remaining fields.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with an empty body.
    #[must_use]
    pub fn new(status: impl Into<Status>) -> Self {
        Self {
            status: status.into(),
            request_id: None,
            body: Map::new(),
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Set a body field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.body.insert(name.into(), value.into());
        self
    }

    /// Synthesized error response `{status: "error", requestId, error: reason}`.
    #[must_use]
    pub fn failure(request_id: &RequestId, reason: &str) -> Self {
        Self::new(Status::Error)
            .with_request_id(request_id.clone())
            .with_field("error", reason)
    }

    /// Synthesized timeout response.
    #[must_use]
    pub fn timeout(request_id: &RequestId) -> Self {
        Self::failure(request_id, "timeout")
    }

    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::try_from(value)
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Look up a body field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Look up a body field holding a string.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(Value::as_str)
    }

    /// Whether this is an error response.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// The `error` string of an error response.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        if self.is_error() {
            self.str_field("error")
        } else {
            None
        }
    }
}

impl TryFrom<Value> for Envelope {
    type Error = TetherError;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(mut body) = value else {
            return Err(TetherError::Parse("expected a JSON object".into()));
        };

        let status = match body.remove("status") {
            Some(Value::String(tag)) => Status::from(tag),
            Some(other) => {
                return Err(TetherError::Parse(format!(
                    "status must be a string, got {other}"
                )));
            }
            None => match body.remove("type") {
                Some(Value::String(tag)) => Status::from(tag),
                _ => return Err(TetherError::Parse("missing status discriminant".into())),
            },
        };

        let request_id = match body.remove("requestId") {
            Some(Value::String(id)) => Some(RequestId::from(id)),
            Some(Value::Number(n)) => Some(RequestId::from(n.to_string())),
            Some(Value::Null) | None => None,
            Some(other) => {
                let _ = body.insert("requestId".into(), other);
                None
            }
        };

        Ok(Self {
            status,
            request_id,
            body,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_envelope() {
        let env = Envelope::from_json(
            r#"{"status":"success","requestId":"search-1","results":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(env.status, Status::Success);
        assert_eq!(env.request_id.as_deref(), Some("search-1"));
        assert_eq!(env.field("results"), Some(&json!([1, 2])));
        assert!(env.field("status").is_none());
    }

    #[test]
    fn type_is_accepted_when_status_absent() {
        let env = Envelope::from_json(r#"{"type":"metadata_result","title":"A"}"#).unwrap();
        assert_eq!(env.status, Status::Other("metadata_result".into()));
        assert!(env.request_id.is_none());
        assert_eq!(env.str_field("title"), Some("A"));
    }

    #[test]
    fn status_wins_over_type() {
        let env = Envelope::from_json(r#"{"status":"progress","type":"upload"}"#).unwrap();
        assert_eq!(env.status, Status::Progress);
        assert_eq!(env.str_field("type"), Some("upload"));
    }

    #[test]
    fn numeric_request_id_is_stringified() {
        let env = Envelope::from_json(r#"{"status":"success","requestId":42}"#).unwrap();
        assert_eq!(env.request_id.as_deref(), Some("42"));
    }

    #[test]
    fn rejects_non_objects_and_missing_status() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json("[1,2]").is_err());
        assert!(Envelope::from_json(r#"{"requestId":"x"}"#).is_err());
        assert!(Envelope::from_json(r#"{"status":7}"#).is_err());
    }

    #[test]
    fn unknown_status_is_explicitly_unrecognized() {
        let env = Envelope::from_json(r#"{"status":"directory_listing"}"#).unwrap();
        assert!(env.status.is_unrecognized());
        assert_eq!(env.status.as_str(), "directory_listing");
    }

    #[test]
    fn timeout_envelope_shape() {
        let env = Envelope::timeout(&RequestId::from("r-1"));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"status": "error", "requestId": "r-1", "error": "timeout"})
        );
        assert_eq!(env.error_message(), Some("timeout"));
    }

    #[test]
    fn serialize_then_parse_keeps_fields() {
        let env = Envelope::new("search")
            .with_request_id(RequestId::from("search-9"))
            .with_field("query", "cats");
        let text = env.to_json().unwrap();
        let back = Envelope::from_json(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn deserialize_via_serde_uses_same_rules() {
        let env: Envelope = serde_json::from_value(json!({"type": "pong"})).unwrap();
        assert_eq!(env.status, Status::Pong);
    }

    #[test]
    fn error_message_only_for_errors() {
        let env = Envelope::new(Status::Success).with_field("error", "ignored");
        assert!(env.error_message().is_none());
    }
}
