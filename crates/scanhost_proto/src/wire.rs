use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Wire messages exchanged between warden and a scan host.
///
/// Every frame is a single JSON object carrying a `type` tag. Requests flow
/// warden → host, replies flow host → warden. Replies that belong to a
/// specific in-flight file carry the `notificationId` the request minted;
/// `UPDATE_ISOLATION_PATH_STATUS` is the one reply matched by kind instead.
///
/// Status strings are compared against [`ISOLATION_OK`], [`ACTION_OK`] and
/// [`PATH_UPDATE_OK`]; anything else is a service-reported failure whose
/// `details` are surfaced to the user verbatim.

/// `status` value of a successful `ISOLATION_STATUS`.
pub const ISOLATION_OK: &str = "successful";
/// `status` value of a successful `ACTION_DECISION_STATUS`.
pub const ACTION_OK: &str = "success";
/// `status` value of a successful `UPDATE_ISOLATION_PATH_STATUS`.
pub const PATH_UPDATE_OK: &str = "success";

/// Opaque per-file correlation token. Minted once when a file enters the
/// workflow, echoed by the host on every reply about that file, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh process-unique id.
    pub fn mint() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(raw: String) -> Self {
        CorrelationId(raw)
    }
}

impl From<&str> for CorrelationId {
    fn from(raw: &str) -> Self {
        CorrelationId(raw.to_owned())
    }
}

/// Remedial action the user picked for a scanned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileAction {
    Delete,
    Isolate,
    Restore,
}

/// Scan outcome reported by the host. The set is closed: a reply carrying
/// any other string fails to parse and is treated as a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScanVerdict {
    Clean,
    Malicious,
    Suspicious,
    Error,
}

/// Requests sent by warden to the scan host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum HostRequest {
    /// Move a downloaded file into the isolation directory and scan it.
    /// An empty `isolation_path` lets the host pick its default directory.
    InitiateFileIsolation {
        download_path: String,
        filename: String,
        isolation_path: String,
        notification_id: CorrelationId,
    },
    /// Relocate the isolation directory (and everything already in it).
    UpdateIsolationPath { old_path: String, new_path: String },
    /// The user's post-scan decision for one file.
    FileActionDecision {
        action: FileAction,
        notification_id: CorrelationId,
    },
}

/// Replies sent by the scan host to warden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServiceReply {
    /// Outcome of an isolation attempt. `status == "successful"` means the
    /// file now sits in the isolation directory and a scan is underway.
    IsolationStatus {
        status: String,
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        notification_id: CorrelationId,
    },
    /// Final verdict for an isolated file.
    ScanResult {
        status: ScanVerdict,
        filename: String,
        #[serde(default)]
        details: String,
        notification_id: CorrelationId,
    },
    /// Outcome of a `FILE_ACTION_DECISION`.
    ActionDecisionStatus {
        status: String,
        action_performed: FileAction,
        #[serde(default)]
        details: String,
        notification_id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restored_path: Option<String>,
    },
    /// Outcome of an `UPDATE_ISOLATION_PATH`. Matched by kind, not id.
    UpdateIsolationPathStatus {
        status: String,
        #[serde(default)]
        details: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        moved_count: Option<u64>,
    },
}

/// Kind tags for [`HostRequest`], mirroring the wire `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    InitiateFileIsolation,
    UpdateIsolationPath,
    FileActionDecision,
}

/// Kind tags for [`ServiceReply`], mirroring the wire `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyKind {
    IsolationStatus,
    ScanResult,
    ActionDecisionStatus,
    UpdateIsolationPathStatus,
}

impl HostRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            HostRequest::InitiateFileIsolation { .. } => RequestKind::InitiateFileIsolation,
            HostRequest::UpdateIsolationPath { .. } => RequestKind::UpdateIsolationPath,
            HostRequest::FileActionDecision { .. } => RequestKind::FileActionDecision,
        }
    }

    /// The correlation id this request is about, if it is about one file.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            HostRequest::InitiateFileIsolation { notification_id, .. } => Some(notification_id),
            HostRequest::FileActionDecision { notification_id, .. } => Some(notification_id),
            HostRequest::UpdateIsolationPath { .. } => None,
        }
    }
}

impl ServiceReply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            ServiceReply::IsolationStatus { .. } => ReplyKind::IsolationStatus,
            ServiceReply::ScanResult { .. } => ReplyKind::ScanResult,
            ServiceReply::ActionDecisionStatus { .. } => ReplyKind::ActionDecisionStatus,
            ServiceReply::UpdateIsolationPathStatus { .. } => ReplyKind::UpdateIsolationPathStatus,
        }
    }

    /// The correlation id carried by the reply, if the kind carries one.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            ServiceReply::IsolationStatus { notification_id, .. } => Some(notification_id),
            ServiceReply::ScanResult { notification_id, .. } => Some(notification_id),
            ServiceReply::ActionDecisionStatus { notification_id, .. } => Some(notification_id),
            ServiceReply::UpdateIsolationPathStatus { .. } => None,
        }
    }
}

/// A frame that arrived on the channel but is not a well-formed message.
/// These are logged and dropped; they never advance workflow state.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object with a `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse one inbound frame into a typed reply.
///
/// Distinguishes an unknown `type` tag from a malformed body for a known
/// tag so callers can log them apart.
pub fn parse_reply(bytes: &[u8]) -> Result<ServiceReply, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let kind = tag_of(&value)?;
    kind.parse::<ReplyKind>()
        .map_err(|_| ProtocolError::UnknownType(kind.clone()))?;
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

/// Parse one inbound frame into a typed request (host side).
pub fn parse_request(bytes: &[u8]) -> Result<HostRequest, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let kind = tag_of(&value)?;
    kind.parse::<RequestKind>()
        .map_err(|_| ProtocolError::UnknownType(kind.clone()))?;
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

fn tag_of(value: &Value) -> Result<String, ProtocolError> {
    value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtocolError::MissingType)
}
