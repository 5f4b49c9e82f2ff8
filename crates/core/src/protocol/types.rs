use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mutation kind carried by a push item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(()),
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation in a push batch, decoded leniently: every field is optional
/// at the serde layer so shape problems surface as per-item error codes
/// instead of a whole-batch decode failure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PushItem {
    #[serde(default)]
    pub op_id: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub base_version: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub results: Vec<Value>,
    pub server_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub message: PushMessage,
}

/// Pull item projection: entity metadata plus the attribute bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullItem {
    pub entity_type: String,
    pub entity_id: String,
    pub client_id: String,
    pub doc_version: i64,
    pub server_modified: String,
    pub payload: Value,
    pub is_deleted: i64,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullMessage {
    pub items: Vec<PullItem>,
    pub next_cursor: String,
    pub has_more: bool,
    pub server_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub message: PullMessage,
}

/// Request-level error body (HTTP 4xx).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Per-item outcome of a push. Serialized with a `status` discriminator so
/// the results list is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ItemResult {
    #[serde(rename = "accepted")]
    Accepted(ItemAck),
    #[serde(rename = "duplicate")]
    Duplicate(ItemAck),
    #[serde(rename = "conflict")]
    Conflict(ItemConflict),
    #[serde(rename = "error")]
    Error(ItemError),
}

impl ItemResult {
    pub fn status(&self) -> &'static str {
        match self {
            ItemResult::Accepted(_) => "accepted",
            ItemResult::Duplicate(_) => "duplicate",
            ItemResult::Conflict(_) => "conflict",
            ItemResult::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub client_id: String,
    pub doc_version: i64,
    pub server_modified: String,
}

/// Version mismatch report. Carries the authoritative snapshot so clients
/// can rebase; `server_doc_version` duplicates `doc_version` for older
/// clients that read the prefixed name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConflict {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub client_id: String,
    pub doc_version: i64,
    pub server_modified: String,
    pub client_base_version: i64,
    pub server_doc_version: i64,
    pub server_record: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub error: String,
    pub error_code: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Stable item-level error codes. `as_str` values are wire contract; the
/// messages are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    OpIdRequired,
    EntityTypeRequired,
    UnsupportedEntityType,
    InvalidOperation,
    EntityIdRequired,
    PayloadMustBeObject,
    WalletIdMismatch,
    EntityIdMismatch,
    InvalidClientId,
    BaseVersionRequired,
    BaseVersionInvalid,
    MissingRequiredFields,
    InvalidField,
    InvalidFieldType,
    NotFound,
    PayloadTooLarge,
    SensitiveFieldNotAllowed,
    WalletIdMustEqualClientId,
    WalletAccessDenied,
    Rejected,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::OpIdRequired => "op_id_required",
            ErrorCode::EntityTypeRequired => "entity_type_required",
            ErrorCode::UnsupportedEntityType => "unsupported_entity_type",
            ErrorCode::InvalidOperation => "invalid_operation",
            ErrorCode::EntityIdRequired => "entity_id_required",
            ErrorCode::PayloadMustBeObject => "payload_must_be_object",
            ErrorCode::WalletIdMismatch => "wallet_id_mismatch",
            ErrorCode::EntityIdMismatch => "entity_id_mismatch",
            ErrorCode::InvalidClientId => "invalid_client_id",
            ErrorCode::BaseVersionRequired => "base_version_required",
            ErrorCode::BaseVersionInvalid => "base_version_invalid",
            ErrorCode::MissingRequiredFields => "missing_required_fields",
            ErrorCode::InvalidField => "invalid_field",
            ErrorCode::InvalidFieldType => "invalid_field_type",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::SensitiveFieldNotAllowed => "sensitive_field_not_allowed",
            ErrorCode::WalletIdMustEqualClientId => "wallet_id_must_equal_client_id",
            ErrorCode::WalletAccessDenied => "wallet_access_denied",
            ErrorCode::Rejected => "rejected",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::OpIdRequired => "op_id is required",
            ErrorCode::EntityTypeRequired => "entity_type is required",
            ErrorCode::UnsupportedEntityType => "unsupported entity_type",
            ErrorCode::InvalidOperation => "invalid operation",
            ErrorCode::EntityIdRequired => "entity_id is required",
            ErrorCode::PayloadMustBeObject => "payload must be an object",
            ErrorCode::WalletIdMismatch => "wallet_id mismatch",
            ErrorCode::EntityIdMismatch => "entity_id does not match payload client_id",
            ErrorCode::InvalidClientId => "invalid client_id",
            ErrorCode::BaseVersionRequired => "base_version is required",
            ErrorCode::BaseVersionInvalid => "base_version must be a number",
            ErrorCode::MissingRequiredFields => "missing required fields",
            ErrorCode::InvalidField => "invalid field",
            ErrorCode::InvalidFieldType => "invalid field type",
            ErrorCode::NotFound => "record not found",
            ErrorCode::PayloadTooLarge => "payload too large",
            ErrorCode::SensitiveFieldNotAllowed => "sensitive field not allowed",
            ErrorCode::WalletIdMustEqualClientId => "wallet_id must equal client_id",
            ErrorCode::WalletAccessDenied => "wallet access denied",
            ErrorCode::Rejected => "request rejected",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
