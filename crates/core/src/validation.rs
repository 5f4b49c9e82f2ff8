use thiserror::Error;

/// Hard cap on a single push batch.
pub const MAX_PUSH_ITEMS: usize = 200;
/// Hard cap on a single pull page.
pub const MAX_PULL_LIMIT: usize = 500;
/// Per-item payload cap, measured over the canonical JSON encoding.
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024;

const CLIENT_ID_MIN: usize = 3;
const CLIENT_ID_MAX: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("client_id is required")]
    ClientIdRequired,
    #[error("invalid client_id format")]
    InvalidClientId,
}

/// Validate and trim a client-assigned identifier.
///
/// Grammar: 3-128 chars, first char alphanumeric, remainder alphanumeric,
/// `_` or `-`. Client ids double as row names and link keys, so anything
/// looser would leak into cursor ordering and storage keys.
pub fn validate_client_id(raw: &str) -> Result<&str, ValidationError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ValidationError::ClientIdRequired);
    }
    if !is_client_id(id) {
        return Err(ValidationError::InvalidClientId);
    }
    Ok(id)
}

fn is_client_id(id: &str) -> bool {
    if id.len() < CLIENT_ID_MIN || id.len() > CLIENT_ID_MAX {
        return false;
    }
    for (idx, b) in id.as_bytes().iter().enumerate() {
        let ok = if idx == 0 {
            b.is_ascii_alphanumeric()
        } else {
            b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-'
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Clamp client-supplied epoch milliseconds to the int32 range the storage
/// schema reserves for them.
pub fn clamp_client_ms(value: i64) -> i64 {
    value.clamp(0, i64::from(i32::MAX))
}
