#![forbid(unsafe_code)]

mod device_token;

pub use device_token::{DeviceTokenManager, DEVICE_TOKEN_VERSION};

use async_trait::async_trait;

/// Identity a bearer token resolves to: the user plus the single device the
/// token was minted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
    pub expires_at_secs: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid device token")]
    InvalidToken,
    #[error("device token expired")]
    ExpiredToken,
    #[error("token is bound to a different device")]
    DeviceMismatch,
    #[error("device token HMAC key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("token expiry is out of range")]
    ExpiryOutOfRange,
}

/// Resolves a bearer token to a device identity. The supplied `device_id`
/// must match the device the token is bound to; callers never trust a
/// request's device claim on its own.
#[async_trait]
pub trait DeviceAuth: Send + Sync {
    async fn resolve(&self, token: &str, device_id: &str) -> Result<DeviceIdentity, AuthError>;
}
