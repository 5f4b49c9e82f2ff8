use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::{AuthError, DeviceAuth, DeviceIdentity};

type HmacSha256 = Hmac<Sha256>;

pub const DEVICE_TOKEN_VERSION: u8 = 1;

const NONCE_LENGTH: usize = 16;
const MAC_LENGTH: usize = 32;
const MAX_ID_LENGTH: usize = 255;

/// Issues and validates device bearer tokens.
///
/// Token layout (before base64url):
/// `version(1) | expiry_be(8) | user_len(1) | user | device_len(1) | device
/// | nonce(16) | hmac-sha256(32)`. The MAC covers everything before it, so
/// the token is self-contained: validation needs only the server key.
#[derive(Debug, Clone)]
pub struct DeviceTokenManager {
    key: [u8; 32],
    ttl: Duration,
}

impl DeviceTokenManager {
    #[must_use]
    pub fn new(key: [u8; 32], ttl: Duration) -> Self {
        Self { key, ttl }
    }

    pub fn from_key_bytes(key: &[u8], ttl: Duration) -> Result<Self, AuthError> {
        if key.len() != 32 {
            return Err(AuthError::InvalidKeyLength(key.len()));
        }
        let mut key_bytes = [0_u8; 32];
        key_bytes.copy_from_slice(key);
        Ok(Self::new(key_bytes, ttl))
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue_token(&self, user_id: &str, device_id: &str) -> Result<String, AuthError> {
        if user_id.is_empty()
            || device_id.is_empty()
            || user_id.len() > MAX_ID_LENGTH
            || device_id.len() > MAX_ID_LENGTH
        {
            return Err(AuthError::InvalidToken);
        }

        let expiry_time = SystemTime::now()
            .checked_add(self.ttl)
            .ok_or(AuthError::ExpiryOutOfRange)?;
        let expiry = expiry_time
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::ExpiryOutOfRange)?
            .as_secs();

        let mut token = Vec::with_capacity(
            1 + 8 + 1 + user_id.len() + 1 + device_id.len() + NONCE_LENGTH + MAC_LENGTH,
        );
        token.push(DEVICE_TOKEN_VERSION);
        token.extend_from_slice(&expiry.to_be_bytes());
        token.push(user_id.len() as u8);
        token.extend_from_slice(user_id.as_bytes());
        token.push(device_id.len() as u8);
        token.extend_from_slice(device_id.as_bytes());

        let mut nonce = [0_u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        token.extend_from_slice(&nonce);

        let mac = self.sign(&token)?;
        token.extend_from_slice(&mac);

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    pub fn validate_token(&self, token: &str) -> Result<DeviceIdentity, AuthError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| AuthError::InvalidToken)?;
        if bytes.len() < 1 + 8 + 1 + 1 + 1 + 1 + NONCE_LENGTH + MAC_LENGTH {
            return Err(AuthError::InvalidToken);
        }
        if bytes[0] != DEVICE_TOKEN_VERSION {
            return Err(AuthError::InvalidToken);
        }

        let (signed, mac) = bytes.split_at(bytes.len() - MAC_LENGTH);
        let expected = self.sign(signed)?;
        if !constant_time_eq(mac, &expected) {
            return Err(AuthError::InvalidToken);
        }

        let expiry = u64::from_be_bytes(
            bytes[1..9]
                .try_into()
                .map_err(|_| AuthError::InvalidToken)?,
        );

        let mut offset = 9;
        let user_id = read_id(&bytes, &mut offset)?;
        let device_id = read_id(&bytes, &mut offset)?;
        if offset + NONCE_LENGTH + MAC_LENGTH != bytes.len() {
            return Err(AuthError::InvalidToken);
        }

        let expires_at = UNIX_EPOCH
            .checked_add(Duration::from_secs(expiry))
            .ok_or(AuthError::ExpiryOutOfRange)?;
        if SystemTime::now() > expires_at {
            return Err(AuthError::ExpiredToken);
        }

        Ok(DeviceIdentity {
            user_id,
            device_id,
            expires_at_secs: expiry,
        })
    }

    fn sign(&self, data: &[u8]) -> Result<[u8; MAC_LENGTH], AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| AuthError::InvalidKeyLength(self.key.len()))?;
        mac.update(data);
        let mut signature = [0_u8; MAC_LENGTH];
        signature.copy_from_slice(&mac.finalize().into_bytes());
        Ok(signature)
    }
}

#[async_trait]
impl DeviceAuth for DeviceTokenManager {
    async fn resolve(&self, token: &str, device_id: &str) -> Result<DeviceIdentity, AuthError> {
        let identity = self.validate_token(token)?;
        if identity.device_id != device_id {
            return Err(AuthError::DeviceMismatch);
        }
        Ok(identity)
    }
}

fn read_id(bytes: &[u8], offset: &mut usize) -> Result<String, AuthError> {
    let len = *bytes.get(*offset).ok_or(AuthError::InvalidToken)? as usize;
    *offset += 1;
    if len == 0 {
        return Err(AuthError::InvalidToken);
    }
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or(AuthError::InvalidToken)?;
    let id = std::str::from_utf8(&bytes[*offset..end])
        .map_err(|_| AuthError::InvalidToken)?
        .to_owned();
    *offset = end;
    Ok(id)
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (&lhs, &rhs) in left.iter().zip(right) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_key() -> [u8; 32] {
        *b"01234567890123456789012345678901"
    }

    fn manager() -> DeviceTokenManager {
        DeviceTokenManager::new(test_key(), Duration::from_secs(15 * 60))
    }

    #[test]
    fn token_round_trip() {
        let token = manager()
            .issue_token("user-1", "device-1")
            .expect("issue token");

        let identity = manager().validate_token(&token).expect("validate token");
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.device_id, "device-1");
    }

    #[test]
    fn token_rejects_tampered_bytes() {
        let token = manager()
            .issue_token("user-1", "device-1")
            .expect("issue token");
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).expect("decode");
        bytes[12] ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);

        let error = manager()
            .validate_token(&tampered)
            .expect_err("tampered token should fail");
        assert_eq!(error, AuthError::InvalidToken);
    }

    #[test]
    fn token_rejects_truncated() {
        let token = manager()
            .issue_token("user-1", "device-1")
            .expect("issue token");
        let error = manager()
            .validate_token(&token[..token.len() / 2])
            .expect_err("truncated token should fail");
        assert_eq!(error, AuthError::InvalidToken);
    }

    #[test]
    fn token_rejects_expired() {
        let short = DeviceTokenManager::new(test_key(), Duration::from_millis(1));
        let token = short
            .issue_token("user-1", "device-1")
            .expect("issue token");

        std::thread::sleep(Duration::from_millis(5));

        let error = short
            .validate_token(&token)
            .expect_err("expired token should fail");
        assert_eq!(error, AuthError::ExpiredToken);
    }

    #[test]
    fn token_rejects_different_key() {
        let other = DeviceTokenManager::new(*b"abcdefghijklmnopqrstuvwxyz012345", manager().ttl());
        let token = manager()
            .issue_token("user-1", "device-1")
            .expect("issue token");

        let error = other
            .validate_token(&token)
            .expect_err("different key should fail");
        assert_eq!(error, AuthError::InvalidToken);
    }

    #[test]
    fn token_rejects_wrong_version() {
        let token = manager()
            .issue_token("user-1", "device-1")
            .expect("issue token");
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).expect("decode");
        bytes[0] = 99;
        let error = manager()
            .validate_token(&URL_SAFE_NO_PAD.encode(bytes))
            .expect_err("wrong version should fail");
        assert_eq!(error, AuthError::InvalidToken);
    }

    #[test]
    fn token_rejects_empty_input() {
        let error = manager()
            .validate_token("")
            .expect_err("empty token should fail");
        assert_eq!(error, AuthError::InvalidToken);
    }

    #[test]
    fn from_key_bytes_rejects_bad_length() {
        let error = DeviceTokenManager::from_key_bytes(b"short", Duration::from_secs(60))
            .expect_err("bad key");
        assert_eq!(error, AuthError::InvalidKeyLength(5));
    }

    #[test]
    fn issue_rejects_oversized_ids() {
        let long = "u".repeat(300);
        let error = manager()
            .issue_token(&long, "device-1")
            .expect_err("oversized id");
        assert_eq!(error, AuthError::InvalidToken);
    }

    #[tokio::test]
    async fn resolve_enforces_device_binding() {
        let token = manager()
            .issue_token("user-1", "device-1")
            .expect("issue token");

        let identity = manager()
            .resolve(&token, "device-1")
            .await
            .expect("matching device");
        assert_eq!(identity.user_id, "user-1");

        let error = manager()
            .resolve(&token, "device-2")
            .await
            .expect_err("wrong device should fail");
        assert_eq!(error, AuthError::DeviceMismatch);
    }
}
