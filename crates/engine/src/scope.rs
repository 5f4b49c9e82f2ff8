//! Identity & scope resolution.
//!
//! Binds an authenticated `(user, device)` to a wallet and a membership
//! role. Ownership is server-authoritative: the member rows in storage
//! decide, never the client payload.

use serde_json::Value;
use wallet_sync_core::registry;
use wallet_sync_core::WalletId;
use wallet_sync_storage::Storage;

use crate::RequestError;

/// Authenticated caller, as resolved by the transport layer from the
/// bearer token. The token's device binding has already been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WalletRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl WalletRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "viewer" => Some(WalletRole::Viewer),
            "member" => Some(WalletRole::Member),
            "admin" => Some(WalletRole::Admin),
            "owner" => Some(WalletRole::Owner),
            _ => None,
        }
    }
}

/// Resolved request scope consumed by every later stage.
#[derive(Debug, Clone)]
pub struct Scope {
    pub user_id: String,
    pub device_id: String,
    pub wallet_id: WalletId,
    /// None only for a wallet-bootstrap push (the wallet does not exist
    /// yet, so there is no membership to hold).
    pub role: Option<WalletRole>,
}

/// Look up the caller's active membership in `wallet_id`.
///
/// `allow_bootstrap` lets a push consisting solely of `Wallet` items
/// through without membership, so a device can create its first wallet.
pub(crate) async fn resolve_scope(
    storage: &dyn Storage,
    identity: &Identity,
    wallet_id: &WalletId,
    allow_bootstrap: bool,
) -> Result<Scope, RequestError> {
    let members = storage
        .list_live_rows(wallet_id, registry::WALLET_MEMBER)
        .await?;

    let role = members.iter().find_map(|row| {
        let user = row.payload.get("user").and_then(Value::as_str)?;
        let status = row.payload.get("status").and_then(Value::as_str)?;
        if user != identity.user_id || status != "active" {
            return None;
        }
        row.payload
            .get("role")
            .and_then(Value::as_str)
            .and_then(WalletRole::parse)
    });

    if role.is_none() && !allow_bootstrap {
        return Err(RequestError::WalletAccessDenied);
    }

    Ok(Scope {
        user_id: identity.user_id.clone(),
        device_id: identity.device_id.clone(),
        wallet_id: wallet_id.clone(),
        role,
    })
}
