#![forbid(unsafe_code)]

//! The sync engine: request validation, operation idempotency, optimistic
//! version control, conflict reporting, soft-delete propagation, derived
//! aggregate recalculation, and cursor-paged delta production.

mod allocation;
mod pull;
mod push;
mod recalc;
mod scope;

pub use pull::PullParams;
pub use scope::{Identity, Scope, WalletRole};

use std::sync::Arc;

use wallet_sync_core::protocol::{PullMessage, PushItem, PushMessage};
use wallet_sync_storage::{Storage, StorageError};

/// Request-level failures: the entire push or pull is rejected before any
/// item is looked at. Item-level failures never surface here.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("device_id is required")]
    DeviceIdRequired,
    #[error("wallet_id is required")]
    WalletIdRequired,
    #[error("invalid wallet_id")]
    InvalidWalletId,
    #[error("items is required")]
    ItemsRequired,
    #[error("items must be a non-empty list")]
    ItemsInvalid,
    #[error("too many items in push batch")]
    TooManyItems,
    #[error("unsupported entity_type in batch")]
    UnsupportedEntityType,
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("wallet access denied")]
    WalletAccessDenied,
    #[error("viewer role cannot push mutations")]
    WalletReadOnly,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RequestError {
    /// Stable machine-readable code for the HTTP error body.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::DeviceIdRequired => "device_id_required",
            RequestError::WalletIdRequired => "wallet_id_required",
            RequestError::InvalidWalletId => "invalid_wallet_id",
            RequestError::ItemsRequired => "items_required",
            RequestError::ItemsInvalid => "items_invalid",
            RequestError::TooManyItems => "too_many_items",
            RequestError::UnsupportedEntityType => "unsupported_entity_type",
            RequestError::InvalidCursor => "invalid_cursor",
            RequestError::WalletAccessDenied => "wallet_access_denied",
            RequestError::WalletReadOnly => "wallet_read_only",
            RequestError::Storage(_) => "storage_error",
        }
    }
}

/// Push/pull orchestrator over a [`Storage`] backend.
#[derive(Clone)]
pub struct SyncEngine {
    storage: Arc<dyn Storage>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Apply a batch of client mutations. Items are applied sequentially in
    /// input order; each item is its own transactional unit and the result
    /// list matches the input order one-to-one.
    pub async fn push(
        &self,
        identity: &Identity,
        wallet_id: &str,
        items: &[PushItem],
    ) -> Result<PushMessage, RequestError> {
        push::push(self, identity, wallet_id, items).await
    }

    /// Stream wallet-scoped changes past the caller's cursor.
    pub async fn pull(
        &self,
        identity: &Identity,
        wallet_id: &str,
        params: PullParams<'_>,
    ) -> Result<PullMessage, RequestError> {
        pull::pull(self, identity, wallet_id, params).await
    }
}
