#![forbid(unsafe_code)]

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::{migrate_with_pool, PostgresStorage};

use async_trait::async_trait;
use serde_json::{Map, Value};
use wallet_sync_core::protocol::format_micros;
use wallet_sync_core::WalletId;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Database(String),
}

/// One persisted syncable row. `server_modified` and `deleted_at` are unix
/// microseconds; the payload is the canonical attribute bag and always
/// contains `client_id == entity_id` and the owning `wallet_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub wallet_id: WalletId,
    pub entity_type: String,
    pub entity_id: String,
    pub doc_version: i64,
    pub server_modified: i64,
    pub is_deleted: bool,
    pub deleted_at: Option<i64>,
    pub payload: Map<String, Value>,
}

/// One operation-ledger row: the exact result returned when
/// `(user, device, op_id)` was first applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub user_id: String,
    pub device_id: String,
    pub op_id: String,
    pub wallet_id: WalletId,
    pub entity_type: String,
    pub client_id: String,
    pub status: String,
    pub server_modified: Option<i64>,
    pub result: Value,
}

impl LedgerEntry {
    /// Stamp the entry with the commit's allocated `server_modified`.
    /// Result JSON for accepted writes carries the stamp too, so replays
    /// return exactly what the first application returned.
    pub(crate) fn stamped(&self, server_modified: i64) -> LedgerEntry {
        let mut entry = self.clone();
        entry.server_modified = Some(server_modified);
        if let Value::Object(result) = &mut entry.result {
            result.insert(
                "server_modified".to_owned(),
                Value::String(format_micros(server_modified)),
            );
        }
        entry
    }
}

/// Optimistic guard evaluated inside the commit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteGuard {
    /// The row must not exist yet.
    MustCreate,
    /// The row must exist at exactly this `doc_version`.
    MatchVersion(i64),
    /// Unconditional write; used by recalc, which fully recomputes.
    Force,
}

#[derive(Debug, Clone)]
pub struct RowWrite {
    pub wallet_id: WalletId,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Map<String, Value>,
    pub guard: WriteGuard,
    /// Soft delete: stamp `is_deleted` and `deleted_at` alongside the bump.
    pub mark_deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Applied {
        doc_version: i64,
        server_modified: i64,
        deleted_at: Option<i64>,
    },
    /// The guard did not hold. Carries the row as the transaction saw it
    /// (None when the guard required a row that is absent).
    GuardFailed { current: Option<EntityRow> },
    /// The attached ledger entry collided with an already-recorded op; the
    /// write was rolled back and the prior result stands.
    OpReplayed { prior: LedgerEntry },
}

/// Persistence contract for the sync engine.
///
/// Implementations must make each `commit_row`/`remove_row` atomic (readers
/// see the old or the new row, never a torn write) and must allocate
/// `server_modified` strictly monotonically per wallet: wall time clamped
/// upward to one tick past the last assigned stamp.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn get_row(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntityRow>, StorageError>;

    /// Live (not soft-deleted) rows of one type, for recalc scans.
    async fn list_live_rows(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
    ) -> Result<Vec<EntityRow>, StorageError>;

    /// Rows with `server_modified > since`, ordered by
    /// `(server_modified, entity_id)` ascending, capped at `limit`. The
    /// second return value reports whether more rows remain past the cap.
    async fn changes_since(
        &self,
        wallet_id: &WalletId,
        since_micros: i64,
        limit: usize,
    ) -> Result<(Vec<EntityRow>, bool), StorageError>;

    /// Guarded insert-or-update. When `ledger` is given it is recorded in
    /// the same transaction; the ledger row is the item's commit boundary.
    /// The stored entry is stamped with the allocated `server_modified`,
    /// and an object-shaped `result` gets its `server_modified` member
    /// overwritten with the canonical rendering of that stamp.
    async fn commit_row(
        &self,
        write: RowWrite,
        ledger: Option<&LedgerEntry>,
    ) -> Result<CommitOutcome, StorageError>;

    /// Hard delete for entity types without deletion fields. On success the
    /// returned `doc_version`/`server_modified` are the pre-delete values.
    async fn remove_row(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
        entity_id: &str,
        expected_version: Option<i64>,
        ledger: Option<&LedgerEntry>,
    ) -> Result<CommitOutcome, StorageError>;

    async fn ledger_lookup(
        &self,
        user_id: &str,
        device_id: &str,
        op_id: &str,
    ) -> Result<Option<LedgerEntry>, StorageError>;

    /// Unique insert keyed by `(user, device, op_id)`. Returns the entry
    /// stored after the call: the input on first insert, the prior entry on
    /// collision.
    async fn ledger_record(&self, entry: &LedgerEntry) -> Result<LedgerEntry, StorageError>;
}
