//! In-memory storage backend.
//!
//! Backs engine unit and integration tests and keyless local runs. All
//! state lives under one mutex, which trivially satisfies the atomicity and
//! per-wallet monotonicity requirements of the `Storage` contract.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use wallet_sync_core::protocol::now_micros;
use wallet_sync_core::WalletId;

use crate::{
    CommitOutcome, EntityRow, LedgerEntry, RowWrite, Storage, StorageError, WriteGuard,
};

type RowKey = (WalletId, String, String);
type LedgerKey = (String, String, String);

#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<RowKey, EntityRow>,
    ledger: HashMap<LedgerKey, LedgerEntry>,
    clocks: HashMap<WalletId, i64>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn allocate_stamp(&mut self, wallet_id: &WalletId) -> i64 {
        let last = self.clocks.entry(wallet_id.to_owned()).or_insert(0);
        let stamp = now_micros().max(*last + 1);
        *last = stamp;
        stamp
    }

    fn replay(&self, ledger: Option<&LedgerEntry>) -> Option<LedgerEntry> {
        let entry = ledger?;
        self.ledger
            .get(&(
                entry.user_id.clone(),
                entry.device_id.clone(),
                entry.op_id.clone(),
            ))
            .cloned()
    }

    fn record(&mut self, ledger: Option<&LedgerEntry>) {
        if let Some(entry) = ledger {
            self.ledger.insert(
                (
                    entry.user_id.clone(),
                    entry.device_id.clone(),
                    entry.op_id.clone(),
                ),
                entry.clone(),
            );
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_row(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntityRow>, StorageError> {
        let inner = self.inner.lock();
        let key = (
            wallet_id.to_owned(),
            entity_type.to_owned(),
            entity_id.to_owned(),
        );
        Ok(inner.rows.get(&key).cloned())
    }

    async fn list_live_rows(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
    ) -> Result<Vec<EntityRow>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .values()
            .filter(|row| {
                row.wallet_id == *wallet_id && row.entity_type == entity_type && !row.is_deleted
            })
            .cloned()
            .collect())
    }

    async fn changes_since(
        &self,
        wallet_id: &WalletId,
        since_micros: i64,
        limit: usize,
    ) -> Result<(Vec<EntityRow>, bool), StorageError> {
        let inner = self.inner.lock();
        let mut rows: Vec<EntityRow> = inner
            .rows
            .values()
            .filter(|row| row.wallet_id == *wallet_id && row.server_modified > since_micros)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.server_modified, a.entity_id.as_str()).cmp(&(b.server_modified, b.entity_id.as_str()))
        });
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        Ok((rows, has_more))
    }

    async fn commit_row(
        &self,
        write: RowWrite,
        ledger: Option<&LedgerEntry>,
    ) -> Result<CommitOutcome, StorageError> {
        let mut inner = self.inner.lock();

        if let Some(prior) = inner.replay(ledger) {
            return Ok(CommitOutcome::OpReplayed { prior });
        }

        let key = (
            write.wallet_id.clone(),
            write.entity_type.clone(),
            write.entity_id.clone(),
        );
        let current = inner.rows.get(&key).cloned();

        match write.guard {
            WriteGuard::MustCreate => {
                if current.is_some() {
                    return Ok(CommitOutcome::GuardFailed { current });
                }
            }
            WriteGuard::MatchVersion(expected) => match &current {
                None => return Ok(CommitOutcome::GuardFailed { current: None }),
                Some(row) if row.doc_version != expected => {
                    return Ok(CommitOutcome::GuardFailed { current });
                }
                Some(_) => {}
            },
            WriteGuard::Force => {}
        }

        let stamp = inner.allocate_stamp(&write.wallet_id);
        let doc_version = current.as_ref().map_or(1, |row| row.doc_version + 1);
        let deleted_at = write.mark_deleted.then_some(stamp);

        let row = EntityRow {
            wallet_id: write.wallet_id,
            entity_type: write.entity_type,
            entity_id: write.entity_id,
            doc_version,
            server_modified: stamp,
            is_deleted: write.mark_deleted,
            deleted_at,
            payload: write.payload,
        };
        inner.rows.insert(key, row);
        let stamped = ledger.map(|entry| entry.stamped(stamp));
        inner.record(stamped.as_ref());

        Ok(CommitOutcome::Applied {
            doc_version,
            server_modified: stamp,
            deleted_at,
        })
    }

    async fn remove_row(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
        entity_id: &str,
        expected_version: Option<i64>,
        ledger: Option<&LedgerEntry>,
    ) -> Result<CommitOutcome, StorageError> {
        let mut inner = self.inner.lock();

        if let Some(prior) = inner.replay(ledger) {
            return Ok(CommitOutcome::OpReplayed { prior });
        }

        let key = (
            wallet_id.to_owned(),
            entity_type.to_owned(),
            entity_id.to_owned(),
        );
        let Some(current) = inner.rows.get(&key).cloned() else {
            return Ok(CommitOutcome::GuardFailed { current: None });
        };
        if let Some(expected) = expected_version {
            if current.doc_version != expected {
                return Ok(CommitOutcome::GuardFailed {
                    current: Some(current),
                });
            }
        }

        inner.rows.remove(&key);
        inner.record(ledger);

        Ok(CommitOutcome::Applied {
            doc_version: current.doc_version,
            server_modified: current.server_modified,
            deleted_at: current.deleted_at,
        })
    }

    async fn ledger_lookup(
        &self,
        user_id: &str,
        device_id: &str,
        op_id: &str,
    ) -> Result<Option<LedgerEntry>, StorageError> {
        let inner = self.inner.lock();
        let key = (user_id.to_owned(), device_id.to_owned(), op_id.to_owned());
        Ok(inner.ledger.get(&key).cloned())
    }

    async fn ledger_record(&self, entry: &LedgerEntry) -> Result<LedgerEntry, StorageError> {
        let mut inner = self.inner.lock();
        let key = (
            entry.user_id.clone(),
            entry.device_id.clone(),
            entry.op_id.clone(),
        );
        if let Some(prior) = inner.ledger.get(&key) {
            return Ok(prior.clone());
        }
        inner.ledger.insert(key, entry.clone());
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn wallet() -> WalletId {
        "wal-1".parse().expect("wallet id")
    }

    fn write(entity_id: &str, guard: WriteGuard) -> RowWrite {
        RowWrite {
            wallet_id: wallet(),
            entity_type: "Account".to_owned(),
            entity_id: entity_id.to_owned(),
            payload: payload(json!({"client_id": entity_id, "wallet_id": "wal-1"})),
            guard,
            mark_deleted: false,
        }
    }

    fn ledger(op_id: &str) -> LedgerEntry {
        LedgerEntry {
            user_id: "user-1".to_owned(),
            device_id: "device-1".to_owned(),
            op_id: op_id.to_owned(),
            wallet_id: wallet(),
            entity_type: "Account".to_owned(),
            client_id: "acc-1".to_owned(),
            status: "accepted".to_owned(),
            server_modified: None,
            result: json!({"status": "accepted"}),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trip() {
        let storage = MemoryStorage::new();
        let outcome = storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("commit");
        let CommitOutcome::Applied { doc_version, .. } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(doc_version, 1);

        let row = storage
            .get_row(&wallet(), "Account", "acc-1")
            .await
            .expect("get")
            .expect("row exists");
        assert_eq!(row.doc_version, 1);
        assert!(!row.is_deleted);
    }

    #[tokio::test]
    async fn must_create_fails_on_existing_row() {
        let storage = MemoryStorage::new();
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("first create");

        let outcome = storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("second create");
        let CommitOutcome::GuardFailed { current: Some(row) } = outcome else {
            panic!("expected guard failure, got {outcome:?}");
        };
        assert_eq!(row.doc_version, 1);
    }

    #[tokio::test]
    async fn match_version_guard() {
        let storage = MemoryStorage::new();
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("create");

        let outcome = storage
            .commit_row(write("acc-1", WriteGuard::MatchVersion(5)), None)
            .await
            .expect("stale update");
        assert!(matches!(outcome, CommitOutcome::GuardFailed { .. }));

        let outcome = storage
            .commit_row(write("acc-1", WriteGuard::MatchVersion(1)), None)
            .await
            .expect("matching update");
        let CommitOutcome::Applied { doc_version, .. } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(doc_version, 2);
    }

    #[tokio::test]
    async fn stamps_are_strictly_monotonic_per_wallet() {
        let storage = MemoryStorage::new();
        let mut last = 0;
        for idx in 0..50 {
            let outcome = storage
                .commit_row(write(&format!("acc-{idx}"), WriteGuard::MustCreate), None)
                .await
                .expect("commit");
            let CommitOutcome::Applied {
                server_modified, ..
            } = outcome
            else {
                panic!("expected applied");
            };
            assert!(server_modified > last, "stamp must advance");
            last = server_modified;
        }
    }

    #[tokio::test]
    async fn soft_delete_marks_and_stamps() {
        let storage = MemoryStorage::new();
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("create");

        let mut delete = write("acc-1", WriteGuard::MatchVersion(1));
        delete.mark_deleted = true;
        let outcome = storage.commit_row(delete, None).await.expect("delete");
        let CommitOutcome::Applied {
            doc_version,
            deleted_at,
            ..
        } = outcome
        else {
            panic!("expected applied");
        };
        assert_eq!(doc_version, 2);
        assert!(deleted_at.is_some());

        let row = storage
            .get_row(&wallet(), "Account", "acc-1")
            .await
            .expect("get")
            .expect("row exists");
        assert!(row.is_deleted);
    }

    #[tokio::test]
    async fn remove_row_returns_pre_delete_version() {
        let storage = MemoryStorage::new();
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("create");

        let outcome = storage
            .remove_row(&wallet(), "Account", "acc-1", Some(1), None)
            .await
            .expect("remove");
        let CommitOutcome::Applied { doc_version, .. } = outcome else {
            panic!("expected applied");
        };
        assert_eq!(doc_version, 1);

        assert!(storage
            .get_row(&wallet(), "Account", "acc-1")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn commit_short_circuits_on_recorded_op() {
        let storage = MemoryStorage::new();
        let entry = ledger("op-1");
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), Some(&entry))
            .await
            .expect("first commit");

        let outcome = storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), Some(&entry))
            .await
            .expect("replayed commit");
        let CommitOutcome::OpReplayed { prior } = outcome else {
            panic!("expected replay, got {outcome:?}");
        };
        assert_eq!(prior.op_id, "op-1");

        let row = storage
            .get_row(&wallet(), "Account", "acc-1")
            .await
            .expect("get")
            .expect("row exists");
        assert_eq!(row.doc_version, 1, "replay must not mutate");
    }

    #[tokio::test]
    async fn ledger_record_keeps_first_result() {
        let storage = MemoryStorage::new();
        let first = ledger("op-1");
        let mut second = ledger("op-1");
        second.status = "error".to_owned();

        let stored = storage.ledger_record(&first).await.expect("record first");
        assert_eq!(stored.status, "accepted");
        let stored = storage
            .ledger_record(&second)
            .await
            .expect("record second");
        assert_eq!(stored.status, "accepted", "collision returns prior");
    }

    #[tokio::test]
    async fn changes_since_orders_and_pages() {
        let storage = MemoryStorage::new();
        for id in ["acc-a", "acc-b", "acc-c"] {
            storage
                .commit_row(write(id, WriteGuard::MustCreate), None)
                .await
                .expect("commit");
        }

        let (page, has_more) = storage
            .changes_since(&wallet(), 0, 2)
            .await
            .expect("first page");
        assert_eq!(page.len(), 2);
        assert!(has_more);
        assert!(page[0].server_modified < page[1].server_modified);

        let (rest, has_more) = storage
            .changes_since(&wallet(), page[1].server_modified, 2)
            .await
            .expect("second page");
        assert_eq!(rest.len(), 1);
        assert!(!has_more);
        assert_eq!(rest[0].entity_id, "acc-c");
    }

    #[tokio::test]
    async fn changes_since_is_wallet_scoped() {
        let storage = MemoryStorage::new();
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("commit");
        let mut other = write("acc-2", WriteGuard::MustCreate);
        other.wallet_id = "wal-2".parse().expect("wallet id");
        storage.commit_row(other, None).await.expect("commit other");

        let (rows, _) = storage.changes_since(&wallet(), 0, 10).await.expect("scan");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wallet_id, wallet());
    }

    #[tokio::test]
    async fn list_live_rows_skips_tombstones() {
        let storage = MemoryStorage::new();
        storage
            .commit_row(write("acc-1", WriteGuard::MustCreate), None)
            .await
            .expect("create");
        let mut delete = write("acc-1", WriteGuard::MatchVersion(1));
        delete.mark_deleted = true;
        storage.commit_row(delete, None).await.expect("delete");

        let rows = storage
            .list_live_rows(&wallet(), "Account")
            .await
            .expect("list");
        assert!(rows.is_empty());
    }
}
