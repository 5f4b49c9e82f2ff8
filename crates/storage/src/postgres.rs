//! Postgres storage backend.
//!
//! Three tables: `entities` (rows keyed by wallet/type/id with a cursor
//! index), `sync_ops` (the operation ledger, unique per user/device/op),
//! and `wallet_clocks` (per-wallet monotonic stamp allocator). Each commit
//! runs in one transaction: allocate stamp, re-check the guard under a row
//! lock, upsert, insert the ledger entry.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Transaction};
use wallet_sync_core::protocol::now_micros;
use wallet_sync_core::WalletId;

use crate::{
    CommitOutcome, EntityRow, LedgerEntry, RowWrite, Storage, StorageError, WriteGuard,
};

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        wallet_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        doc_version BIGINT NOT NULL,
        server_modified BIGINT NOT NULL,
        is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
        deleted_at BIGINT,
        payload JSONB NOT NULL,
        PRIMARY KEY (wallet_id, entity_type, entity_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS entities_wallet_cursor_idx
        ON entities (wallet_id, server_modified, entity_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_ops (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        op_id TEXT NOT NULL,
        wallet_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        client_id TEXT NOT NULL,
        status TEXT NOT NULL,
        server_modified BIGINT,
        result JSONB NOT NULL,
        PRIMARY KEY (user_id, device_id, op_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_clocks (
        wallet_id TEXT PRIMARY KEY,
        last_micros BIGINT NOT NULL
    )
    "#,
];

pub async fn migrate_with_pool(pool: &PgPool) -> Result<(), StorageError> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
    }
    Ok(())
}

/// Allocate the next `server_modified` stamp for a wallet, holding the
/// clock row lock for the rest of the transaction.
async fn allocate_stamp(
    tx: &mut Transaction<'_, Postgres>,
    wallet_id: &WalletId,
) -> Result<i64, StorageError> {
    sqlx::query_scalar(
        r#"
        INSERT INTO wallet_clocks (wallet_id, last_micros)
        VALUES ($1, $2)
        ON CONFLICT (wallet_id) DO UPDATE
            SET last_micros = GREATEST(wallet_clocks.last_micros + 1, EXCLUDED.last_micros)
        RETURNING last_micros
        "#,
    )
    .bind(wallet_id.as_str())
    .bind(now_micros())
    .fetch_one(tx.as_mut())
    .await
    .map_err(|error| StorageError::Database(error.to_string()))
}

async fn load_row_for_update(
    tx: &mut Transaction<'_, Postgres>,
    wallet_id: &WalletId,
    entity_type: &str,
    entity_id: &str,
) -> Result<Option<EntityRow>, StorageError> {
    let record = sqlx::query_as::<_, EntityRecord>(
        r#"
        SELECT wallet_id, entity_type, entity_id, doc_version, server_modified,
               is_deleted, deleted_at, payload
        FROM entities
        WHERE wallet_id = $1 AND entity_type = $2 AND entity_id = $3
        FOR UPDATE
        "#,
    )
    .bind(wallet_id.as_str())
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(tx.as_mut())
    .await
    .map_err(|error| StorageError::Database(error.to_string()))?;
    Ok(record.map(EntityRecord::into_row))
}

/// Insert the ledger entry inside `tx`. Returns the prior entry when the
/// `(user, device, op_id)` key is already taken.
async fn insert_ledger(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> Result<Option<LedgerEntry>, StorageError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO sync_ops
            (user_id, device_id, op_id, wallet_id, entity_type, client_id,
             status, server_modified, result)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (user_id, device_id, op_id) DO NOTHING
        "#,
    )
    .bind(&entry.user_id)
    .bind(&entry.device_id)
    .bind(&entry.op_id)
    .bind(entry.wallet_id.as_str())
    .bind(&entry.entity_type)
    .bind(&entry.client_id)
    .bind(&entry.status)
    .bind(entry.server_modified)
    .bind(sqlx::types::Json(&entry.result))
    .execute(tx.as_mut())
    .await
    .map_err(|error| StorageError::Database(error.to_string()))?;

    if inserted.rows_affected() > 0 {
        return Ok(None);
    }

    let prior = sqlx::query_as::<_, LedgerRecord>(
        r#"
        SELECT user_id, device_id, op_id, wallet_id, entity_type, client_id,
               status, server_modified, result
        FROM sync_ops
        WHERE user_id = $1 AND device_id = $2 AND op_id = $3
        "#,
    )
    .bind(&entry.user_id)
    .bind(&entry.device_id)
    .bind(&entry.op_id)
    .fetch_one(tx.as_mut())
    .await
    .map_err(|error| StorageError::Database(error.to_string()))?;
    Ok(Some(prior.into_entry()))
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|_| StorageError::Unavailable)
    }

    async fn get_row(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntityRow>, StorageError> {
        let record = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT wallet_id, entity_type, entity_id, doc_version, server_modified,
                   is_deleted, deleted_at, payload
            FROM entities
            WHERE wallet_id = $1 AND entity_type = $2 AND entity_id = $3
            "#,
        )
        .bind(wallet_id.as_str())
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(record.map(EntityRecord::into_row))
    }

    async fn list_live_rows(
        &self,
        wallet_id: &WalletId,
        entity_type: &str,
    ) -> Result<Vec<EntityRow>, StorageError> {
        let records = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT wallet_id, entity_type, entity_id, doc_version, server_modified,
                   is_deleted, deleted_at, payload
            FROM entities
            WHERE wallet_id = $1 AND entity_type = $2 AND is_deleted = FALSE
            ORDER BY entity_id
            "#,
        )
        .bind(wallet_id.as_str())
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(records.into_iter().map(EntityRecord::into_row).collect())
    }

    async fn changes_since(
        &self,
        wallet_id: &WalletId,
        since_micros: i64,
        limit: usize,
    ) -> Result<(Vec<EntityRow>, bool), StorageError> {
        let probe = i64::try_from(limit + 1)
            .map_err(|_| StorageError::Database("limit out of range".to_owned()))?;
        let records = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT wallet_id, entity_type, entity_id, doc_version, server_modified,
                   is_deleted, deleted_at, payload
            FROM entities
            WHERE wallet_id = $1 AND server_modified > $2
            ORDER BY server_modified ASC, entity_id ASC
            LIMIT $3
            "#,
        )
        .bind(wallet_id.as_str())
        .bind(since_micros)
        .bind(probe)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let mut rows: Vec<EntityRow> = records.into_iter().map(EntityRecord::into_row).collect();
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        Ok((rows, has_more))
    }

    async fn commit_row(
        &self,
        write: RowWrite,
        ledger: Option<&LedgerEntry>,
    ) -> Result<CommitOutcome, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        let current = load_row_for_update(
            &mut tx,
            &write.wallet_id,
            &write.entity_type,
            &write.entity_id,
        )
        .await?;

        let guard_failed = match write.guard {
            WriteGuard::MustCreate => current.is_some(),
            WriteGuard::MatchVersion(expected) => {
                !matches!(&current, Some(row) if row.doc_version == expected)
            }
            WriteGuard::Force => false,
        };
        if guard_failed {
            tx.rollback()
                .await
                .map_err(|error| StorageError::Database(error.to_string()))?;
            return Ok(CommitOutcome::GuardFailed { current });
        }

        let stamp = allocate_stamp(&mut tx, &write.wallet_id).await?;
        let doc_version = current.as_ref().map_or(1, |row| row.doc_version + 1);
        let deleted_at = write.mark_deleted.then_some(stamp);

        if let Some(entry) = ledger {
            let stamped = entry.stamped(stamp);
            if let Some(prior) = insert_ledger(&mut tx, &stamped).await? {
                tx.rollback()
                    .await
                    .map_err(|error| StorageError::Database(error.to_string()))?;
                return Ok(CommitOutcome::OpReplayed { prior });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO entities
                (wallet_id, entity_type, entity_id, doc_version, server_modified,
                 is_deleted, deleted_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (wallet_id, entity_type, entity_id) DO UPDATE SET
                doc_version = EXCLUDED.doc_version,
                server_modified = EXCLUDED.server_modified,
                is_deleted = EXCLUDED.is_deleted,
                deleted_at = EXCLUDED.deleted_at,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(write.wallet_id.as_str())
        .bind(&write.entity_type)
        .bind(&write.entity_id)
        .bind(doc_version)
        .bind(stamp)
        .bind(write.mark_deleted)
        .bind(deleted_at)
        .bind(sqlx::types::Json(&write.payload))
        .execute(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        if let Some(entry) = ledger {
            if let Some(prior) = insert_ledger(&mut tx, entry).await? {
                tx.rollback()
                    .await
                    .map_err(|error| StorageError::Database(error.to_string()))?;
                return Ok(CommitOutcome::OpReplayed { prior });
            }
        }

        let current = load_row_for_update(&mut tx, wallet_id, entity_type, entity_id).await?;
        let Some(current) = current else {
            tx.rollback()
                .await
                .map_err(|error| StorageError::Database(error.to_string()))?;
            return Ok(CommitOutcome::GuardFailed { current: None });
        };
        if let Some(expected) = expected_version {
            if current.doc_version != expected {
                tx.rollback()
                    .await
                    .map_err(|error| StorageError::Database(error.to_string()))?;
                return Ok(CommitOutcome::GuardFailed {
                    current: Some(current),
                });
            }
        }

        sqlx::query(
            "DELETE FROM entities WHERE wallet_id = $1 AND entity_type = $2 AND entity_id = $3",
        )
        .bind(wallet_id.as_str())
        .bind(entity_type)
        .bind(entity_id)
        .execute(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

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
        let record = sqlx::query_as::<_, LedgerRecord>(
            r#"
            SELECT user_id, device_id, op_id, wallet_id, entity_type, client_id,
                   status, server_modified, result
            FROM sync_ops
            WHERE user_id = $1 AND device_id = $2 AND op_id = $3
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(op_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(record.map(LedgerRecord::into_entry))
    }

    async fn ledger_record(&self, entry: &LedgerEntry) -> Result<LedgerEntry, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        let prior = insert_ledger(&mut tx, entry).await?;
        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(prior.unwrap_or_else(|| entry.clone()))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRecord {
    wallet_id: String,
    entity_type: String,
    entity_id: String,
    doc_version: i64,
    server_modified: i64,
    is_deleted: bool,
    deleted_at: Option<i64>,
    payload: sqlx::types::Json<Map<String, Value>>,
}

impl EntityRecord {
    fn into_row(self) -> EntityRow {
        EntityRow {
            wallet_id: WalletId(self.wallet_id),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            doc_version: self.doc_version,
            server_modified: self.server_modified,
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at,
            payload: self.payload.0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRecord {
    user_id: String,
    device_id: String,
    op_id: String,
    wallet_id: String,
    entity_type: String,
    client_id: String,
    status: String,
    server_modified: Option<i64>,
    result: sqlx::types::Json<Value>,
}

impl LedgerRecord {
    fn into_entry(self) -> LedgerEntry {
        LedgerEntry {
            user_id: self.user_id,
            device_id: self.device_id,
            op_id: self.op_id,
            wallet_id: WalletId(self.wallet_id),
            entity_type: self.entity_type,
            client_id: self.client_id,
            status: self.status,
            server_modified: self.server_modified,
            result: self.result.0,
        }
    }
}
