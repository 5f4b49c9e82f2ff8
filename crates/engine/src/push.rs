//! Push orchestrator and version controller.
//!
//! Each item runs the same pipeline: ledger lookup (idempotent replay),
//! validation and payload normalization, optimistic version control against
//! the stored row, guarded commit with the ledger entry riding in the same
//! transaction, and recalc task collection. Item `i` failing never affects
//! items before or after it.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde_json::{json, Map, Value};

use wallet_sync_core::protocol::{
    format_micros, now_micros, ErrorCode, ItemAck, ItemConflict, ItemError, ItemResult, Operation,
    PushItem, PushMessage,
};
use wallet_sync_core::registry::{
    self, normalize_payload, EntityDescriptor, RecalcContext, RecalcTask,
};
use wallet_sync_core::validation::{validate_client_id, MAX_PUSH_ITEMS};
use wallet_sync_core::WalletId;
use wallet_sync_storage::{
    CommitOutcome, EntityRow, LedgerEntry, RowWrite, StorageError, WriteGuard,
};

use crate::recalc;
use crate::scope::{resolve_scope, Scope, WalletRole};
use crate::{Identity, RequestError, SyncEngine};

pub(crate) async fn push(
    engine: &SyncEngine,
    identity: &Identity,
    wallet_id: &str,
    items: &[PushItem],
) -> Result<PushMessage, RequestError> {
    let wallet_id: WalletId = wallet_id
        .parse()
        .map_err(|_| RequestError::InvalidWalletId)?;

    if items.is_empty() {
        return Err(RequestError::ItemsInvalid);
    }
    if items.len() > MAX_PUSH_ITEMS {
        return Err(RequestError::TooManyItems);
    }

    // Pre-scan: an unknown entity_type anywhere rejects the whole batch.
    // Absent entity_type stays an item-level error.
    for item in items {
        if let Some(entity_type) = item.entity_type.as_deref() {
            if !entity_type.is_empty() && registry::lookup(entity_type).is_none() {
                return Err(RequestError::UnsupportedEntityType);
            }
        }
    }

    let bootstrap_only = items
        .iter()
        .all(|item| item.entity_type.as_deref() == Some(registry::WALLET));
    let scope = resolve_scope(engine.storage(), identity, &wallet_id, bootstrap_only).await?;

    if scope.role == Some(WalletRole::Viewer) {
        return Err(RequestError::WalletReadOnly);
    }

    let mut results = Vec::with_capacity(items.len());
    let mut tasks: BTreeSet<RecalcTask> = BTreeSet::new();

    for item in items {
        match apply_item(engine, &scope, item, &mut tasks).await {
            Ok(value) => results.push(value),
            Err(error) => {
                tracing::error!(error = %error, wallet = %scope.wallet_id, "push item failed");
                results.push(storage_failure_result(engine, &scope, item, &error).await);
            }
        }
    }

    if let Err(error) = recalc::run(engine.storage(), &scope.wallet_id, tasks).await {
        // Accepted items already stand; a full recompute on the next batch
        // heals any aggregate this pass missed.
        tracing::error!(error = %error, wallet = %scope.wallet_id, "recalc pass failed");
    }

    Ok(PushMessage {
        results,
        server_time: format_micros(now_micros()),
    })
}

/// Validation context extracted from one push item.
struct ItemPlan<'a> {
    op_id: String,
    desc: &'static EntityDescriptor,
    operation: Operation,
    entity_id: &'a str,
    base_version: i64,
    normalized: Map<String, Value>,
}

async fn apply_item(
    engine: &SyncEngine,
    scope: &Scope,
    item: &PushItem,
    tasks: &mut BTreeSet<RecalcTask>,
) -> Result<Value, StorageError> {
    let Some(op_id) = item
        .op_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        // Without an op_id there is no idempotency key to record under.
        return Ok(error_value(None, item, ErrorCode::OpIdRequired, None));
    };

    // Idempotency: lookup runs before any validation or mutation.
    if let Some(prior) = engine
        .storage()
        .ledger_lookup(&scope.user_id, &scope.device_id, op_id)
        .await?
    {
        return Ok(replayed(prior.result));
    }

    let plan = match validate_item(scope, op_id, item) {
        Ok(plan) => plan,
        Err(error) => {
            let value = error_value(Some(op_id), item, error.code, error.detail);
            record_terminal(engine, scope, op_id, item, "error", &value).await?;
            return Ok(value);
        }
    };

    let existing = engine
        .storage()
        .get_row(&scope.wallet_id, plan.desc.entity_type, plan.entity_id)
        .await?;

    // Wallet-scoped mutations need member role; only the wallet-bootstrap
    // create is exempt.
    let is_bootstrap = plan.desc.entity_type == registry::WALLET
        && plan.operation == Operation::Create;
    if scope.role.is_none() && !is_bootstrap {
        let value = error_value(Some(op_id), item, ErrorCode::WalletAccessDenied, None);
        record_terminal(engine, scope, op_id, item, "error", &value).await?;
        return Ok(value);
    }

    match plan.operation {
        Operation::Create => apply_create(engine, scope, item, plan, existing, tasks).await,
        Operation::Update => apply_update(engine, scope, item, plan, existing, tasks).await,
        Operation::Delete => apply_delete(engine, scope, item, plan, existing, tasks).await,
    }
}

async fn apply_create(
    engine: &SyncEngine,
    scope: &Scope,
    item: &PushItem,
    plan: ItemPlan<'_>,
    existing: Option<EntityRow>,
    tasks: &mut BTreeSet<RecalcTask>,
) -> Result<Value, StorageError> {
    if let Some(row) = existing {
        // Same client_id created twice (e.g. two devices seeding the same
        // bootstrap data): acknowledge with the existing version, no write.
        let value = duplicate_value(&plan, &row);
        record_terminal(engine, scope, &plan.op_id, item, "duplicate", &value).await?;
        return Ok(value);
    }

    let mut payload = plan.normalized.clone();
    enrich_payload(plan.desc, Operation::Create, &mut payload);

    let ack = ack_template(&plan, 1);
    let ledger = ledger_entry(scope, &plan, "accepted", &ack);
    let outcome = engine
        .storage()
        .commit_row(
            RowWrite {
                wallet_id: scope.wallet_id.clone(),
                entity_type: plan.desc.entity_type.to_owned(),
                entity_id: plan.entity_id.to_owned(),
                payload: payload.clone(),
                guard: WriteGuard::MustCreate,
                mark_deleted: false,
            },
            Some(&ledger),
        )
        .await?;

    match outcome {
        CommitOutcome::Applied {
            doc_version,
            server_modified,
            ..
        } => {
            collect_tasks(tasks, &plan, &payload, None);
            if plan.desc.entity_type == registry::WALLET {
                ensure_owner_membership(engine, scope).await?;
            }
            Ok(accepted_value(&plan, doc_version, server_modified))
        }
        CommitOutcome::GuardFailed { current: Some(row) } => {
            let value = duplicate_value(&plan, &row);
            record_terminal(engine, scope, &plan.op_id, item, "duplicate", &value).await?;
            Ok(value)
        }
        CommitOutcome::GuardFailed { current: None } => {
            Err(StorageError::Database("create guard failed without row".to_owned()))
        }
        CommitOutcome::OpReplayed { prior } => Ok(replayed(prior.result)),
    }
}

async fn apply_update(
    engine: &SyncEngine,
    scope: &Scope,
    item: &PushItem,
    plan: ItemPlan<'_>,
    existing: Option<EntityRow>,
    tasks: &mut BTreeSet<RecalcTask>,
) -> Result<Value, StorageError> {
    let Some(row) = existing else {
        let value = error_value(Some(plan.op_id.as_str()), item, ErrorCode::NotFound, None);
        record_terminal(engine, scope, &plan.op_id, item, "error", &value).await?;
        return Ok(value);
    };
    // Deletion is terminal: tombstones are never resurrected through sync.
    if row.is_deleted {
        let value = error_value(Some(plan.op_id.as_str()), item, ErrorCode::NotFound, None);
        record_terminal(engine, scope, &plan.op_id, item, "error", &value).await?;
        return Ok(value);
    }
    if plan.base_version != row.doc_version {
        return conflict(engine, scope, item, &plan, &row).await;
    }

    // Partial update: absent fields keep their stored values.
    let mut payload = row.payload.clone();
    for (key, value) in &plan.normalized {
        payload.insert(key.clone(), value.clone());
    }
    enrich_payload(plan.desc, Operation::Update, &mut payload);

    let ack = ack_template(&plan, row.doc_version + 1);
    let ledger = ledger_entry(scope, &plan, "accepted", &ack);
    let outcome = engine
        .storage()
        .commit_row(
            RowWrite {
                wallet_id: scope.wallet_id.clone(),
                entity_type: plan.desc.entity_type.to_owned(),
                entity_id: plan.entity_id.to_owned(),
                payload: payload.clone(),
                guard: WriteGuard::MatchVersion(plan.base_version),
                mark_deleted: false,
            },
            Some(&ledger),
        )
        .await?;

    match outcome {
        CommitOutcome::Applied {
            doc_version,
            server_modified,
            ..
        } => {
            collect_tasks(tasks, &plan, &payload, Some(&row.payload));
            Ok(accepted_value(&plan, doc_version, server_modified))
        }
        CommitOutcome::GuardFailed { current: Some(raced) } => {
            conflict(engine, scope, item, &plan, &raced).await
        }
        CommitOutcome::GuardFailed { current: None } => {
            let value = error_value(Some(plan.op_id.as_str()), item, ErrorCode::NotFound, None);
            record_terminal(engine, scope, &plan.op_id, item, "error", &value).await?;
            Ok(value)
        }
        CommitOutcome::OpReplayed { prior } => Ok(replayed(prior.result)),
    }
}

async fn apply_delete(
    engine: &SyncEngine,
    scope: &Scope,
    item: &PushItem,
    plan: ItemPlan<'_>,
    existing: Option<EntityRow>,
    tasks: &mut BTreeSet<RecalcTask>,
) -> Result<Value, StorageError> {
    let Some(row) = existing else {
        let value = error_value(Some(plan.op_id.as_str()), item, ErrorCode::NotFound, None);
        record_terminal(engine, scope, &plan.op_id, item, "error", &value).await?;
        return Ok(value);
    };

    if plan.desc.soft_delete && row.is_deleted {
        // Re-deleting a tombstone at the right version is a no-op ack.
        if plan.base_version == row.doc_version {
            let value = duplicate_value(&plan, &row);
            record_terminal(engine, scope, &plan.op_id, item, "duplicate", &value).await?;
            return Ok(value);
        }
        return conflict(engine, scope, item, &plan, &row).await;
    }
    if plan.base_version != row.doc_version {
        return conflict(engine, scope, item, &plan, &row).await;
    }

    if !plan.desc.soft_delete {
        // Hard delete: the row vanishes; the ack carries pre-delete values.
        let ack = ItemResult::Accepted(ItemAck {
            op_id: Some(plan.op_id.clone()),
            entity_type: plan.desc.entity_type.to_owned(),
            entity_id: plan.entity_id.to_owned(),
            client_id: plan.entity_id.to_owned(),
            doc_version: row.doc_version,
            server_modified: format_micros(row.server_modified),
        });
        let value = result_value(&ack);
        let ledger = ledger_entry(scope, &plan, "accepted", &value);
        let outcome = engine
            .storage()
            .remove_row(
                &scope.wallet_id,
                plan.desc.entity_type,
                plan.entity_id,
                Some(plan.base_version),
                Some(&ledger),
            )
            .await?;
        return match outcome {
            CommitOutcome::Applied { .. } => Ok(value),
            CommitOutcome::GuardFailed { current: Some(raced) } => {
                conflict(engine, scope, item, &plan, &raced).await
            }
            CommitOutcome::GuardFailed { current: None } => {
                let value = error_value(Some(plan.op_id.as_str()), item, ErrorCode::NotFound, None);
                record_terminal(engine, scope, &plan.op_id, item, "error", &value).await?;
                Ok(value)
            }
            CommitOutcome::OpReplayed { prior } => Ok(replayed(prior.result)),
        };
    }

    let mut payload = row.payload.clone();
    for (key, value) in &plan.normalized {
        payload.insert(key.clone(), value.clone());
    }

    let ack = ack_template(&plan, row.doc_version + 1);
    let ledger = ledger_entry(scope, &plan, "accepted", &ack);
    let outcome = engine
        .storage()
        .commit_row(
            RowWrite {
                wallet_id: scope.wallet_id.clone(),
                entity_type: plan.desc.entity_type.to_owned(),
                entity_id: plan.entity_id.to_owned(),
                payload: payload.clone(),
                guard: WriteGuard::MatchVersion(plan.base_version),
                mark_deleted: true,
            },
            Some(&ledger),
        )
        .await?;

    match outcome {
        CommitOutcome::Applied {
            doc_version,
            server_modified,
            ..
        } => {
            collect_tasks(tasks, &plan, &payload, Some(&row.payload));
            Ok(accepted_value(&plan, doc_version, server_modified))
        }
        CommitOutcome::GuardFailed { current: Some(raced) } => {
            conflict(engine, scope, item, &plan, &raced).await
        }
        CommitOutcome::GuardFailed { current: None } => {
            let value = error_value(Some(plan.op_id.as_str()), item, ErrorCode::NotFound, None);
            record_terminal(engine, scope, &plan.op_id, item, "error", &value).await?;
            Ok(value)
        }
        CommitOutcome::OpReplayed { prior } => Ok(replayed(prior.result)),
    }
}

struct ItemValidationError {
    code: ErrorCode,
    detail: Option<Value>,
}

impl From<ErrorCode> for ItemValidationError {
    fn from(code: ErrorCode) -> Self {
        Self { code, detail: None }
    }
}

fn validate_item<'a>(
    scope: &Scope,
    op_id: &str,
    item: &'a PushItem,
) -> Result<ItemPlan<'a>, ItemValidationError> {
    let entity_type = item
        .entity_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(ErrorCode::EntityTypeRequired)?;
    let desc = registry::lookup(entity_type).ok_or(ErrorCode::UnsupportedEntityType)?;

    let operation = item
        .operation
        .as_deref()
        .and_then(|raw| Operation::from_str(raw).ok())
        .ok_or(ErrorCode::InvalidOperation)?;

    let entity_id = item
        .entity_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(ErrorCode::EntityIdRequired)?;

    let empty = Map::new();
    let payload = match &item.payload {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ErrorCode::PayloadMustBeObject.into()),
    };

    if let Some(client_id) = payload.get("client_id").and_then(Value::as_str) {
        if !client_id.is_empty() && client_id != entity_id {
            return Err(ErrorCode::EntityIdMismatch.into());
        }
    }
    validate_client_id(entity_id).map_err(|_| ErrorCode::InvalidClientId)?;

    let base_version = parse_base_version(operation, item.base_version.as_ref())?;

    if desc.entity_type == registry::WALLET
        && operation == Operation::Create
        && entity_id != scope.wallet_id.as_str()
    {
        return Err(ErrorCode::WalletIdMustEqualClientId.into());
    }

    let normalized = normalize_payload(desc, operation, entity_id, payload, scope.wallet_id.as_str())
        .map_err(|error| ItemValidationError {
            code: error.code,
            detail: error.detail,
        })?;

    Ok(ItemPlan {
        op_id: op_id.to_owned(),
        desc,
        operation,
        entity_id,
        base_version,
        normalized,
    })
}

fn parse_base_version(
    operation: Operation,
    raw: Option<&Value>,
) -> Result<i64, ItemValidationError> {
    match operation {
        Operation::Create => match raw {
            None | Some(Value::Null) => Ok(0),
            Some(value) => match value_as_version(value) {
                Some(0) => Ok(0),
                _ => Err(ErrorCode::BaseVersionInvalid.into()),
            },
        },
        Operation::Update | Operation::Delete => match raw {
            None | Some(Value::Null) => Err(ErrorCode::BaseVersionRequired.into()),
            Some(value) => {
                value_as_version(value).ok_or_else(|| ErrorCode::BaseVersionInvalid.into())
            }
        },
    }
}

fn value_as_version(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return (n >= 0).then_some(n);
    }
    let f = value.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= i64::MAX as f64).then_some(f as i64)
}

/// Server-owned create-time seeds and base-amount fallbacks.
fn enrich_payload(desc: &EntityDescriptor, operation: Operation, payload: &mut Map<String, Value>) {
    match desc.entity_type {
        registry::ACCOUNT if operation == Operation::Create => {
            let opening = payload
                .get("opening_balance")
                .filter(|v| v.is_number())
                .cloned()
                .unwrap_or_else(|| json!(0.0));
            payload.insert("current_balance".to_owned(), opening);
        }
        registry::BUDGET => {
            if payload.get("amount").is_none_or(Value::is_null) {
                if let Some(base) = payload.get("amount_base").filter(|v| v.is_number()).cloned() {
                    payload.insert("amount".to_owned(), base);
                }
            }
        }
        registry::GOAL => {
            if payload.get("target_amount").is_none_or(Value::is_null) {
                if let Some(base) = payload
                    .get("target_amount_base")
                    .filter(|v| v.is_number())
                    .cloned()
                {
                    payload.insert("target_amount".to_owned(), base);
                }
            }
        }
        _ => {}
    }
}

fn collect_tasks(
    tasks: &mut BTreeSet<RecalcTask>,
    plan: &ItemPlan<'_>,
    payload: &Map<String, Value>,
    previous: Option<&Map<String, Value>>,
) {
    let ctx = RecalcContext {
        operation: plan.operation,
        entity_id: plan.entity_id,
        payload,
        previous,
    };
    tasks.extend((plan.desc.recalc)(&ctx));
}

/// An accepted wallet create also seeds the owner membership row so the
/// wallet is usable without a second round trip.
async fn ensure_owner_membership(engine: &SyncEngine, scope: &Scope) -> Result<(), StorageError> {
    let members = engine
        .storage()
        .list_live_rows(&scope.wallet_id, registry::WALLET_MEMBER)
        .await?;
    let already = members.iter().any(|row| {
        row.payload.get("user").and_then(Value::as_str) == Some(scope.user_id.as_str())
    });
    if already {
        return Ok(());
    }

    let member_id = format!("{}:{}", scope.wallet_id, scope.user_id);
    let payload = json!({
        "client_id": member_id,
        "wallet_id": scope.wallet_id.as_str(),
        "wallet": scope.wallet_id.as_str(),
        "user": scope.user_id,
        "role": "owner",
        "status": "active",
    });
    let Value::Object(payload) = payload else {
        return Ok(());
    };
    let outcome = engine
        .storage()
        .commit_row(
            RowWrite {
                wallet_id: scope.wallet_id.clone(),
                entity_type: registry::WALLET_MEMBER.to_owned(),
                entity_id: member_id,
                payload,
                guard: WriteGuard::MustCreate,
                mark_deleted: false,
            },
            None,
        )
        .await?;
    if !matches!(outcome, CommitOutcome::Applied { .. }) {
        tracing::debug!(wallet = %scope.wallet_id, "owner membership already present");
    }
    Ok(())
}

async fn conflict(
    engine: &SyncEngine,
    scope: &Scope,
    item: &PushItem,
    plan: &ItemPlan<'_>,
    row: &EntityRow,
) -> Result<Value, StorageError> {
    let value = result_value(&ItemResult::Conflict(ItemConflict {
        op_id: Some(plan.op_id.clone()),
        entity_type: plan.desc.entity_type.to_owned(),
        entity_id: plan.entity_id.to_owned(),
        client_id: plan.entity_id.to_owned(),
        doc_version: row.doc_version,
        server_modified: format_micros(row.server_modified),
        client_base_version: plan.base_version,
        server_doc_version: row.doc_version,
        server_record: server_record(row),
    }));
    record_terminal(engine, scope, &plan.op_id, item, "conflict", &value).await?;
    Ok(value)
}

/// Authoritative snapshot shipped inside a conflict: the payload plus the
/// row's sync metadata, including its own `doc_version` for clients that
/// read `server_record.doc_version`.
fn server_record(row: &EntityRow) -> Value {
    let mut record = row.payload.clone();
    record.insert("client_id".to_owned(), Value::String(row.entity_id.clone()));
    record.insert("doc_version".to_owned(), json!(row.doc_version));
    record.insert(
        "server_modified".to_owned(),
        Value::String(format_micros(row.server_modified)),
    );
    record.insert("is_deleted".to_owned(), json!(i64::from(row.is_deleted)));
    record.insert(
        "deleted_at".to_owned(),
        row.deleted_at
            .map_or(Value::Null, |at| Value::String(format_micros(at))),
    );
    Value::Object(record)
}

fn ack_template(plan: &ItemPlan<'_>, doc_version: i64) -> Value {
    // server_modified is stamped by storage inside the commit transaction.
    result_value(&ItemResult::Accepted(ItemAck {
        op_id: Some(plan.op_id.clone()),
        entity_type: plan.desc.entity_type.to_owned(),
        entity_id: plan.entity_id.to_owned(),
        client_id: plan.entity_id.to_owned(),
        doc_version,
        server_modified: String::new(),
    }))
}

fn accepted_value(plan: &ItemPlan<'_>, doc_version: i64, server_modified: i64) -> Value {
    result_value(&ItemResult::Accepted(ItemAck {
        op_id: Some(plan.op_id.clone()),
        entity_type: plan.desc.entity_type.to_owned(),
        entity_id: plan.entity_id.to_owned(),
        client_id: plan.entity_id.to_owned(),
        doc_version,
        server_modified: format_micros(server_modified),
    }))
}

fn duplicate_value(plan: &ItemPlan<'_>, row: &EntityRow) -> Value {
    result_value(&ItemResult::Duplicate(ItemAck {
        op_id: Some(plan.op_id.clone()),
        entity_type: plan.desc.entity_type.to_owned(),
        entity_id: plan.entity_id.to_owned(),
        client_id: plan.entity_id.to_owned(),
        doc_version: row.doc_version,
        server_modified: format_micros(row.server_modified),
    }))
}

fn error_value(
    op_id: Option<&str>,
    item: &PushItem,
    code: ErrorCode,
    detail: Option<Value>,
) -> Value {
    let client_id = item
        .payload
        .as_ref()
        .and_then(|p| p.get("client_id"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| item.entity_id.clone());
    result_value(&ItemResult::Error(ItemError {
        op_id: op_id.map(ToOwned::to_owned),
        entity_type: item.entity_type.clone(),
        client_id,
        error: code.as_str().to_owned(),
        error_code: code.as_str().to_owned(),
        error_message: code.message().to_owned(),
        detail,
    }))
}

fn result_value(result: &ItemResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

fn replayed(mut result: Value) -> Value {
    if let Value::Object(map) = &mut result {
        map.insert("already_applied".to_owned(), Value::Bool(true));
    }
    result
}

fn ledger_entry(scope: &Scope, plan: &ItemPlan<'_>, status: &str, result: &Value) -> LedgerEntry {
    LedgerEntry {
        user_id: scope.user_id.clone(),
        device_id: scope.device_id.clone(),
        op_id: plan.op_id.clone(),
        wallet_id: scope.wallet_id.clone(),
        entity_type: plan.desc.entity_type.to_owned(),
        client_id: plan.entity_id.to_owned(),
        status: status.to_owned(),
        server_modified: None,
        result: result.clone(),
    }
}

/// Record a terminal non-commit outcome (error, conflict, duplicate) so
/// replays of the same op return the same result.
async fn record_terminal(
    engine: &SyncEngine,
    scope: &Scope,
    op_id: &str,
    item: &PushItem,
    status: &str,
    result: &Value,
) -> Result<(), StorageError> {
    let entry = LedgerEntry {
        user_id: scope.user_id.clone(),
        device_id: scope.device_id.clone(),
        op_id: op_id.to_owned(),
        wallet_id: scope.wallet_id.clone(),
        entity_type: item.entity_type.clone().unwrap_or_default(),
        client_id: item.entity_id.clone().unwrap_or_default(),
        status: status.to_owned(),
        server_modified: None,
        result: result.clone(),
    };
    engine.storage().ledger_record(&entry).await?;
    Ok(())
}

/// A storage failure mid-item is reported as a terminal rejection; the
/// client must mint a new op_id to retry.
async fn storage_failure_result(
    engine: &SyncEngine,
    scope: &Scope,
    item: &PushItem,
    error: &StorageError,
) -> Value {
    let value = error_value(
        item.op_id.as_deref(),
        item,
        ErrorCode::Rejected,
        Some(json!(error.to_string())),
    );
    if let Some(op_id) = item.op_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if let Err(record_error) = record_terminal(engine, scope, op_id, item, "error", &value).await
        {
            tracing::error!(error = %record_error, "failed to record rejected item");
        }
    }
    value
}
