//! Bucket allocation engine.
//!
//! Income transactions are split into bucket allocations driven by rules.
//! Rule priority: by-account, then by-income-category, then the global
//! default; ties go to the most recently modified rule. Auto-generated
//! allocation rows (`{tx}:{bucket}` ids) are hard-deleted and recreated on
//! every pass; manual allocations are never touched, and their presence
//! disables auto-allocation for that transaction entirely.

use std::cmp::Reverse;

use serde_json::{json, Value};

use wallet_sync_core::registry;
use wallet_sync_core::WalletId;
use wallet_sync_storage::{EntityRow, RowWrite, Storage, StorageError, WriteGuard};

use crate::recalc::{num, text};

pub(crate) async fn apply(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    tx_id: &str,
) -> Result<(), StorageError> {
    let allocations = storage
        .list_live_rows(wallet_id, registry::TRANSACTION_ALLOCATION)
        .await?;
    let for_tx: Vec<&EntityRow> = allocations
        .iter()
        .filter(|row| text(&row.payload, "transaction") == Some(tx_id))
        .collect();

    let tx = storage
        .get_row(wallet_id, registry::TRANSACTION, tx_id)
        .await?;
    let tx = match tx {
        Some(row) if !row.is_deleted => row,
        _ => {
            // Transaction gone: every allocation row hanging off it goes too.
            for row in &for_tx {
                remove_allocation(storage, row).await?;
            }
            return Ok(());
        }
    };

    if text(&tx.payload, "transaction_type") != Some("income") {
        for row in &for_tx {
            if !is_manual(row) {
                remove_allocation(storage, row).await?;
            }
        }
        return Ok(());
    }

    if for_tx.iter().any(|row| is_manual(row)) {
        return Ok(());
    }

    let generated = generate(storage, wallet_id, &tx).await?;

    for row in &for_tx {
        remove_allocation(storage, row).await?;
    }

    for line in generated {
        let entity_id = format!("{}:{}", tx_id, line.bucket);
        let payload = json!({
            "client_id": entity_id,
            "wallet_id": wallet_id.as_str(),
            "transaction": tx_id,
            "bucket": line.bucket,
            "percent": line.percent,
            "amount": line.amount,
            "currency": line.currency,
            "amount_base": line.amount,
            "rule_used": line.rule_used,
            "is_manual_override": 0,
        });
        let Value::Object(payload) = payload else {
            continue;
        };
        storage
            .commit_row(
                RowWrite {
                    wallet_id: wallet_id.to_owned(),
                    entity_type: registry::TRANSACTION_ALLOCATION.to_owned(),
                    entity_id,
                    payload,
                    guard: WriteGuard::Force,
                    mark_deleted: false,
                },
                None,
            )
            .await?;
    }
    Ok(())
}

struct AllocationLine {
    bucket: String,
    percent: i64,
    amount: f64,
    currency: String,
    rule_used: String,
}

async fn generate(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    tx: &EntityRow,
) -> Result<Vec<AllocationLine>, StorageError> {
    let Some(rule) = resolve_rule(storage, wallet_id, tx).await? else {
        return Ok(Vec::new());
    };

    let mut lines: Vec<EntityRow> = storage
        .list_live_rows(wallet_id, registry::ALLOCATION_RULE_LINE)
        .await?
        .into_iter()
        .filter(|row| text(&row.payload, "rule") == Some(rule.entity_id.as_str()))
        .collect();
    lines.sort_by_key(|row| {
        (
            num(&row.payload, "sort_order") as i64,
            Reverse(row.server_modified),
            Reverse(row.doc_version),
        )
    });

    let tx_amount = round2(num(&tx.payload, "amount"));
    let currency = text(&tx.payload, "currency").unwrap_or("").to_owned();

    let mut generated = Vec::new();
    for line in &lines {
        let percent = num(&line.payload, "percent") as i64;
        if percent <= 0 {
            continue;
        }
        let Some(bucket) = text(&line.payload, "bucket") else {
            continue;
        };
        generated.push(AllocationLine {
            bucket: bucket.to_owned(),
            percent,
            amount: round2(tx_amount * (percent as f64) / 100.0),
            currency: currency.clone(),
            rule_used: rule.entity_id.clone(),
        });
    }

    reconcile(&mut generated, tx_amount);
    Ok(generated)
}

/// Rounding remainders go to the line with the highest percent (then the
/// highest amount), so allocations always sum to the transaction amount.
fn reconcile(lines: &mut [AllocationLine], total: f64) {
    if lines.is_empty() {
        return;
    }
    let allocated: f64 = lines.iter().map(|line| round2(line.amount)).sum();
    let remainder = round2(total - allocated);
    if remainder.abs() < 1e-9 {
        return;
    }
    let target = lines.iter_mut().max_by(|a, b| {
        (a.percent, a.amount)
            .partial_cmp(&(b.percent, b.amount))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(target) = target {
        target.amount = round2(target.amount + remainder);
    }
}

async fn resolve_rule(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    tx: &EntityRow,
) -> Result<Option<EntityRow>, StorageError> {
    let rules: Vec<EntityRow> = storage
        .list_live_rows(wallet_id, registry::ALLOCATION_RULE)
        .await?
        .into_iter()
        .filter(|row| is_truthy(row.payload.get("active")))
        .collect();

    let newest = |pred: &dyn Fn(&&EntityRow) -> bool| {
        rules
            .iter()
            .filter(pred)
            .max_by_key(|row| (row.server_modified, row.doc_version))
            .cloned()
    };

    if let Some(account) = text(&tx.payload, "account") {
        let matched = newest(&|row: &&EntityRow| {
            text(&row.payload, "scope_type") == Some("by_account")
                && text(&row.payload, "scope_ref") == Some(account)
        });
        if matched.is_some() {
            return Ok(matched);
        }
    }

    if let Some(category) = text(&tx.payload, "category") {
        let matched = newest(&|row: &&EntityRow| {
            text(&row.payload, "scope_type") == Some("by_income_category")
                && text(&row.payload, "scope_ref") == Some(category)
        });
        if matched.is_some() {
            return Ok(matched);
        }
    }

    Ok(newest(&|row: &&EntityRow| {
        text(&row.payload, "scope_type") == Some("global")
            && is_truthy(row.payload.get("is_default"))
    }))
}

async fn remove_allocation(storage: &dyn Storage, row: &EntityRow) -> Result<(), StorageError> {
    storage
        .remove_row(
            &row.wallet_id,
            &row.entity_type,
            &row.entity_id,
            None,
            None,
        )
        .await?;
    Ok(())
}

fn is_manual(row: &EntityRow) -> bool {
    is_truthy(row.payload.get("is_manual_override")) || row.entity_id.ends_with(":manual")
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
