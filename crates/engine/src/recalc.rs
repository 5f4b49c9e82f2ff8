//! Recalc dispatcher and the derived-aggregate recalculators.
//!
//! Tasks collected across a push batch are dedup-merged, the wallet-wide
//! markers are expanded to concrete targets, and everything runs in
//! dependency order: allocations, account balances, debt remainders,
//! budget spent, goal progress (goals read balances and remainders).
//!
//! Every recalculator is a full recompute over live rows, so reruns and
//! interleaved batches converge to the same values. A write happens only
//! when a derived value actually changed; unchanged aggregates do not burn
//! `doc_version`s or move the pull cursor.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use wallet_sync_core::protocol::parse_timestamp;
use wallet_sync_core::registry::{self, RecalcTask};
use wallet_sync_core::WalletId;
use wallet_sync_storage::{EntityRow, RowWrite, Storage, StorageError, WriteGuard};

use crate::allocation;

pub(crate) async fn run(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    mut tasks: BTreeSet<RecalcTask>,
) -> Result<(), StorageError> {
    if tasks.remove(&RecalcTask::AllBudgets) {
        for row in storage.list_live_rows(wallet_id, registry::BUDGET).await? {
            tasks.insert(RecalcTask::BudgetSpent(row.entity_id));
        }
    }
    if tasks.remove(&RecalcTask::AllGoals) {
        for row in storage.list_live_rows(wallet_id, registry::GOAL).await? {
            tasks.insert(RecalcTask::GoalProgress(row.entity_id));
        }
    }

    // BTreeSet iteration follows the enum's variant order, which is the
    // dependency order.
    for task in tasks {
        match task {
            RecalcTask::TransactionAllocations(tx_id) => {
                allocation::apply(storage, wallet_id, &tx_id).await?;
            }
            RecalcTask::AccountBalance(account_id) => {
                account_balance(storage, wallet_id, &account_id).await?;
            }
            RecalcTask::DebtRemaining(debt_id) => {
                debt_remaining(storage, wallet_id, &debt_id).await?;
            }
            RecalcTask::BudgetSpent(budget_id) => {
                budget_spent(storage, wallet_id, &budget_id).await?;
            }
            RecalcTask::GoalProgress(goal_id) => {
                goal_progress(storage, wallet_id, &goal_id).await?;
            }
            RecalcTask::AllBudgets | RecalcTask::AllGoals => {}
        }
    }
    Ok(())
}

/// Account balance: opening balance plus all live transaction legs.
/// Transfers subtract from the source and add to the destination.
async fn account_balance(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    account_id: &str,
) -> Result<(), StorageError> {
    let Some(row) = storage
        .get_row(wallet_id, registry::ACCOUNT, account_id)
        .await?
    else {
        return Ok(());
    };
    if row.is_deleted {
        return Ok(());
    }

    let transactions = storage
        .list_live_rows(wallet_id, registry::TRANSACTION)
        .await?;
    let mut balance = num(&row.payload, "opening_balance");
    for tx in &transactions {
        let amount = num(&tx.payload, "amount");
        if text(&tx.payload, "account") == Some(account_id) {
            balance += match text(&tx.payload, "transaction_type").unwrap_or("") {
                "income" => amount,
                "expense" | "transfer" => -amount,
                _ => 0.0,
            };
        }
        if text(&tx.payload, "to_account") == Some(account_id) {
            balance += amount;
        }
    }

    write_derived(storage, &row, vec![("current_balance", json!(balance))]).await
}

/// Budget spent: live expense transactions inside the budget window,
/// narrowed by category and currency when the budget declares them.
async fn budget_spent(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    budget_id: &str,
) -> Result<(), StorageError> {
    let Some(row) = storage
        .get_row(wallet_id, registry::BUDGET, budget_id)
        .await?
    else {
        return Ok(());
    };
    if row.is_deleted {
        return Ok(());
    }

    let Some(start) = text(&row.payload, "start_date").and_then(parse_timestamp) else {
        return Ok(());
    };
    let Some(end) = text(&row.payload, "end_date").and_then(parse_timestamp) else {
        return Ok(());
    };
    let category = text(&row.payload, "category");
    let currency = text(&row.payload, "currency");

    let transactions = storage
        .list_live_rows(wallet_id, registry::TRANSACTION)
        .await?;
    let mut spent = 0.0;
    for tx in &transactions {
        if text(&tx.payload, "transaction_type") != Some("expense") {
            continue;
        }
        let Some(at) = text(&tx.payload, "date_time").and_then(parse_timestamp) else {
            continue;
        };
        if at < start || at > end {
            continue;
        }
        if let Some(category) = category {
            if text(&tx.payload, "category") != Some(category) {
                continue;
            }
        }
        if let Some(currency) = currency {
            if text(&tx.payload, "currency") != Some(currency) {
                continue;
            }
        }
        spent += opt_num(&tx.payload, "amount_base").unwrap_or_else(|| num(&tx.payload, "amount"));
    }

    write_derived(storage, &row, vec![("spent_amount", json!(spent))]).await
}

/// Goal progress. `pay_debt` goals track the linked debt's paid-down
/// principal; saving goals track the linked account's balance.
async fn goal_progress(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    goal_id: &str,
) -> Result<(), StorageError> {
    let Some(row) = storage.get_row(wallet_id, registry::GOAL, goal_id).await? else {
        return Ok(());
    };
    if row.is_deleted {
        return Ok(());
    }

    let mut target = opt_num(&row.payload, "target_amount")
        .or_else(|| opt_num(&row.payload, "target_amount_base"))
        .unwrap_or(0.0);
    let mut current = 0.0;

    let goal_type = text(&row.payload, "goal_type").unwrap_or("");
    if goal_type == "pay_debt" {
        let Some(debt_id) = text(&row.payload, "linked_debt") else {
            return Ok(());
        };
        let Some(debt) = storage.get_row(wallet_id, registry::DEBT, debt_id).await? else {
            return Ok(());
        };
        if debt.is_deleted {
            return Ok(());
        }
        if target == 0.0 {
            target = num(&debt.payload, "principal_amount");
        }
        current = (target - num(&debt.payload, "remaining_amount")).max(0.0);
    } else if let Some(account_id) = text(&row.payload, "linked_account") {
        let Some(account) = storage
            .get_row(wallet_id, registry::ACCOUNT, account_id)
            .await?
        else {
            return Ok(());
        };
        if account.is_deleted {
            return Ok(());
        }
        current = num(&account.payload, "current_balance");
    }

    let remaining = (target - current).max(0.0);
    let progress = if target > 0.0 {
        current * 100.0 / target
    } else {
        0.0
    };

    write_derived(
        storage,
        &row,
        vec![
            ("current_amount", json!(current)),
            ("remaining_amount", json!(remaining)),
            ("progress_percent", json!(progress)),
        ],
    )
    .await
}

/// Debt remainder: principal minus paid installments. A debt closes when
/// fully paid and reopens if a paid installment is retracted.
async fn debt_remaining(
    storage: &dyn Storage,
    wallet_id: &WalletId,
    debt_id: &str,
) -> Result<(), StorageError> {
    let Some(row) = storage.get_row(wallet_id, registry::DEBT, debt_id).await? else {
        return Ok(());
    };
    if row.is_deleted {
        return Ok(());
    }

    let installments = storage
        .list_live_rows(wallet_id, registry::DEBT_INSTALLMENT)
        .await?;
    let mut paid = 0.0;
    for installment in &installments {
        if text(&installment.payload, "debt") != Some(debt_id) {
            continue;
        }
        if text(&installment.payload, "status") != Some("paid") {
            continue;
        }
        paid += opt_num(&installment.payload, "paid_amount")
            .unwrap_or_else(|| num(&installment.payload, "amount"));
    }

    let principal = num(&row.payload, "principal_amount");
    let remaining = (principal - paid).max(0.0);

    let mut updates = vec![("remaining_amount", json!(remaining))];
    if remaining <= f64::EPSILON {
        updates.push(("status", json!("closed")));
    } else if text(&row.payload, "status") == Some("closed") {
        updates.push(("status", json!("active")));
    }

    write_derived(storage, &row, updates).await
}

/// Write derived fields back through a forced commit, but only when a
/// value actually changed. Recalc writes are ordinary mutations: they bump
/// `doc_version`, take a fresh `server_modified`, and flow out via pull.
async fn write_derived(
    storage: &dyn Storage,
    row: &EntityRow,
    updates: Vec<(&str, Value)>,
) -> Result<(), StorageError> {
    let mut payload = row.payload.clone();
    let mut changed = false;
    for (key, value) in updates {
        if !values_equal(payload.get(key), &value) {
            payload.insert(key.to_owned(), value);
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }

    let outcome = storage
        .commit_row(
            RowWrite {
                wallet_id: row.wallet_id.clone(),
                entity_type: row.entity_type.clone(),
                entity_id: row.entity_id.clone(),
                payload,
                guard: WriteGuard::Force,
                mark_deleted: false,
            },
            None,
        )
        .await?;
    tracing::debug!(
        entity_type = %row.entity_type,
        entity_id = %row.entity_id,
        outcome = ?outcome,
        "derived fields recomputed"
    );
    Ok(())
}

fn values_equal(current: Option<&Value>, next: &Value) -> bool {
    match (current, next) {
        (Some(Value::Number(a)), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-9,
            _ => a == b,
        },
        (Some(current), next) => current == next,
        (None, _) => false,
    }
}

pub(crate) fn num(payload: &Map<String, Value>, key: &str) -> f64 {
    payload.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

pub(crate) fn opt_num(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

pub(crate) fn text<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
