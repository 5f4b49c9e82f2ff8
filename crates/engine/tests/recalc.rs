//! Derived-aggregate behavior: balances, budgets, goals, debts, and bucket
//! allocations recomputed after accepted mutations.

mod common;

use std::collections::BTreeMap;

use common::*;
use serde_json::{json, Value};
use wallet_sync_core::protocol::PushItem;
use wallet_sync_engine::{Identity, SyncEngine};

const WALLET: &str = "wal-1";

async fn setup(engine: &SyncEngine, identity: &Identity) {
    setup_wallet(engine, identity, WALLET).await;
}

fn income(op_id: &str, tx_id: &str, account: &str, amount: f64) -> PushItem {
    tx_create(
        op_id,
        tx_id,
        json!({
            "client_id": tx_id,
            "transaction_type": "income",
            "date_time": "2024-01-10T10:00:00Z",
            "amount": amount,
            "currency": "SAR",
            "account": account,
        }),
    )
}

fn expense(op_id: &str, tx_id: &str, account: &str, amount: f64, extra: Value) -> PushItem {
    let mut payload = json!({
        "client_id": tx_id,
        "transaction_type": "expense",
        "date_time": "2024-01-10T10:00:00Z",
        "amount": amount,
        "currency": "SAR",
        "account": account,
    });
    if let (Value::Object(payload), Value::Object(extra)) = (&mut payload, extra) {
        payload.extend(extra);
    }
    tx_create(op_id, tx_id, payload)
}

async fn balance_of(engine: &SyncEngine, identity: &Identity, account: &str) -> f64 {
    fetch_payload(engine, identity, WALLET, "Account", account)
        .await
        .get("current_balance")
        .and_then(Value::as_f64)
        .unwrap_or(f64::NAN)
}

async fn allocations_for(engine: &SyncEngine, identity: &Identity, tx_id: &str) -> Vec<Value> {
    pull_all(engine, identity, WALLET)
        .await
        .items
        .into_iter()
        .filter(|item| {
            item.entity_type == "TransactionAllocation"
                && item.payload["transaction"] == tx_id
                && item.is_deleted == 0
        })
        .map(|item| item.payload)
        .collect()
}

#[tokio::test]
async fn account_balance_respects_transfer_legs() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            account_create("o-b", "acc-b", "Savings"),
            income("o-t1", "tx-1", "acc-a", 100.0),
            expense("o-t2", "tx-2", "acc-a", 30.0, json!({})),
            tx_create(
                "o-t3",
                "tx-3",
                json!({
                    "client_id": "tx-3",
                    "transaction_type": "transfer",
                    "date_time": "2024-01-11T10:00:00Z",
                    "amount": 20.0,
                    "currency": "SAR",
                    "account": "acc-a",
                    "to_account": "acc-b",
                }),
            ),
        ],
    )
    .await;

    assert_eq!(balance_of(&engine, &identity, "acc-a").await, 50.0);
    assert_eq!(balance_of(&engine, &identity, "acc-b").await, 20.0);
}

#[tokio::test]
async fn moving_a_transaction_rebalances_both_accounts() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            account_create("o-b", "acc-b", "Savings"),
            income("o-t1", "tx-1", "acc-a", 100.0),
        ],
    )
    .await;
    assert_eq!(balance_of(&engine, &identity, "acc-a").await, 100.0);

    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o-move",
            "Transaction",
            "tx-1",
            "update",
            Some(1),
            json!({"client_id": "tx-1", "account": "acc-b"}),
        ),
    )
    .await;

    assert_eq!(balance_of(&engine, &identity, "acc-a").await, 0.0);
    assert_eq!(balance_of(&engine, &identity, "acc-b").await, 100.0);
}

#[tokio::test]
async fn deleted_transactions_leave_the_balance() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            income("o-t1", "tx-1", "acc-a", 100.0),
        ],
    )
    .await;
    assert_eq!(balance_of(&engine, &identity, "acc-a").await, 100.0);

    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o-del",
            "Transaction",
            "tx-1",
            "delete",
            Some(1),
            json!({"client_id": "tx-1"}),
        ),
    )
    .await;

    assert_eq!(balance_of(&engine, &identity, "acc-a").await, 0.0);
}

#[tokio::test]
async fn opening_balance_seeds_current_balance() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o1",
            "Account",
            "acc-1",
            "create",
            Some(0),
            json!({"client_id": "acc-1", "name": "Cash", "currency": "SAR", "opening_balance": 25.0}),
        ),
    )
    .await;

    assert_eq!(balance_of(&engine, &identity, "acc-1").await, 25.0);
}

#[tokio::test]
async fn budget_spent_filters_window_and_category() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            item(
                "o-budget",
                "Budget",
                "bud-1",
                "create",
                Some(0),
                json!({
                    "client_id": "bud-1",
                    "name": "Groceries",
                    "period": "monthly",
                    "scope_type": "category",
                    "category": "cat-food",
                    "amount": 500.0,
                    "start_date": "2024-01-01",
                    "end_date": "2024-01-31",
                }),
            ),
            expense("o-t1", "tx-1", "acc-a", 50.0, json!({"category": "cat-food"})),
            expense("o-t2", "tx-2", "acc-a", 30.0, json!({"category": "cat-misc"})),
            expense(
                "o-t3",
                "tx-3",
                "acc-a",
                100.0,
                json!({"category": "cat-food", "amount_base": 40.0}),
            ),
            tx_create(
                "o-t4",
                "tx-4",
                json!({
                    "client_id": "tx-4",
                    "transaction_type": "expense",
                    "date_time": "2024-02-05T10:00:00Z",
                    "amount": 70.0,
                    "currency": "SAR",
                    "account": "acc-a",
                    "category": "cat-food",
                }),
            ),
        ],
    )
    .await;

    let budget = fetch_payload(&engine, &identity, WALLET, "Budget", "bud-1").await;
    // In-window food expenses: 50 plus the base-amount 40; the February
    // expense and the other category stay out.
    assert_eq!(budget["spent_amount"], 90.0);
}

#[tokio::test]
async fn saving_goal_tracks_linked_account_balance() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            item(
                "o-a",
                "Account",
                "acc-a",
                "create",
                Some(0),
                json!({"client_id": "acc-a", "name": "Main", "currency": "SAR", "opening_balance": 50.0}),
            ),
            item(
                "o-goal",
                "Goal",
                "goal-1",
                "create",
                Some(0),
                json!({
                    "client_id": "goal-1",
                    "name": "Vacation",
                    "goal_type": "save",
                    "target_amount": 200.0,
                    "linked_account": "acc-a",
                }),
            ),
        ],
    )
    .await;

    let goal = fetch_payload(&engine, &identity, WALLET, "Goal", "goal-1").await;
    assert_eq!(goal["current_amount"], 50.0);
    assert_eq!(goal["remaining_amount"], 150.0);
    assert_eq!(goal["progress_percent"], 25.0);
}

#[tokio::test]
async fn pay_debt_goal_tracks_paid_installments() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            item(
                "o-debt",
                "Debt",
                "debt-1",
                "create",
                Some(0),
                json!({
                    "client_id": "debt-1",
                    "name": "Car loan",
                    "direction": "owed_by_me",
                    "principal_amount": 100.0,
                }),
            ),
            item(
                "o-goal",
                "Goal",
                "goal-1",
                "create",
                Some(0),
                json!({
                    "client_id": "goal-1",
                    "name": "Debt free",
                    "goal_type": "pay_debt",
                    "target_amount": 100.0,
                    "linked_debt": "debt-1",
                }),
            ),
        ],
    )
    .await;

    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o-inst",
            "DebtInstallment",
            "inst-1",
            "create",
            Some(0),
            json!({
                "client_id": "inst-1",
                "debt": "debt-1",
                "amount": 40.0,
                "status": "paid",
            }),
        ),
    )
    .await;

    let debt = fetch_payload(&engine, &identity, WALLET, "Debt", "debt-1").await;
    assert_eq!(debt["remaining_amount"], 60.0);

    let goal = fetch_payload(&engine, &identity, WALLET, "Goal", "goal-1").await;
    assert_eq!(goal["current_amount"], 40.0);
    assert_eq!(goal["progress_percent"], 40.0);
}

#[tokio::test]
async fn debt_closes_when_paid_and_reopens_when_retracted() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            item(
                "o-debt",
                "Debt",
                "debt-1",
                "create",
                Some(0),
                json!({
                    "client_id": "debt-1",
                    "name": "Loan",
                    "direction": "owed_by_me",
                    "principal_amount": 100.0,
                }),
            ),
            item(
                "o-inst",
                "DebtInstallment",
                "inst-1",
                "create",
                Some(0),
                json!({
                    "client_id": "inst-1",
                    "debt": "debt-1",
                    "amount": 100.0,
                    "status": "paid",
                }),
            ),
        ],
    )
    .await;

    let debt = fetch_payload(&engine, &identity, WALLET, "Debt", "debt-1").await;
    assert_eq!(debt["remaining_amount"], 0.0);
    assert_eq!(debt["status"], "closed");

    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o-retract",
            "DebtInstallment",
            "inst-1",
            "update",
            Some(1),
            json!({"client_id": "inst-1", "status": "due"}),
        ),
    )
    .await;

    let debt = fetch_payload(&engine, &identity, WALLET, "Debt", "debt-1").await;
    assert_eq!(debt["remaining_amount"], 100.0);
    assert_eq!(debt["status"], "active");
}

fn allocation_rule(op_id: &str, rule_id: &str, scope: Value) -> PushItem {
    let mut payload = json!({
        "client_id": rule_id,
        "name": rule_id,
        "active": 1,
    });
    if let (Value::Object(payload), Value::Object(scope)) = (&mut payload, scope) {
        payload.extend(scope);
    }
    item(op_id, "AllocationRule", rule_id, "create", Some(0), payload)
}

fn rule_line(op_id: &str, line_id: &str, rule: &str, bucket: &str, percent: i64) -> PushItem {
    item(
        op_id,
        "AllocationRuleLine",
        line_id,
        "create",
        Some(0),
        json!({
            "client_id": line_id,
            "rule": rule,
            "bucket": bucket,
            "percent": percent,
        }),
    )
}

#[tokio::test]
async fn income_is_auto_allocated_from_the_default_rule() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            allocation_rule(
                "o-rule",
                "rule-1",
                json!({"scope_type": "global", "is_default": 1}),
            ),
            rule_line("o-l1", "line-1", "rule-1", "b-needs", 60),
            rule_line("o-l2", "line-2", "rule-1", "b-wants", 40),
            income("o-tx", "tx-1", "acc-a", 100.0),
        ],
    )
    .await;

    let mut allocations = allocations_for(&engine, &identity, "tx-1").await;
    allocations.sort_by_key(|a| a["bucket"].as_str().map(ToOwned::to_owned));
    assert_eq!(allocations.len(), 2);
    assert_eq!(allocations[0]["bucket"], "b-needs");
    assert_eq!(allocations[0]["percent"], 60);
    assert_eq!(allocations[0]["amount"], 60.0);
    assert_eq!(allocations[0]["rule_used"], "rule-1");
    assert_eq!(allocations[0]["is_manual_override"], 0);
    assert_eq!(allocations[1]["bucket"], "b-wants");
    assert_eq!(allocations[1]["amount"], 40.0);
    assert_eq!(allocations[0]["client_id"], "tx-1:b-needs");
}

#[tokio::test]
async fn rounding_remainder_goes_to_the_largest_line() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            allocation_rule(
                "o-rule",
                "rule-1",
                json!({"scope_type": "global", "is_default": 1}),
            ),
            rule_line("o-l1", "line-1", "rule-1", "b-1", 33),
            rule_line("o-l2", "line-2", "rule-1", "b-2", 33),
            rule_line("o-l3", "line-3", "rule-1", "b-3", 33),
            income("o-tx", "tx-1", "acc-a", 100.0),
        ],
    )
    .await;

    let allocations = allocations_for(&engine, &identity, "tx-1").await;
    assert_eq!(allocations.len(), 3);
    let total: f64 = allocations
        .iter()
        .map(|a| a["amount"].as_f64().unwrap_or(0.0))
        .sum();
    assert!((total - 100.0).abs() < 1e-9, "allocations must sum: {total}");
}

#[tokio::test]
async fn by_account_rule_beats_the_global_default() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            allocation_rule(
                "o-rule-g",
                "rule-global",
                json!({"scope_type": "global", "is_default": 1}),
            ),
            rule_line("o-lg", "line-g", "rule-global", "b-global", 100),
            allocation_rule(
                "o-rule-a",
                "rule-acct",
                json!({"scope_type": "by_account", "scope_ref": "acc-a"}),
            ),
            rule_line("o-la", "line-a", "rule-acct", "b-acct", 100),
            income("o-tx", "tx-1", "acc-a", 80.0),
        ],
    )
    .await;

    let allocations = allocations_for(&engine, &identity, "tx-1").await;
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0]["bucket"], "b-acct");
    assert_eq!(allocations[0]["rule_used"], "rule-acct");
    assert_eq!(allocations[0]["amount"], 80.0);
}

#[tokio::test]
async fn manual_allocations_are_never_overwritten() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            income("o-tx", "tx-1", "acc-a", 100.0),
            item(
                "o-manual",
                "TransactionAllocation",
                "alloc-manual",
                "create",
                Some(0),
                json!({
                    "client_id": "alloc-manual",
                    "transaction": "tx-1",
                    "bucket": "b-mine",
                    "percent": 100,
                    "amount": 100.0,
                    "is_manual_override": 1,
                }),
            ),
            allocation_rule(
                "o-rule",
                "rule-1",
                json!({"scope_type": "global", "is_default": 1}),
            ),
            rule_line("o-l1", "line-1", "rule-1", "b-auto", 100),
        ],
    )
    .await;

    // Touch the transaction so the allocation pass reruns with the rule in
    // place; the manual row must survive and no auto rows may appear.
    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o-touch",
            "Transaction",
            "tx-1",
            "update",
            Some(1),
            json!({"client_id": "tx-1", "note": "touched"}),
        ),
    )
    .await;

    let allocations = allocations_for(&engine, &identity, "tx-1").await;
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0]["bucket"], "b-mine");
    assert_eq!(allocations[0]["is_manual_override"], 1);
}

#[tokio::test]
async fn leaving_income_drops_auto_allocations() {
    let engine = engine();
    let identity = identity();
    setup(&engine, &identity).await;
    push_all(
        &engine,
        &identity,
        WALLET,
        vec![
            account_create("o-a", "acc-a", "Main"),
            allocation_rule(
                "o-rule",
                "rule-1",
                json!({"scope_type": "global", "is_default": 1}),
            ),
            rule_line("o-l1", "line-1", "rule-1", "b-1", 100),
            income("o-tx", "tx-1", "acc-a", 100.0),
        ],
    )
    .await;
    assert_eq!(allocations_for(&engine, &identity, "tx-1").await.len(), 1);

    push_one(
        &engine,
        &identity,
        WALLET,
        item(
            "o-flip",
            "Transaction",
            "tx-1",
            "update",
            Some(1),
            json!({"client_id": "tx-1", "transaction_type": "expense"}),
        ),
    )
    .await;

    assert!(allocations_for(&engine, &identity, "tx-1").await.is_empty());
}

#[tokio::test]
async fn replaying_a_history_yields_identical_aggregates() {
    async fn run_history(engine: &SyncEngine, identity: &Identity) -> BTreeMap<String, Value> {
        setup_wallet(engine, identity, WALLET).await;
        push_all(
            engine,
            identity,
            WALLET,
            vec![
                account_create("o-a", "acc-a", "Main"),
                account_create("o-b", "acc-b", "Savings"),
                allocation_rule(
                    "o-rule",
                    "rule-1",
                    json!({"scope_type": "global", "is_default": 1}),
                ),
                rule_line("o-l1", "line-1", "rule-1", "b-1", 70),
                rule_line("o-l2", "line-2", "rule-1", "b-2", 30),
                income("o-t1", "tx-1", "acc-a", 100.0),
                expense("o-t2", "tx-2", "acc-a", 25.0, json!({"category": "cat-1"})),
            ],
        )
        .await;
        push_one(
            engine,
            identity,
            WALLET,
            item(
                "o-move",
                "Transaction",
                "tx-1",
                "update",
                Some(1),
                json!({"client_id": "tx-1", "account": "acc-b"}),
            ),
        )
        .await;

        pull_all(engine, identity, WALLET)
            .await
            .items
            .into_iter()
            .map(|item| {
                let key = format!("{}/{}", item.entity_type, item.entity_id);
                let mut state = item.payload;
                if let Value::Object(map) = &mut state {
                    map.insert("doc_version".to_owned(), json!(item.doc_version));
                    map.insert("is_deleted".to_owned(), json!(item.is_deleted));
                }
                (key, state)
            })
            .collect()
    }

    let first = run_history(&engine(), &identity()).await;
    let second = run_history(&engine(), &identity()).await;
    assert_eq!(first, second);
}
