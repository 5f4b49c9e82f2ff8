//! Shared helpers for engine integration tests.

use std::sync::Arc;

use serde_json::{json, Value};
use wallet_sync_core::protocol::{PullMessage, PushItem, PushMessage};
use wallet_sync_engine::{Identity, PullParams, SyncEngine};
use wallet_sync_storage::MemoryStorage;

pub fn engine() -> SyncEngine {
    SyncEngine::new(Arc::new(MemoryStorage::new()))
}

pub fn identity() -> Identity {
    Identity {
        user_id: "user-1".to_owned(),
        device_id: "device-1".to_owned(),
    }
}

pub fn identity_for(user_id: &str, device_id: &str) -> Identity {
    Identity {
        user_id: user_id.to_owned(),
        device_id: device_id.to_owned(),
    }
}

pub fn item(
    op_id: &str,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    base_version: Option<i64>,
    payload: Value,
) -> PushItem {
    PushItem {
        op_id: Some(op_id.to_owned()),
        entity_type: Some(entity_type.to_owned()),
        entity_id: Some(entity_id.to_owned()),
        operation: Some(operation.to_owned()),
        payload: Some(payload),
        base_version: base_version.map(|v| json!(v)),
    }
}

pub async fn push_one(
    engine: &SyncEngine,
    identity: &Identity,
    wallet: &str,
    one: PushItem,
) -> Value {
    let message = engine
        .push(identity, wallet, &[one])
        .await
        .expect("push should not fail at request level");
    message.results.into_iter().next().expect("one result")
}

pub async fn push_all(
    engine: &SyncEngine,
    identity: &Identity,
    wallet: &str,
    items: Vec<PushItem>,
) -> PushMessage {
    engine
        .push(identity, wallet, &items)
        .await
        .expect("push should not fail at request level")
}

/// Create a wallet (and with it the pushing user's owner membership).
pub async fn setup_wallet(engine: &SyncEngine, identity: &Identity, wallet: &str) {
    let result = push_one(
        engine,
        identity,
        wallet,
        item(
            &format!("op-wallet-{wallet}"),
            "Wallet",
            wallet,
            "create",
            None,
            json!({"client_id": wallet, "name": "Main", "status": "active"}),
        ),
    )
    .await;
    assert_eq!(result["status"], "accepted", "wallet create: {result}");
}

pub async fn pull_all(engine: &SyncEngine, identity: &Identity, wallet: &str) -> PullMessage {
    engine
        .pull(identity, wallet, PullParams::default())
        .await
        .expect("pull should succeed")
}

/// Latest payload of one entity as seen through a full pull.
pub async fn fetch_payload(
    engine: &SyncEngine,
    identity: &Identity,
    wallet: &str,
    entity_type: &str,
    entity_id: &str,
) -> Value {
    let message = pull_all(engine, identity, wallet).await;
    message
        .items
        .iter()
        .find(|item| item.entity_type == entity_type && item.entity_id == entity_id)
        .map(|item| item.payload.clone())
        .unwrap_or_else(|| panic!("{entity_type}/{entity_id} not in pull"))
}

pub fn account_create(op_id: &str, entity_id: &str, name: &str) -> PushItem {
    item(
        op_id,
        "Account",
        entity_id,
        "create",
        Some(0),
        json!({"client_id": entity_id, "name": name, "currency": "SAR"}),
    )
}

pub fn tx_create(op_id: &str, entity_id: &str, payload: Value) -> PushItem {
    item(op_id, "Transaction", entity_id, "create", Some(0), payload)
}
