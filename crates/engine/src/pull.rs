//! Delta producer: wallet-scoped, cursor-paged change feed.

use serde_json::Value;

use wallet_sync_core::protocol::{
    format_micros, now_micros, parse_cursor, PullItem, PullMessage,
};
use wallet_sync_core::validation::MAX_PULL_LIMIT;
use wallet_sync_core::WalletId;
use wallet_sync_storage::EntityRow;

use crate::scope::resolve_scope;
use crate::{Identity, RequestError, SyncEngine};

/// Cursor inputs as they arrived on the wire. `cursor` wins over `since`;
/// both accept RFC-3339, bare datetimes, or epoch numerics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullParams<'a> {
    pub cursor: Option<&'a str>,
    pub since: Option<&'a str>,
    pub limit: Option<i64>,
}

pub(crate) async fn pull(
    engine: &SyncEngine,
    identity: &Identity,
    wallet_id: &str,
    params: PullParams<'_>,
) -> Result<PullMessage, RequestError> {
    let wallet_id: WalletId = wallet_id
        .parse()
        .map_err(|_| RequestError::InvalidWalletId)?;

    // Any active membership (viewer included) may read.
    resolve_scope(engine.storage(), identity, &wallet_id, false).await?;

    let cursor_raw = params
        .cursor
        .or(params.since)
        .map(str::trim)
        .filter(|raw| !raw.is_empty());
    let since_micros = match cursor_raw {
        Some(raw) => parse_cursor(raw).ok_or(RequestError::InvalidCursor)?,
        None => 0,
    };

    let limit = params
        .limit
        .unwrap_or(MAX_PULL_LIMIT as i64)
        .clamp(1, MAX_PULL_LIMIT as i64) as usize;

    let (rows, has_more) = engine
        .storage()
        .changes_since(&wallet_id, since_micros, limit)
        .await?;

    let next_cursor = rows
        .last()
        .map(|row| format_micros(row.server_modified))
        .unwrap_or_else(|| {
            if cursor_raw.is_some() {
                format_micros(since_micros)
            } else {
                format_micros(now_micros())
            }
        });

    let items = rows.into_iter().map(pull_item).collect();

    Ok(PullMessage {
        items,
        next_cursor,
        has_more,
        server_time: format_micros(now_micros()),
    })
}

fn pull_item(row: EntityRow) -> PullItem {
    let client_id = row
        .payload
        .get("client_id")
        .and_then(Value::as_str)
        .unwrap_or(row.entity_id.as_str())
        .to_owned();
    PullItem {
        entity_type: row.entity_type,
        entity_id: row.entity_id,
        client_id,
        doc_version: row.doc_version,
        server_modified: format_micros(row.server_modified),
        payload: Value::Object(row.payload),
        is_deleted: i64::from(row.is_deleted),
        deleted_at: row.deleted_at.map(format_micros),
    }
}
