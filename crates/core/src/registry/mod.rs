//! Entity registry: one static descriptor per syncable entity type.
//!
//! Each descriptor declares what the type accepts on the wire (required and
//! optional fields, aliases, denied fields), what the server owns, how
//! deletes behave, and which derived aggregates a mutation dirties. The
//! normalizer and the sync engine are generic over these descriptors; no
//! entity type has bespoke code paths outside the wallet-bootstrap rule.

mod normalize;

pub use normalize::{normalize_payload, NormalizeError};

use serde_json::{Map, Value};

use crate::protocol::Operation;

/// Payload value types the registry can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Number,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Str => "string",
            FieldType::Number => "number",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::Str => value.is_string(),
            FieldType::Number => value.is_number(),
        }
    }
}

/// Derived-aggregate work produced by an accepted mutation. Tasks are
/// collected across a batch and dedup-merged before they run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecalcTask {
    TransactionAllocations(String),
    AccountBalance(String),
    DebtRemaining(String),
    BudgetSpent(String),
    GoalProgress(String),
    AllBudgets,
    AllGoals,
}

/// What a recalc hook gets to look at: the accepted mutation plus the row's
/// previous payload (for link moves, e.g. a transaction changing accounts).
pub struct RecalcContext<'a> {
    pub operation: Operation,
    pub entity_id: &'a str,
    pub payload: &'a Map<String, Value>,
    pub previous: Option<&'a Map<String, Value>>,
}

impl RecalcContext<'_> {
    fn field(&self, key: &str) -> Option<&str> {
        field_str(self.payload, key)
    }

    fn previous_field(&self, key: &str) -> Option<&str> {
        self.previous.and_then(|map| field_str(map, key))
    }
}

fn field_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Common payload fields every entity accepts.
const COMMON_FIELDS: &[&str] = &[
    "client_id",
    "wallet_id",
    "client_created_ms",
    "client_modified_ms",
];

/// Soft-delete markers are accepted on the wire (clients echo them back)
/// but are server-authoritative and always stripped on ingest.
const SOFT_DELETE_FIELDS: &[&str] = &["is_deleted", "deleted_at"];

/// Server-stamped sync metadata, stripped from every incoming payload.
pub const STRIPPED_SYNC_FIELDS: &[&str] =
    &["doc_version", "server_modified", "is_deleted", "deleted_at"];

/// Credential-shaped field names no payload may carry.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "password_hash",
    "token",
    "device_token",
    "device_token_hash",
    "secret",
    "api_key",
];

pub struct EntityDescriptor {
    pub entity_type: &'static str,
    pub soft_delete: bool,
    /// Fields that must be present and non-empty on create.
    pub required: &'static [&'static str],
    /// Groups where at least one member must be present on create.
    pub required_any: &'static [&'static [&'static str]],
    pub optional: &'static [&'static str],
    /// Wire-name rewrites, applied before any other field rule.
    pub aliases: &'static [(&'static str, &'static str)],
    /// Derived fields written by recalc; stripped from incoming payloads.
    pub server_owned: &'static [&'static str],
    /// Fields normalized to canonical RFC-3339 on ingest.
    pub datetime_fields: &'static [&'static str],
    /// String values that must parse as JSON.
    pub json_fields: &'static [&'static str],
    pub field_types: &'static [(&'static str, FieldType)],
    pub recalc: fn(&RecalcContext<'_>) -> Vec<RecalcTask>,
}

impl EntityDescriptor {
    pub fn allows(&self, field: &str) -> bool {
        COMMON_FIELDS.contains(&field)
            || (self.soft_delete && SOFT_DELETE_FIELDS.contains(&field))
            || self.required.contains(&field)
            || self.optional.contains(&field)
            || self.server_owned.contains(&field)
            || self.required_any.iter().any(|group| group.contains(&field))
    }

    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.field_types
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, ty)| *ty)
    }
}

pub fn lookup(entity_type: &str) -> Option<&'static EntityDescriptor> {
    REGISTRY.iter().find(|desc| desc.entity_type == entity_type)
}

pub fn entity_types() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|desc| desc.entity_type)
}

pub const WALLET: &str = "Wallet";
pub const WALLET_MEMBER: &str = "WalletMember";
pub const ACCOUNT: &str = "Account";
pub const CATEGORY: &str = "Category";
pub const TRANSACTION: &str = "Transaction";
pub const BUDGET: &str = "Budget";
pub const GOAL: &str = "Goal";
pub const DEBT: &str = "Debt";
pub const DEBT_INSTALLMENT: &str = "DebtInstallment";
pub const DEBT_REQUEST: &str = "DebtRequest";
pub const BUCKET: &str = "Bucket";
pub const ALLOCATION_RULE: &str = "AllocationRule";
pub const ALLOCATION_RULE_LINE: &str = "AllocationRuleLine";
pub const TRANSACTION_ALLOCATION: &str = "TransactionAllocation";
pub const ATTACHMENT: &str = "Attachment";

fn no_recalc(_ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    Vec::new()
}

fn account_recalc(ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    let mut tasks = vec![RecalcTask::AllGoals];
    if ctx.operation == Operation::Update {
        tasks.push(RecalcTask::AccountBalance(ctx.entity_id.to_owned()));
    }
    tasks
}

fn transaction_recalc(ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    let mut tasks = vec![
        RecalcTask::AllBudgets,
        RecalcTask::AllGoals,
        RecalcTask::TransactionAllocations(ctx.entity_id.to_owned()),
    ];
    // An update that moves a transaction between accounts dirties both the
    // old and the new account pair.
    for key in ["account", "to_account"] {
        if let Some(account) = ctx.field(key) {
            tasks.push(RecalcTask::AccountBalance(account.to_owned()));
        }
        if let Some(account) = ctx.previous_field(key) {
            tasks.push(RecalcTask::AccountBalance(account.to_owned()));
        }
    }
    tasks
}

fn budget_recalc(ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    vec![RecalcTask::BudgetSpent(ctx.entity_id.to_owned())]
}

fn goal_recalc(ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    vec![RecalcTask::GoalProgress(ctx.entity_id.to_owned())]
}

fn debt_recalc(ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    vec![
        RecalcTask::DebtRemaining(ctx.entity_id.to_owned()),
        RecalcTask::AllGoals,
    ]
}

fn debt_installment_recalc(ctx: &RecalcContext<'_>) -> Vec<RecalcTask> {
    let debt = ctx.field("debt").or_else(|| ctx.previous_field("debt"));
    let mut tasks = vec![RecalcTask::AllGoals];
    if let Some(debt) = debt {
        tasks.push(RecalcTask::DebtRemaining(debt.to_owned()));
    }
    tasks
}

static REGISTRY: &[EntityDescriptor] = &[
    EntityDescriptor {
        entity_type: WALLET,
        soft_delete: false,
        required: &["name", "status"],
        required_any: &[],
        optional: &[],
        aliases: &[("wallet_name", "name"), ("title", "name")],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[("name", FieldType::Str), ("status", FieldType::Str)],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: WALLET_MEMBER,
        soft_delete: false,
        required: &["wallet", "user", "role", "status"],
        required_any: &[],
        optional: &["joined_at", "removed_at"],
        aliases: &[],
        server_owned: &[],
        datetime_fields: &["joined_at", "removed_at"],
        json_fields: &[],
        field_types: &[
            ("wallet", FieldType::Str),
            ("user", FieldType::Str),
            ("role", FieldType::Str),
            ("status", FieldType::Str),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: ACCOUNT,
        soft_delete: true,
        required: &["name", "currency"],
        required_any: &[],
        optional: &[
            "account_type",
            "opening_balance",
            "color",
            "icon",
            "archived",
            "sort_order",
        ],
        aliases: &[
            ("account_name", "name"),
            ("title", "name"),
            ("type", "account_type"),
        ],
        server_owned: &["current_balance"],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("name", FieldType::Str),
            ("account_type", FieldType::Str),
            ("currency", FieldType::Str),
            ("opening_balance", FieldType::Number),
            ("sort_order", FieldType::Number),
        ],
        recalc: account_recalc,
    },
    EntityDescriptor {
        entity_type: CATEGORY,
        soft_delete: true,
        required: &["name", "kind"],
        required_any: &[],
        optional: &[
            "parent_category",
            "color",
            "icon",
            "archived",
            "sort_order",
            "default_bucket",
        ],
        aliases: &[
            ("category_name", "name"),
            ("title", "name"),
            ("parent_id", "parent_category"),
            ("default_bucket_id", "default_bucket"),
        ],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("name", FieldType::Str),
            ("kind", FieldType::Str),
            ("sort_order", FieldType::Number),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: TRANSACTION,
        soft_delete: true,
        required: &["transaction_type", "date_time", "amount", "currency", "account"],
        required_any: &[],
        optional: &[
            "to_account",
            "category",
            "bucket",
            "note",
            "amount_base",
            "fx_rate_used",
        ],
        aliases: &[
            ("type", "transaction_type"),
            ("account_id", "account"),
            ("to_account_id", "to_account"),
            ("category_id", "category"),
            ("bucket_id", "bucket"),
        ],
        server_owned: &[],
        datetime_fields: &["date_time"],
        json_fields: &[],
        field_types: &[
            ("transaction_type", FieldType::Str),
            ("date_time", FieldType::Str),
            ("amount", FieldType::Number),
            ("amount_base", FieldType::Number),
            ("currency", FieldType::Str),
            ("account", FieldType::Str),
            ("to_account", FieldType::Str),
            ("fx_rate_used", FieldType::Number),
        ],
        recalc: transaction_recalc,
    },
    EntityDescriptor {
        entity_type: BUDGET,
        soft_delete: true,
        required: &["name", "period", "scope_type"],
        required_any: &[&["amount", "amount_base"]],
        optional: &[
            "category",
            "currency",
            "start_date",
            "end_date",
            "alert_threshold",
            "archived",
        ],
        aliases: &[
            ("budget_name", "name"),
            ("title", "name"),
            ("category_id", "category"),
        ],
        server_owned: &["spent_amount"],
        datetime_fields: &["start_date", "end_date"],
        json_fields: &[],
        field_types: &[
            ("name", FieldType::Str),
            ("period", FieldType::Str),
            ("scope_type", FieldType::Str),
            ("amount", FieldType::Number),
            ("amount_base", FieldType::Number),
            ("alert_threshold", FieldType::Number),
        ],
        recalc: budget_recalc,
    },
    EntityDescriptor {
        entity_type: GOAL,
        soft_delete: true,
        required: &["name", "goal_type"],
        required_any: &[&["target_amount", "target_amount_base"]],
        optional: &[
            "currency",
            "target_date",
            "linked_account",
            "linked_debt",
            "status",
            "color",
        ],
        aliases: &[
            ("goal_name", "name"),
            ("title", "name"),
            ("type", "goal_type"),
            ("linked_account_id", "linked_account"),
            ("linked_debt_id", "linked_debt"),
        ],
        server_owned: &["current_amount", "remaining_amount", "progress_percent"],
        datetime_fields: &["target_date"],
        json_fields: &[],
        field_types: &[
            ("name", FieldType::Str),
            ("goal_type", FieldType::Str),
            ("target_amount", FieldType::Number),
            ("target_amount_base", FieldType::Number),
        ],
        recalc: goal_recalc,
    },
    EntityDescriptor {
        entity_type: DEBT,
        soft_delete: true,
        required: &["name", "direction", "principal_amount"],
        required_any: &[],
        optional: &[
            "currency",
            "counterparty_name",
            "counterparty_type",
            "counterparty_phone",
            "confirmed",
            "note",
            "due_date",
        ],
        aliases: &[("debt_name", "name"), ("title", "name")],
        server_owned: &["remaining_amount", "status"],
        datetime_fields: &["due_date"],
        json_fields: &[],
        field_types: &[
            ("name", FieldType::Str),
            ("direction", FieldType::Str),
            ("principal_amount", FieldType::Number),
        ],
        recalc: debt_recalc,
    },
    EntityDescriptor {
        entity_type: DEBT_INSTALLMENT,
        soft_delete: true,
        required: &["debt", "amount"],
        required_any: &[],
        optional: &["due_date", "status", "paid_at", "paid_amount"],
        aliases: &[],
        server_owned: &[],
        datetime_fields: &["due_date", "paid_at"],
        json_fields: &[],
        field_types: &[
            ("debt", FieldType::Str),
            ("amount", FieldType::Number),
            ("paid_amount", FieldType::Number),
            ("status", FieldType::Str),
        ],
        recalc: debt_installment_recalc,
    },
    EntityDescriptor {
        entity_type: DEBT_REQUEST,
        soft_delete: true,
        required: &[],
        required_any: &[],
        optional: &["from_phone", "to_phone", "debt_payload_json", "status"],
        aliases: &[],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &["debt_payload_json"],
        field_types: &[
            ("from_phone", FieldType::Str),
            ("to_phone", FieldType::Str),
            ("status", FieldType::Str),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: BUCKET,
        soft_delete: true,
        required: &[],
        required_any: &[&["title", "name"]],
        optional: &["title", "color", "icon", "sort_order", "is_active", "archived"],
        aliases: &[("name", "title"), ("bucket_name", "title")],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("title", FieldType::Str),
            ("sort_order", FieldType::Number),
            ("is_active", FieldType::Number),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: ALLOCATION_RULE,
        soft_delete: true,
        required: &["name", "scope_type"],
        required_any: &[],
        optional: &["is_default", "scope_ref", "active"],
        aliases: &[
            ("rule_name", "name"),
            ("title", "name"),
            ("scope_ref_id", "scope_ref"),
        ],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("name", FieldType::Str),
            ("scope_type", FieldType::Str),
            ("scope_ref", FieldType::Str),
            ("is_default", FieldType::Number),
            ("active", FieldType::Number),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: ALLOCATION_RULE_LINE,
        soft_delete: true,
        required: &["rule", "bucket"],
        required_any: &[],
        optional: &["percent", "sort_order"],
        aliases: &[("rule_id", "rule"), ("bucket_id", "bucket")],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("rule", FieldType::Str),
            ("bucket", FieldType::Str),
            ("percent", FieldType::Number),
            ("sort_order", FieldType::Number),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: TRANSACTION_ALLOCATION,
        soft_delete: true,
        required: &["transaction", "bucket"],
        required_any: &[],
        optional: &[
            "percent",
            "amount",
            "currency",
            "amount_base",
            "rule_used",
            "is_manual_override",
        ],
        aliases: &[
            ("transaction_id", "transaction"),
            ("bucket_id", "bucket"),
            ("percentage", "percent"),
            ("rule_id_used", "rule_used"),
        ],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("transaction", FieldType::Str),
            ("bucket", FieldType::Str),
            ("percent", FieldType::Number),
            ("amount", FieldType::Number),
            ("amount_base", FieldType::Number),
            ("is_manual_override", FieldType::Number),
        ],
        recalc: no_recalc,
    },
    EntityDescriptor {
        entity_type: ATTACHMENT,
        soft_delete: true,
        required: &["owner_entity_type", "owner_client_id", "mime_type", "file_size"],
        required_any: &[],
        optional: &["file_id", "file_url", "file_name", "sha256"],
        aliases: &[("file_mime", "mime_type")],
        server_owned: &[],
        datetime_fields: &[],
        json_fields: &[],
        field_types: &[
            ("owner_entity_type", FieldType::Str),
            ("owner_client_id", FieldType::Str),
            ("mime_type", FieldType::Str),
            ("file_size", FieldType::Number),
        ],
        recalc: no_recalc,
    },
];
