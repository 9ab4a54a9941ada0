use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Post-flight audit record. Immutable once written (§3 `RequestLog`).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub status_code: i32,
    pub duration_ms: i64,
    pub routing_duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub error_message: Option<String>,
    pub failover_attempts: i32,
    pub failover_history: Json,
    pub routing_decision: Json,
    pub session_id: Option<String>,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::request_billing_snapshots::Entity")]
    BillingSnapshot,
}

impl Related<super::request_billing_snapshots::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BillingSnapshot.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
