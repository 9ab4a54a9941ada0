use sea_orm::entity::prelude::*;

/// A configured remote provider account. Nested collection fields
/// (`route_capabilities`, `allowed_models`, `model_redirects`,
/// `circuit_breaker_config`, `affinity_migration_config`,
/// `billing_multipliers`, `spending_rules`) are stored as JSON, mirroring the
/// teacher's `config_json` column convention, since they are heterogeneous
/// structured data the engine deserializes once per registry reload rather
/// than per-request.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstreams")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    /// Encrypted with the process `encryption_key` (AEAD); decrypted only at
    /// forward time.
    pub api_key_encrypted: Vec<u8>,
    pub timeout_ms: i64,
    pub is_active: bool,
    pub weight: i32,
    pub priority: i32,
    pub route_capabilities: Json,
    pub allowed_models: Option<Json>,
    pub model_redirects: Option<Json>,
    pub circuit_breaker_config: Json,
    pub affinity_migration_config: Option<Json>,
    pub billing_multipliers: Json,
    pub spending_rules: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::api_key_upstreams::Entity")]
    ApiKeyUpstreams,
    #[sea_orm(has_one = "super::upstream_health::Entity")]
    UpstreamHealth,
    #[sea_orm(has_one = "super::circuit_breaker_states::Entity")]
    CircuitBreakerState,
}

impl Related<super::api_key_upstreams::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ApiKeyUpstreams.def()
    }
}

impl Related<super::upstream_health::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UpstreamHealth.def()
    }
}

impl Related<super::circuit_breaker_states::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CircuitBreakerState.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
