use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Side map keyed by upstream id, per spec §9 ("cyclic references ... not
/// required — store health/circuit in side maps").
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstream_health")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub upstream_id: i64,
    pub is_healthy: bool,
    pub last_check_at: Option<OffsetDateTime>,
    pub last_success_at: Option<OffsetDateTime>,
    pub failure_count: i32,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::upstreams::Entity",
        from = "Column::UpstreamId",
        to = "super::upstreams::Column::Id",
        on_delete = "Cascade"
    )]
    Upstream,
}

impl Related<super::upstreams::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Upstream.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
