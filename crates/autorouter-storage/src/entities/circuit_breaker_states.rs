use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Persisted mirror of the in-memory breaker, written on state transitions
/// so a restart resumes from the last known state rather than `closed`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "circuit_breaker_states")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub upstream_id: i64,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
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
