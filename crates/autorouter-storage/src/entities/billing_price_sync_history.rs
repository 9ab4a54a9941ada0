use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Audit trail of price-feed sync runs. The fetchers themselves are an
/// external collaborator (out of scope); this table is what the engine
/// reads to decide "synced price source" in §4.12.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "billing_price_sync_history")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub synced_at: OffsetDateTime,
    pub models_updated: i32,
    pub source: String,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
