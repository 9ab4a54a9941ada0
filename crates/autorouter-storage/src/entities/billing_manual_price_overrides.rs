use sea_orm::entity::prelude::*;

/// Manual per-model price override. Takes precedence over a synced price
/// source when resolving price in §4.12 step 2.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "billing_manual_price_overrides")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub model: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
