use sea_orm::entity::prelude::*;

/// Single-row table backing the lowest-precedence layer of
/// `autorouter_common::GlobalConfigPatch` overlay (DB < ENV < CLI).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "global_config")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub config_json: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
