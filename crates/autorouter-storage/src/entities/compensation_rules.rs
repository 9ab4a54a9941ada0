use sea_orm::entity::prelude::*;

/// Header-compensation rule consumed by C9: `{capabilities, targetHeader,
/// sources[], mode}`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "compensation_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub capabilities: Json,
    pub target_header: String,
    pub sources: Json,
    pub mode: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
