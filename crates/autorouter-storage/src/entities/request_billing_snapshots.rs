use sea_orm::entity::prelude::*;

/// Per-request cost record, 1:1 with `request_logs` by id (invariant 4 in
/// spec §8). Immutable; cost is frozen at emission.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_billing_snapshots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub request_log_id: i64,
    pub billing_status: String,
    pub unbillable_reason: Option<String>,
    pub price_source: Option<String>,
    pub base_prices: Json,
    pub multipliers: Json,
    pub billed_input_tokens: Option<i64>,
    pub final_cost: Option<f64>,
    pub currency: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::request_logs::Entity",
        from = "Column::RequestLogId",
        to = "super::request_logs::Column::Id",
        on_delete = "Cascade"
    )]
    RequestLog,
}

impl Related<super::request_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RequestLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
