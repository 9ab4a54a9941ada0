use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Gateway-issued credential. `key_hash` is the SHA-256 of the presented key
/// bytes; the plaintext is never persisted. See [`crate::entities::api_key_upstreams`]
/// for the authorization join table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::api_key_upstreams::Entity")]
    ApiKeyUpstreams,
}

impl Related<super::api_key_upstreams::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ApiKeyUpstreams.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
