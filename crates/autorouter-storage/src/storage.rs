use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Schema};

use crate::db::connect_shared;
use crate::entities;
use crate::snapshot::{GlobalConfigRow, StorageSnapshot};
use autorouter_common::GlobalConfig;

/// Handle to the persistence layer. Cheaply clonable (wraps a pooled
/// `DatabaseConnection`), following `gproxy-storage`'s `TrafficStorage`
/// shape.
#[derive(Clone)]
pub struct Storage {
    db: DatabaseConnection,
}

impl Storage {
    pub async fn connect(dsn: &str) -> Result<Self, DbErr> {
        let db = connect_shared(dsn).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create tables that don't yet exist. Schema/migration management
    /// proper is an external collaborator; this only gets a fresh sqlite
    /// file to a runnable state.
    pub async fn sync(&self) -> Result<(), DbErr> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);
        macro_rules! create {
            ($entity:expr) => {
                self.db
                    .execute(backend.build(&schema.create_table_from_entity($entity).if_not_exists()))
                    .await?;
            };
        }
        create!(entities::GlobalConfig);
        create!(entities::ApiKeys);
        create!(entities::Upstreams);
        create!(entities::ApiKeyUpstreams);
        create!(entities::UpstreamHealth);
        create!(entities::CircuitBreakerStates);
        create!(entities::RequestLogs);
        create!(entities::RequestBillingSnapshots);
        create!(entities::BillingModelPrices);
        create!(entities::BillingManualPriceOverrides);
        create!(entities::BillingPriceSyncHistory);
        create!(entities::CompensationRules);
        Ok(())
    }

    /// Load the full `StorageSnapshot` used to warm C1/C2/C6 at boot.
    pub async fn load_snapshot(&self) -> Result<StorageSnapshot, DbErr> {
        let global_row = entities::GlobalConfig::find().one(&self.db).await?;
        let global_config = match global_row {
            Some(row) => match serde_json::from_value::<GlobalConfig>(row.config_json.clone()) {
                Ok(config) => Some(GlobalConfigRow { id: row.id, config }),
                Err(_) => None,
            },
            None => None,
        };

        let api_keys = entities::ApiKeys::find().all(&self.db).await?;
        let api_key_upstreams = entities::ApiKeyUpstreams::find().all(&self.db).await?;
        let upstreams = entities::Upstreams::find().all(&self.db).await?;
        let billing_model_prices = entities::BillingModelPrices::find().all(&self.db).await?;
        let billing_manual_price_overrides = entities::BillingManualPriceOverrides::find()
            .all(&self.db)
            .await?;
        let compensation_rules = entities::CompensationRules::find().all(&self.db).await?;

        Ok(StorageSnapshot {
            global_config,
            api_keys,
            api_key_upstreams,
            upstreams,
            billing_model_prices,
            billing_manual_price_overrides,
            compensation_rules,
        })
    }

    pub async fn persist_global_config(&self, config: &GlobalConfig) -> Result<(), DbErr> {
        use sea_orm::ActiveValue::Set;
        let value = serde_json::to_value(config).unwrap_or_default();
        let existing = entities::GlobalConfig::find().one(&self.db).await?;
        let model = match existing {
            Some(row) => entities::global_config::ActiveModel {
                id: Set(row.id),
                config_json: Set(value),
            },
            None => entities::global_config::ActiveModel {
                id: Set(1),
                config_json: Set(value),
            },
        };
        entities::GlobalConfig::insert(model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(entities::global_config::Column::Id)
                    .update_column(entities::global_config::Column::ConfigJson)
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn upstream_health_row(
        &self,
        upstream_id: i64,
    ) -> Result<Option<entities::upstream_health::Model>, DbErr> {
        entities::UpstreamHealth::find()
            .filter(entities::upstream_health::Column::UpstreamId.eq(upstream_id))
            .one(&self.db)
            .await
    }
}
