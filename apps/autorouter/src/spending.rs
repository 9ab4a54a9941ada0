//! Concrete `SpendingAggregator` (§4.5, §4.12), wired at the composition
//! root because the trait lives in `autorouter-core` while the query
//! needs `autorouter-storage`'s entities — `autorouter-storage` can't
//! depend back on `autorouter-core` to implement it itself. Query shape
//! follows the teacher's `gproxy-storage::seaorm` aggregate style: fetch
//! matching rows, then fold/bucket them in Rust rather than push a
//! DB-side `GROUP BY` that would need separate SQLite/Postgres dialects.

use std::collections::BTreeMap;

use autorouter_core::data::UpstreamId;
use autorouter_core::quota::SpendingAggregator;
use autorouter_storage::entities::{request_billing_snapshots, request_logs};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use time::OffsetDateTime;

pub struct StorageSpendingAggregator {
    db: DatabaseConnection,
}

impl StorageSpendingAggregator {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Billed cost rows for `upstream_id` created at or after `since`,
    /// oldest first.
    async fn billed_costs_since(
        &self,
        upstream_id: UpstreamId,
        since: OffsetDateTime,
    ) -> anyhow::Result<Vec<(OffsetDateTime, f64)>> {
        let logs = request_logs::Entity::find()
            .filter(request_logs::Column::UpstreamId.eq(upstream_id))
            .filter(request_logs::Column::CreatedAt.gte(since))
            .find_also_related(request_billing_snapshots::Entity)
            .all(&self.db)
            .await?;

        let mut out = Vec::with_capacity(logs.len());
        for (log, snapshot) in logs {
            let Some(snapshot) = snapshot else { continue };
            if snapshot.billing_status != "billed" {
                continue;
            }
            let Some(cost) = snapshot.final_cost else {
                continue;
            };
            out.push((log.created_at, cost));
        }
        out.sort_by_key(|(ts, _)| *ts);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl SpendingAggregator for StorageSpendingAggregator {
    async fn sum_spending_since(
        &self,
        upstream_id: UpstreamId,
        since: OffsetDateTime,
    ) -> anyhow::Result<f64> {
        let costs = self.billed_costs_since(upstream_id, since).await?;
        Ok(costs.iter().map(|(_, cost)| cost).sum())
    }

    async fn hourly_slices_since(
        &self,
        upstream_id: UpstreamId,
        since: OffsetDateTime,
    ) -> anyhow::Result<Vec<(OffsetDateTime, f64)>> {
        let costs = self.billed_costs_since(upstream_id, since).await?;

        let mut buckets: BTreeMap<i64, f64> = BTreeMap::new();
        for (ts, cost) in costs {
            let bucket = (ts.unix_timestamp() / 3600) * 3600;
            *buckets.entry(bucket).or_insert(0.0) += cost;
        }

        buckets
            .into_iter()
            .map(|(bucket, total)| {
                OffsetDateTime::from_unix_timestamp(bucket)
                    .map(|ts| (ts, total))
                    .map_err(anyhow::Error::from)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorouter_storage::Storage;

    async fn seeded_storage() -> Storage {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        storage.sync().await.unwrap();
        storage
    }

    async fn insert_log_and_snapshot(
        db: &DatabaseConnection,
        upstream_id: i64,
        created_at: OffsetDateTime,
        billing_status: &str,
        final_cost: Option<f64>,
    ) {
        use sea_orm::ActiveValue::Set;

        let log = request_logs::ActiveModel {
            id: sea_orm::ActiveValue::NotSet,
            api_key_id: Set(None),
            upstream_id: Set(Some(upstream_id)),
            method: Set("POST".to_string()),
            path: Set("/v1/messages".to_string()),
            model: Set(None),
            prompt_tokens: Set(None),
            completion_tokens: Set(None),
            total_tokens: Set(None),
            cache_read_tokens: Set(None),
            cache_write_tokens: Set(None),
            status_code: Set(200),
            duration_ms: Set(10),
            routing_duration_ms: Set(1),
            ttft_ms: Set(None),
            is_stream: Set(false),
            error_message: Set(None),
            failover_attempts: Set(0),
            failover_history: Set(serde_json::json!([])),
            routing_decision: Set(serde_json::json!({})),
            session_id: Set(None),
            affinity_hit: Set(false),
            affinity_migrated: Set(false),
            created_at: Set(created_at),
        };
        let inserted = request_logs::Entity::insert(log).exec(db).await.unwrap();

        let snapshot = request_billing_snapshots::ActiveModel {
            request_log_id: Set(inserted.last_insert_id),
            billing_status: Set(billing_status.to_string()),
            unbillable_reason: Set(None),
            price_source: Set(None),
            base_prices: Set(serde_json::json!({})),
            multipliers: Set(serde_json::json!({})),
            billed_input_tokens: Set(None),
            final_cost: Set(final_cost),
            currency: Set("USD".to_string()),
        };
        request_billing_snapshots::Entity::insert(snapshot)
            .exec(db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sums_only_billed_rows_since_cutoff() {
        let storage = seeded_storage().await;
        let db = storage.connection();
        let now = OffsetDateTime::now_utc();

        insert_log_and_snapshot(db, 1, now - time::Duration::hours(1), "billed", Some(2.0)).await;
        insert_log_and_snapshot(db, 1, now - time::Duration::hours(1), "unbillable", Some(99.0))
            .await;
        insert_log_and_snapshot(db, 2, now - time::Duration::hours(1), "billed", Some(50.0)).await;
        insert_log_and_snapshot(
            db,
            1,
            now - time::Duration::hours(48),
            "billed",
            Some(1000.0),
        )
        .await;

        let aggregator = StorageSpendingAggregator::new(db.clone());
        let total = aggregator
            .sum_spending_since(1, now - time::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(total, 2.0);
    }

    #[tokio::test]
    async fn hourly_slices_are_bucketed_and_ordered() {
        let storage = seeded_storage().await;
        let db = storage.connection();
        let now = OffsetDateTime::now_utc();

        insert_log_and_snapshot(db, 1, now - time::Duration::hours(2), "billed", Some(3.0)).await;
        insert_log_and_snapshot(db, 1, now - time::Duration::hours(2), "billed", Some(1.0)).await;
        insert_log_and_snapshot(db, 1, now - time::Duration::hours(1), "billed", Some(5.0)).await;

        let aggregator = StorageSpendingAggregator::new(db.clone());
        let slices = aggregator
            .hourly_slices_since(1, now - time::Duration::hours(3))
            .await
            .unwrap();

        assert_eq!(slices.len(), 2);
        assert!(slices[0].0 < slices[1].0);
        assert_eq!(slices[0].1, 4.0);
        assert_eq!(slices[1].1, 5.0);
    }
}
