use sea_orm::ActiveValue::Set;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde_json::Value as Json;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::entities::{request_billing_snapshots, request_logs};

/// What C12 hands the storage layer after a committed attempt. Mirrors
/// `RequestLog` + `BillingSnapshot` from spec §3, flattened into one record
/// so the two rows can be written together (invariant: exactly one snapshot
/// per log, spec §8 invariant 4).
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub status_code: i32,
    pub duration_ms: i64,
    pub routing_duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub error_message: Option<String>,
    pub failover_attempts: i32,
    pub failover_history: Json,
    pub routing_decision: Json,
    pub session_id: Option<String>,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub billing_status: &'static str,
    pub unbillable_reason: Option<&'static str>,
    pub price_source: Option<String>,
    pub base_prices: Json,
    pub multipliers: Json,
    pub billed_input_tokens: Option<i64>,
    pub final_cost: Option<f64>,
    pub currency: String,
}

/// Bounded async write-behind queue. The client always gets its response
/// regardless of persistence outcome (§4.12); this channel decouples the
/// request task from the DB write, matching the teacher's `EventHub`
/// broadcast-plus-sink decoupling in `gproxy-provider-core/src/events/hub.rs`.
#[derive(Clone)]
pub struct LogEmitter {
    tx: mpsc::Sender<RequestLogRecord>,
}

const QUEUE_CAPACITY: usize = 1024;
const MAX_WRITE_ATTEMPTS: u32 = 3;

impl LogEmitter {
    pub fn spawn(db: DatabaseConnection) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLogRecord>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = write_with_retry(&db, &record).await {
                    tracing::warn!(
                        event = "request_log_dropped",
                        error = %err,
                        path = %record.path,
                        "request log persistence exhausted retries, dropping"
                    );
                }
            }
        });
        Self { tx }
    }

    /// Never blocks the request path: a full queue drops the record and logs
    /// a metric, per §4.12 ("retried with a bounded queue and eventually
    /// dropped with a metric").
    pub fn emit(&self, record: RequestLogRecord) {
        if self.tx.try_send(record).is_err() {
            tracing::warn!(event = "request_log_queue_full", "dropping request log, queue full");
        }
    }
}

async fn write_with_retry(
    db: &DatabaseConnection,
    record: &RequestLogRecord,
) -> Result<(), sea_orm::DbErr> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match write_once(db, record).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < MAX_WRITE_ATTEMPTS => {
                tracing::debug!(event = "request_log_retry", attempt, error = %err);
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn write_once(db: &DatabaseConnection, record: &RequestLogRecord) -> Result<(), sea_orm::DbErr> {
    let log = request_logs::ActiveModel {
        id: sea_orm::ActiveValue::NotSet,
        api_key_id: Set(record.api_key_id),
        upstream_id: Set(record.upstream_id),
        method: Set(record.method.clone()),
        path: Set(record.path.clone()),
        model: Set(record.model.clone()),
        prompt_tokens: Set(record.prompt_tokens),
        completion_tokens: Set(record.completion_tokens),
        total_tokens: Set(record.total_tokens),
        cache_read_tokens: Set(record.cache_read_tokens),
        cache_write_tokens: Set(record.cache_write_tokens),
        status_code: Set(record.status_code),
        duration_ms: Set(record.duration_ms),
        routing_duration_ms: Set(record.routing_duration_ms),
        ttft_ms: Set(record.ttft_ms),
        is_stream: Set(record.is_stream),
        error_message: Set(record.error_message.clone()),
        failover_attempts: Set(record.failover_attempts),
        failover_history: Set(record.failover_history.clone()),
        routing_decision: Set(record.routing_decision.clone()),
        session_id: Set(record.session_id.clone()),
        affinity_hit: Set(record.affinity_hit),
        affinity_migrated: Set(record.affinity_migrated),
        created_at: Set(OffsetDateTime::now_utc()),
    };
    let inserted = request_logs::Entity::insert(log).exec(db).await?;
    let request_log_id = inserted.last_insert_id;

    let snapshot = request_billing_snapshots::ActiveModel {
        request_log_id: Set(request_log_id),
        billing_status: Set(record.billing_status.to_string()),
        unbillable_reason: Set(record.unbillable_reason.map(str::to_string)),
        price_source: Set(record.price_source.clone()),
        base_prices: Set(record.base_prices.clone()),
        multipliers: Set(record.multipliers.clone()),
        billed_input_tokens: Set(record.billed_input_tokens),
        final_cost: Set(record.final_cost),
        currency: Set(record.currency.clone()),
    };
    request_billing_snapshots::Entity::insert(snapshot)
        .exec(db)
        .await?;

    Ok(())
}
