//! Composition root (§9 "a single process-wide root struct... assembled
//! once at startup"). Wiring follows the teacher's
//! `gproxy_core::bootstrap::bootstrap` shape: resolve config (CLI > ENV >
//! DB), connect storage, warm the in-memory model, build the client, hand
//! everything to the router.

mod cli;
mod dsn;
mod spending;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use autorouter_common::{GlobalConfig, GlobalConfigPatch};
use autorouter_core::auth::hash_presented_key;
use autorouter_core::bootstrap::{
    build_compensation_rules, build_decrypt_secret, build_price_lookup, build_registry_snapshot,
};
use autorouter_core::engine::DispatchContext;
use autorouter_core::registry::UpstreamRegistry;
use autorouter_core::state::AppState;
use autorouter_router::admin::{admin_router, AdminState};
use autorouter_router::proxy::proxy_router;
use autorouter_storage::{LogEmitter, Storage};

use spending::StorageSpendingAggregator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = cli::Cli::parse();
    let dsn = dsn::resolve_dsn(cli.dsn.as_deref().unwrap_or(""), &cli.data_dir)
        .map_err(|err| anyhow::anyhow!("resolve dsn: {err}"))?;

    let storage = Storage::connect(&dsn).await.context("connect storage")?;
    storage.sync().await.context("schema sync")?;

    let snapshot = storage.load_snapshot().await.context("load snapshot")?;

    let mut merged = snapshot
        .global_config
        .as_ref()
        .map(|row| GlobalConfigPatch::from(row.config.clone()))
        .unwrap_or_default();

    let admin_key_hash = match cli.admin_key.as_deref() {
        Some(plaintext) => Some(hash_presented_key(plaintext)),
        None if merged.admin_key_hash.is_none() => {
            let generated = uuid::Uuid::new_v4().to_string();
            eprintln!("generated admin key: {generated}");
            Some(hash_presented_key(&generated))
        }
        None => None,
    };

    let cli_patch = GlobalConfigPatch {
        host: cli.host.clone(),
        port: cli.port,
        admin_key_hash,
        proxy: cli.proxy.clone(),
        dsn: Some(dsn.clone()),
        event_redact_sensitive: cli.event_redact_sensitive,
        encryption_key: cli.encryption_key.clone(),
        ..Default::default()
    };
    merged.overlay(cli_patch);

    let config: GlobalConfig = merged.into_config().context("finalize global config")?;
    storage
        .persist_global_config(&config)
        .await
        .context("persist global config")?;

    let (registry_snapshot, skipped_upstreams) = build_registry_snapshot(&snapshot);
    for (upstream_id, err) in &skipped_upstreams {
        tracing::warn!(upstream_id, error = %err, "dropping upstream with malformed config");
    }
    let (compensation_rules, skipped_rules) = build_compensation_rules(&snapshot);
    for (rule_id, err) in &skipped_rules {
        tracing::warn!(rule_id, error = %err, "dropping malformed compensation rule");
    }
    let price_for_model = build_price_lookup(&snapshot);
    let decrypt_secret = build_decrypt_secret(config.encryption_key.clone());

    let mut client_builder = wreq::Client::builder();
    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = wreq::Proxy::all(proxy_url).context("build outbound proxy")?;
        client_builder = client_builder.proxy(proxy);
    }
    let client = client_builder.build().context("build http client")?;

    let registry = UpstreamRegistry::new(registry_snapshot);
    let bind = format!("{}:{}", config.host, config.port);

    let app_state = Arc::new(AppState::new(config, registry, client));

    let aggregator = Arc::new(StorageSpendingAggregator::new(
        storage.connection().clone(),
    ));
    app_state.spawn_background_tasks(aggregator);

    let log_emitter = LogEmitter::spawn(storage.connection().clone());
    let dispatch_ctx = Arc::new(DispatchContext {
        app: app_state.clone(),
        log_emitter,
        decrypt_secret,
        compensation_rules,
        header_deny_list: Vec::new(),
        price_for_model,
    });

    let admin_state = AdminState {
        app: app_state,
        storage,
    };

    let app = proxy_router(dispatch_ctx).nest("/admin", admin_router(admin_state));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
