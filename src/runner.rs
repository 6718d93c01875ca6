//! Asynchronous collection runs.
//!
//! Wraps the collect → persist pipeline in a tracked task: per-tenant
//! collection with progress transitions, one persist call for the aggregated
//! batch, and a fire-and-forget index hand-off. Retries apply to the entire
//! collect-and-persist call — never to sub-steps — which is safe because
//! persist is idempotent under dedup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;
use tracing::{error, info, warn};

use crate::collector::{collect_tenant, CollectOptions};
use crate::config::Config;
use crate::indexer::SearchIndexer;
use crate::models::Tenant;
use crate::store::SnapshotStore;
use crate::task::TaskHandle;

/// Caller overrides for one run. Absent fields fall back to config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub label: Option<String>,
    /// Restrict the run to one named tenant.
    pub tenant: Option<String>,
    pub mails_per_user: Option<u64>,
    pub include_attachments: Option<bool>,
}

/// Execute a collection run to completion, driving `task` through its
/// lifecycle. Always terminates the task: Success with the run report or
/// Failure with the unrecovered error.
pub async fn run_collection(
    config: Arc<Config>,
    store: SnapshotStore,
    indexer: Arc<dyn SearchIndexer>,
    task: TaskHandle,
    opts: RunOptions,
) {
    let max_retries = config.collection.max_retries;
    let mut attempt = 0u32;

    loop {
        match run_once(&config, &store, &indexer, &task, &opts).await {
            Ok(result) => {
                task.succeed(result);
                return;
            }
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(error = %e, attempt, "collection run failed, retrying");
                task.progress(
                    "retrying",
                    0,
                    format!("Attempt {} failed: {}; retrying", attempt, e),
                );
                tokio::time::sleep(Duration::from_secs(config.collection.retry_delay_secs)).await;
            }
            Err(e) => {
                error!(error = %e, "collection run failed");
                task.fail(e.to_string());
                return;
            }
        }
    }
}

/// One collect-and-persist pass over the resolved tenant set.
async fn run_once(
    config: &Config,
    store: &SnapshotStore,
    indexer: &Arc<dyn SearchIndexer>,
    task: &TaskHandle,
    opts: &RunOptions,
) -> Result<serde_json::Value> {
    let tenants = resolve_tenants(config, store, opts).await?;
    task.progress(
        "starting",
        5,
        format!("Found {} tenant(s) to collect", tenants.len()),
    );

    let mut collect_opts = CollectOptions::from_config(config);
    if let Some(quota) = opts.mails_per_user {
        collect_opts.mails_per_user = Some(quota);
    }
    if let Some(attachments) = opts.include_attachments {
        collect_opts.include_attachments = attachments;
    }

    let mut all_messages = Vec::new();
    let mut tenant_results = Vec::new();
    let total = tenants.len() as u64;

    for (i, tenant) in tenants.iter().enumerate() {
        // Collection occupies the 10..80 band of the overall run.
        let lo = 10 + (i as u64 * 70 / total) as u8;
        let hi = 10 + ((i as u64 + 1) * 70 / total) as u8;
        let outcome = collect_tenant(&config.graph, tenant, &collect_opts, task, (lo, hi)).await;

        if outcome.errors.iter().any(|e| e.is_tenant_fatal()) {
            warn!(tenant = %outcome.tenant, "tenant collection aborted, continuing batch");
        }

        tenant_results.push(json!({
            "name": outcome.tenant,
            "messages": outcome.messages.len(),
            "errors": outcome
                .errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>(),
        }));
        all_messages.extend(outcome.messages);
    }

    task.progress(
        "storing",
        85,
        format!("Storing {} messages in the snapshot store", all_messages.len()),
    );
    let report = store.persist(opts.label.as_deref(), &all_messages).await?;
    info!(
        snapshot_id = report.snapshot_id,
        collected = all_messages.len(),
        inserted = report.inserted,
        "snapshot stored"
    );

    // Fire-and-forget: the indexer is never authoritative and must not fail
    // the run.
    let indexer = indexer.clone();
    let snapshot_id = report.snapshot_id;
    let collected = all_messages.len();
    tokio::spawn(async move {
        if let Err(e) = indexer.index(snapshot_id, &all_messages).await {
            warn!(snapshot_id, error = %e, "search index hand-off failed");
        }
    });

    Ok(json!({
        "snapshot_id": report.snapshot_id,
        "messages_collected": collected,
        "messages_inserted": report.inserted,
        "label": opts.label,
        "tenants": tenant_results,
    }))
}

/// Merge config tenants with the database registry, then apply the
/// single-tenant restriction if any.
async fn resolve_tenants(
    config: &Config,
    store: &SnapshotStore,
    opts: &RunOptions,
) -> Result<Vec<Tenant>> {
    let mut tenants: Vec<Tenant> = Vec::new();

    for entry in &config.tenants {
        match entry.resolve() {
            Ok(tenant) => tenants.push(tenant),
            Err(e) => warn!(tenant = %entry.name, "skipping unresolvable tenant: {:#}", e),
        }
    }
    tenants.extend(store.tenants_for_collection().await?);

    if let Some(name) = &opts.tenant {
        tenants.retain(|t| &t.name == name);
        if tenants.is_empty() {
            bail!("no tenant named '{}' is configured", name);
        }
    }
    if tenants.is_empty() {
        bail!("no tenants configured");
    }

    Ok(tenants)
}
