//! Interval-based background collection runs.
//!
//! When enabled, `mvault serve` schedules a full collection run every
//! `interval_hours`. Each run is a normal tracked task, so it shows up in
//! the runs API like a manually submitted one.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::indexer::SearchIndexer;
use crate::runner::{run_collection, RunOptions};
use crate::store::SnapshotStore;
use crate::task::TaskRegistry;

/// Start the scheduler loop, or return `None` when disabled.
pub fn start(
    config: Arc<Config>,
    store: SnapshotStore,
    indexer: Arc<dyn SearchIndexer>,
    tasks: Arc<TaskRegistry>,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.scheduler.enabled {
        return None;
    }

    let interval = Duration::from_secs(config.scheduler.interval_hours * 3600);
    info!(
        interval_hours = config.scheduler.interval_hours,
        "scheduler started"
    );

    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let task = tasks.create();
            info!(task_id = %task.id(), "scheduled collection run starting");
            run_collection(
                config.clone(),
                store.clone(),
                indexer.clone(),
                task.clone(),
                RunOptions {
                    label: Some("scheduled".to_string()),
                    ..Default::default()
                },
            )
            .await;
            info!(task_id = %task.id(), state = task.status().state.label(), "scheduled collection run finished");
        }
    }))
}
