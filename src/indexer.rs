//! Search indexer hand-off.
//!
//! The indexer is a downstream consumer, never authoritative: the runner
//! fires an indexing call after a successful persist and moves on. A failed
//! hand-off is logged and does not fail the run.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::config::IndexerConfig;
use crate::hash::message_hash;
use crate::models::{CollectedMessage, ExtractedFields};

#[async_trait]
pub trait SearchIndexer: Send + Sync {
    fn name(&self) -> &str;

    /// Index a snapshot's messages. Best-effort; the caller ignores the
    /// result beyond logging.
    async fn index(&self, snapshot_id: i64, messages: &[CollectedMessage]) -> Result<()>;
}

/// No-op indexer used when `indexer.provider = "disabled"`.
pub struct DisabledIndexer;

#[async_trait]
impl SearchIndexer for DisabledIndexer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn index(&self, _snapshot_id: i64, _messages: &[CollectedMessage]) -> Result<()> {
        Ok(())
    }
}

/// Meilisearch indexer. Documents use the message content hash as primary
/// key, so re-indexing after an overlapping run is idempotent.
///
/// The API key is read from `MEILI_MASTER_KEY`; an unset key sends no
/// Authorization header (local dev instances).
pub struct MeiliIndexer {
    url: String,
    index: String,
    http: reqwest::Client,
}

impl MeiliIndexer {
    pub fn new(config: &IndexerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("indexer.url required for meilisearch"))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl SearchIndexer for MeiliIndexer {
    fn name(&self) -> &str {
        "meilisearch"
    }

    async fn index(&self, snapshot_id: i64, messages: &[CollectedMessage]) -> Result<()> {
        let documents: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                let fields = ExtractedFields::from_payload(&msg.payload);
                json!({
                    "id": message_hash(&msg.payload),
                    "snapshot_id": snapshot_id,
                    "tenant": msg.tenant,
                    "user_principal": msg.user_principal,
                    "message_id": msg.message_id,
                    "subject": fields.subject,
                    "from_address": fields.from_address,
                    "received_at": fields.received_at,
                    "body_preview": fields.body_preview,
                    "has_attachments": msg.has_attachments(),
                    "importance": fields.importance,
                })
            })
            .collect();

        if documents.is_empty() {
            return Ok(());
        }

        let url = format!("{}/indexes/{}/documents", self.url, self.index);
        let mut request = self.http.post(&url).json(&documents);
        if let Ok(key) = std::env::var("MEILI_MASTER_KEY") {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            bail!("indexer returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

/// Build the configured indexer.
pub fn create_indexer(config: &IndexerConfig) -> Result<Arc<dyn SearchIndexer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledIndexer)),
        "meilisearch" => Ok(Arc::new(MeiliIndexer::new(config)?)),
        other => bail!("Unknown indexer provider: {}", other),
    }
}
