use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Tenant;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Tenants defined inline. The database registry (`mvault tenants`) is
    /// merged with these at run time.
    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Remote mail API endpoints. The defaults target Microsoft Graph; tests
/// point both URLs at a stub server.
#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Server page size requested via `$top`.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            authority: default_authority(),
            scope: default_scope(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}
fn default_scope() -> String {
    "https://graph.microsoft.com/.default".to_string()
}
fn default_page_size() -> u64 {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    /// Message quota per mailbox per run; unbounded when absent.
    #[serde(default = "default_mails_per_user")]
    pub mails_per_user: Option<u64>,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    /// Directory for raw MIME blobs and attachment content. Disabled when
    /// absent — messages are still collected, metadata-only.
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
    /// Whole-run retries applied by the task runner, never to sub-steps.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            mails_per_user: default_mails_per_user(),
            include_attachments: true,
            blob_dir: None,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_mails_per_user() -> Option<u64> {
    Some(200)
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Search indexer hand-off. Fire-and-forget; never authoritative.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_index_name")]
    pub index: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            index: default_index_name(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_index_name() -> String {
    "mailvault_messages".to_string()
}

impl IndexerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: default_interval_hours(),
        }
    }
}

fn default_interval_hours() -> u64 {
    6
}

/// A tenant entry from the config file. Credential fields may be omitted and
/// supplied via `MAILVAULT_TENANT_ID`, `MAILVAULT_CLIENT_ID`, and
/// `MAILVAULT_CLIENT_SECRET` instead, so secrets can stay out of the file.
#[derive(Debug, Deserialize, Clone)]
pub struct TenantEntry {
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl TenantEntry {
    pub fn resolve(&self) -> Result<Tenant> {
        let tenant_id = resolve_field(&self.tenant_id, "MAILVAULT_TENANT_ID")
            .with_context(|| format!("tenant '{}': tenant_id not configured", self.name))?;
        let client_id = resolve_field(&self.client_id, "MAILVAULT_CLIENT_ID")
            .with_context(|| format!("tenant '{}': client_id not configured", self.name))?;
        let client_secret = resolve_field(&self.client_secret, "MAILVAULT_CLIENT_SECRET")
            .with_context(|| format!("tenant '{}': client_secret not configured", self.name))?;
        Ok(Tenant {
            name: self.name.clone(),
            tenant_id,
            client_id,
            client_secret,
        })
    }
}

fn resolve_field(value: &Option<String>, env_var: &str) -> Result<String> {
    if let Some(v) = value {
        return Ok(v.clone());
    }
    std::env::var(env_var).with_context(|| format!("{} not set", env_var))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.graph.page_size == 0 {
        anyhow::bail!("graph.page_size must be > 0");
    }

    if config.scheduler.enabled && config.scheduler.interval_hours == 0 {
        anyhow::bail!("scheduler.interval_hours must be > 0 when the scheduler is enabled");
    }

    match config.indexer.provider.as_str() {
        "disabled" => {}
        "meilisearch" => {
            if config.indexer.url.is_none() {
                anyhow::bail!("indexer.url must be set when provider is 'meilisearch'");
            }
        }
        other => anyhow::bail!(
            "Unknown indexer provider: '{}'. Must be disabled or meilisearch.",
            other
        ),
    }

    Ok(config)
}
