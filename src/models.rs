//! Core data models used throughout MailVault.
//!
//! These types represent the tenants, remote users, and messages that flow
//! through the collection and persistence pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tenant whose mailboxes are collected.
///
/// Credentials are secrets: `Debug` redacts the client secret so tenants can
/// be logged safely.
#[derive(Clone, Deserialize)]
pub struct Tenant {
    pub name: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("name", &self.name)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

/// A directory user resolved from the remote listing. Transient — never
/// persisted by the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUser {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(rename = "userPrincipalName")]
    pub user_principal_name: Option<String>,
}

impl RemoteUser {
    /// The principal used to label collected messages; falls back to the
    /// directory id when the principal name is absent.
    pub fn principal(&self) -> &str {
        self.user_principal_name.as_deref().unwrap_or(&self.id)
    }
}

/// Attachment metadata captured during collection.
///
/// `stored_path` is set when the content bytes were present and written to
/// the blob directory; metadata-only attachments leave it `None`.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub stored_path: Option<PathBuf>,
}

/// A message produced during collection, immutable once built. Held in
/// memory until the batch is persisted as a snapshot.
#[derive(Debug, Clone)]
pub struct CollectedMessage {
    pub tenant: String,
    pub user_principal: String,
    pub message_id: String,
    /// Full message record as returned by the remote listing.
    pub payload: Value,
    /// Path to the raw MIME blob, when the side fetch succeeded and a blob
    /// directory is configured.
    pub eml_path: Option<PathBuf>,
    pub attachments: Vec<AttachmentMeta>,
}

impl CollectedMessage {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
            || self
                .payload
                .get("hasAttachments")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

/// Identity-adjacent fields pulled out of a message payload for direct
/// column access (listing, search hand-off).
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub subject: Option<String>,
    pub from_address: Option<String>,
    /// Unix timestamp parsed from `receivedDateTime`.
    pub received_at: Option<i64>,
    pub body_preview: Option<String>,
    pub importance: String,
}

/// Body previews are capped to keep rows and index payloads small.
const BODY_PREVIEW_MAX: usize = 500;

impl ExtractedFields {
    pub fn from_payload(payload: &Value) -> Self {
        let subject = payload
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string);

        let from_address = payload
            .get("from")
            .and_then(|f| f.get("emailAddress"))
            .and_then(|e| e.get("address"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let received_at = payload
            .get("receivedDateTime")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());

        let body_preview = payload.get("bodyPreview").and_then(Value::as_str).map(|s| {
            let mut end = s.len().min(BODY_PREVIEW_MAX);
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            s[..end].to_string()
        });

        let importance = payload
            .get("importance")
            .and_then(Value::as_str)
            .unwrap_or("normal")
            .to_string();

        Self {
            subject,
            from_address,
            received_at,
            body_preview,
            importance,
        }
    }
}

/// A snapshot row: an immutable labeled batch boundary over deduplicated
/// stored messages.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: i64,
    /// ISO8601.
    pub created_at: String,
    pub label: Option<String>,
    /// Messages first seen in this snapshot.
    pub message_count: i64,
}

/// A stored message row as exposed on the read surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub snapshot_id: i64,
    pub tenant: String,
    pub user_principal: String,
    pub message_id: String,
    pub message_hash: String,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    /// ISO8601, when the remote supplied a parseable receive time.
    pub received_at: Option<String>,
    pub body_preview: Option<String>,
    pub has_attachments: bool,
    pub attachment_count: i64,
    pub importance: String,
    pub eml_path: Option<String>,
}

/// Full message detail including the raw remote payload.
#[derive(Debug, Clone, Serialize)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub message: StoredMessage,
    pub raw: Value,
}

/// A registered tenant row. Serialization skips the secret — registry
/// listings must never leak credentials.
#[derive(Debug, Clone, Serialize)]
pub struct TenantRecord {
    pub id: i64,
    pub name: String,
    pub tenant_id: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub created_at: String,
    pub is_active: bool,
}

impl TenantRecord {
    pub fn credentials(&self) -> Tenant {
        Tenant {
            name: self.name.clone(),
            tenant_id: self.tenant_id.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}

/// Format a Unix timestamp as an ISO8601 string for API and CLI output.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
