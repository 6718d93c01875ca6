//! Snapshot persistence with global content-hash dedup, plus the snapshot
//! and tenant read surface.
//!
//! [`SnapshotStore::persist`] is the only write path for snapshots and
//! messages, and it runs as one transaction: a snapshot is never partially
//! visible, and an abandoned run can never leave a half-written one. The
//! UNIQUE constraint on `message_hash` is the source of truth for dedup —
//! the application-level existence probe is an optimization only, and an
//! insert that loses the race simply counts as a skip.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::hash::message_hash;
use crate::models::{
    format_ts_iso, CollectedMessage, ExtractedFields, MessageDetail, Snapshot, StoredMessage,
    Tenant, TenantRecord,
};

/// Outcome of one persist call. `inserted` counts genuinely new rows;
/// duplicates are skipped silently.
#[derive(Debug, Clone, Copy)]
pub struct PersistReport {
    pub snapshot_id: i64,
    pub inserted: u64,
}

/// Storage handle for snapshots, messages, and the tenant registry.
/// Wraps the process-wide pool; cheap to clone.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a batch as one snapshot, deduplicating against the entire
    /// historical store by content hash.
    ///
    /// The snapshot row is created even when every record is a duplicate —
    /// an empty snapshot is the audit record that a collection ran.
    pub async fn persist(
        &self,
        label: Option<&str>,
        batch: &[CollectedMessage],
    ) -> Result<PersistReport> {
        let mut tx = self.pool.begin().await?;

        let now = chrono::Utc::now().timestamp();
        let snapshot_id = sqlx::query("INSERT INTO snapshots (created_at, label) VALUES (?, ?)")
            .bind(now)
            .bind(label)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let mut inserted = 0u64;
        for msg in batch {
            let hash = message_hash(&msg.payload);

            // Cheap existence probe; the constraint below still decides.
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE message_hash = ?)",
            )
            .bind(&hash)
            .fetch_one(&mut *tx)
            .await?;
            if exists {
                continue;
            }

            let fields = ExtractedFields::from_payload(&msg.payload);
            let result = sqlx::query(
                r#"
                INSERT INTO messages (
                    snapshot_id, tenant, user_principal, message_id, message_hash,
                    raw_json, eml_path, subject, from_address, received_at,
                    body_preview, has_attachments, attachment_count, importance
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(message_hash) DO NOTHING
                "#,
            )
            .bind(snapshot_id)
            .bind(&msg.tenant)
            .bind(&msg.user_principal)
            .bind(&msg.message_id)
            .bind(&hash)
            .bind(msg.payload.to_string())
            .bind(msg.eml_path.as_ref().map(|p| p.display().to_string()))
            .bind(&fields.subject)
            .bind(&fields.from_address)
            .bind(fields.received_at)
            .bind(&fields.body_preview)
            .bind(msg.has_attachments() as i64)
            .bind(msg.attachments.len() as i64)
            .bind(&fields.importance)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(PersistReport {
            snapshot_id,
            inserted,
        })
    }

    /// Most recent snapshots with their first-seen message counts.
    pub async fn list_snapshots(&self, limit: i64) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.created_at, s.label, COUNT(m.id) AS message_count
            FROM snapshots s
            LEFT JOIN messages m ON m.snapshot_id = s.id
            GROUP BY s.id
            ORDER BY s.created_at DESC, s.id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Snapshot {
                id: row.get("id"),
                created_at: format_ts_iso(row.get("created_at")),
                label: row.get("label"),
                message_count: row.get("message_count"),
            })
            .collect())
    }

    /// Messages first seen in a snapshot, or `None` when the snapshot does
    /// not exist.
    pub async fn snapshot_messages(&self, snapshot_id: i64) -> Result<Option<Vec<StoredMessage>>> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM snapshots WHERE id = ?)")
            .bind(snapshot_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT id, snapshot_id, tenant, user_principal, message_id, message_hash,
                   subject, from_address, received_at, body_preview,
                   has_attachments, attachment_count, importance, eml_path
            FROM messages WHERE snapshot_id = ? ORDER BY id ASC
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(rows.iter().map(stored_message_from_row).collect()))
    }

    /// One message with its raw remote payload.
    pub async fn message(&self, id: i64) -> Result<Option<MessageDetail>> {
        let row = sqlx::query(
            r#"
            SELECT id, snapshot_id, tenant, user_principal, message_id, message_hash,
                   subject, from_address, received_at, body_preview,
                   has_attachments, attachment_count, importance, eml_path, raw_json
            FROM messages WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let raw_json: String = row.get("raw_json");
            let raw = serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Null);
            MessageDetail {
                message: stored_message_from_row(&row),
                raw,
            }
        }))
    }

    /// Delete a snapshot; its messages cascade. Returns whether a row was
    /// deleted.
    pub async fn delete_snapshot(&self, snapshot_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(snapshot_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Tenant registry ============

    pub async fn create_tenant(&self, tenant: &Tenant) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO tenants (name, tenant_id, client_id, client_secret, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tenant.name)
        .bind(&tenant.tenant_id)
        .bind(&tenant.client_id)
        .bind(&tenant.client_secret)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Active tenants only, ordered by name.
    pub async fn list_tenants(&self) -> Result<Vec<TenantRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, tenant_id, client_id, client_secret, created_at, is_active
            FROM tenants WHERE is_active = 1 ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(tenant_record_from_row).collect())
    }

    pub async fn get_tenant(&self, id: i64) -> Result<Option<TenantRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, tenant_id, client_id, client_secret, created_at, is_active
            FROM tenants WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(tenant_record_from_row))
    }

    /// Soft delete: the row stays for audit, the tenant stops collecting.
    pub async fn deactivate_tenant(&self, id: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result =
            sqlx::query("UPDATE tenants SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Registry tenants in credential form, ready for a collection run.
    pub async fn tenants_for_collection(&self) -> Result<Vec<Tenant>> {
        Ok(self
            .list_tenants()
            .await?
            .iter()
            .map(TenantRecord::credentials)
            .collect())
    }
}

fn stored_message_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    let received_at: Option<i64> = row.get("received_at");
    StoredMessage {
        id: row.get("id"),
        snapshot_id: row.get("snapshot_id"),
        tenant: row.get("tenant"),
        user_principal: row.get("user_principal"),
        message_id: row.get("message_id"),
        message_hash: row.get("message_hash"),
        subject: row.get("subject"),
        from_address: row.get("from_address"),
        received_at: received_at.map(format_ts_iso),
        body_preview: row.get("body_preview"),
        has_attachments: row.get::<i64, _>("has_attachments") != 0,
        attachment_count: row.get("attachment_count"),
        importance: row.get("importance"),
        eml_path: row.get("eml_path"),
    }
}

fn tenant_record_from_row(row: &sqlx::sqlite::SqliteRow) -> TenantRecord {
    TenantRecord {
        id: row.get("id"),
        name: row.get("name"),
        tenant_id: row.get("tenant_id"),
        client_id: row.get("client_id"),
        client_secret: row.get("client_secret"),
        created_at: format_ts_iso(row.get("created_at")),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}
