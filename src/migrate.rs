use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema. Idempotent — `mvault init` can be run repeatedly.
///
/// The UNIQUE constraint on `messages.message_hash` is the global dedup
/// guarantee: it spans every snapshot ever taken and closes the
/// check-then-insert race between concurrent persist calls.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            label TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
            tenant TEXT NOT NULL,
            user_principal TEXT NOT NULL,
            message_id TEXT NOT NULL,
            message_hash TEXT NOT NULL,
            raw_json TEXT NOT NULL,
            eml_path TEXT,
            subject TEXT,
            from_address TEXT,
            received_at INTEGER,
            body_preview TEXT,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            attachment_count INTEGER NOT NULL DEFAULT 0,
            importance TEXT NOT NULL DEFAULT 'normal',
            UNIQUE(message_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            client_secret TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(tenant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_snapshot_id ON messages(snapshot_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_tenant ON messages(tenant)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_received_at ON messages(received_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
