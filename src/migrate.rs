use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create every table and index. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Users
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            remote_user_id TEXT,
            remote_api_token TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Organizations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            remote_org_id TEXT,
            industry TEXT,
            size TEXT,
            country TEXT,
            contact_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Contacts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            organization TEXT,
            organization_id TEXT REFERENCES organizations(id),
            warmness_score INTEGER NOT NULL DEFAULT 0,
            last_contacted INTEGER,
            added_to_campaign INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            deactivated_at INTEGER,
            deactivated_by TEXT,
            deactivation_reason TEXT,
            remote_person_id TEXT,
            remote_org_id TEXT,
            last_remote_update INTEGER,
            update_sync_status TEXT NOT NULL DEFAULT 'PENDING',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Campaigns and membership
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS campaign_contacts (
            campaign_id TEXT NOT NULL REFERENCES campaigns(id),
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            added_at INTEGER NOT NULL,
            PRIMARY KEY (campaign_id, contact_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Activities
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activities (
            id TEXT PRIMARY KEY,
            activity_type TEXT NOT NULL,
            subject TEXT NOT NULL,
            note TEXT,
            due_date INTEGER,
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            user_id TEXT NOT NULL,
            campaign_id TEXT,
            replicated_to_pipedrive INTEGER NOT NULL DEFAULT 0,
            remote_activity_id TEXT,
            pipedrive_sync_attempts INTEGER NOT NULL DEFAULT 0,
            last_pipedrive_sync_attempt INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lifecycle audit trail
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_entries (
            id TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            action TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            reason TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sync checkpoints
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_remote_person ON contacts(remote_person_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(lower(email))")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_organizations_remote ON organizations(remote_org_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_organizations_name ON organizations(normalized_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_activities_contact ON activities(contact_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_contact ON audit_entries(contact_id)")
        .execute(pool)
        .await?;

    Ok(())
}
