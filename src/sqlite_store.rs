//! SQLite-backed [`Store`].
//!
//! Timestamps are stored as Unix milliseconds. The two linking writes are
//! conditional `UPDATE ... WHERE ... IS NULL` statements whose affected
//! row count says whether this caller won.

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipesync_core::models::{
    ActivityType, AuditAction, AuditEntry, Campaign, LocalActivity, LocalContact,
    LocalOrganization, LocalUser, SyncStatus,
};
use pipesync_core::store::{ReplicationAttempt, Store};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::{db, migrate};

const CONTACT_COLUMNS: &str = "id, name, email, phone, organization, organization_id, \
     warmness_score, last_contacted, added_to_campaign, is_active, deactivated_at, \
     deactivated_by, deactivation_reason, remote_person_id, remote_org_id, \
     last_remote_update, update_sync_status, created_at, updated_at";

const ORG_COLUMNS: &str =
    "id, name, normalized_name, remote_org_id, industry, size, country, contact_count";

const ACTIVITY_COLUMNS: &str = "id, activity_type, subject, note, due_date, contact_id, \
     user_id, campaign_id, replicated_to_pipedrive, remote_activity_id, \
     pipedrive_sync_attempts, last_pipedrive_sync_attempt, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(millis)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

fn contact_from_row(row: &SqliteRow) -> Result<LocalContact> {
    let status: String = row.try_get("update_sync_status")?;
    Ok(LocalContact {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        organization: row.try_get("organization")?,
        organization_id: row.try_get("organization_id")?,
        warmness_score: row.try_get("warmness_score")?,
        last_contacted: opt_from_millis(row.try_get("last_contacted")?),
        added_to_campaign: row.try_get("added_to_campaign")?,
        is_active: row.try_get("is_active")?,
        deactivated_at: opt_from_millis(row.try_get("deactivated_at")?),
        deactivated_by: row.try_get("deactivated_by")?,
        deactivation_reason: row.try_get("deactivation_reason")?,
        remote_person_id: row.try_get("remote_person_id")?,
        remote_org_id: row.try_get("remote_org_id")?,
        last_remote_update: opt_from_millis(row.try_get("last_remote_update")?),
        update_sync_status: SyncStatus::from_str(&status)?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn org_from_row(row: &SqliteRow) -> Result<LocalOrganization> {
    Ok(LocalOrganization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        remote_org_id: row.try_get("remote_org_id")?,
        industry: row.try_get("industry")?,
        size: row.try_get("size")?,
        country: row.try_get("country")?,
        contact_count: row.try_get("contact_count")?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<LocalActivity> {
    let kind: String = row.try_get("activity_type")?;
    Ok(LocalActivity {
        id: row.try_get("id")?,
        activity_type: ActivityType::from_str(&kind)?,
        subject: row.try_get("subject")?,
        note: row.try_get("note")?,
        due_date: opt_from_millis(row.try_get("due_date")?),
        contact_id: row.try_get("contact_id")?,
        user_id: row.try_get("user_id")?,
        campaign_id: row.try_get("campaign_id")?,
        replicated_to_pipedrive: row.try_get("replicated_to_pipedrive")?,
        remote_activity_id: row.try_get("remote_activity_id")?,
        pipedrive_sync_attempts: row.try_get("pipedrive_sync_attempts")?,
        last_pipedrive_sync_attempt: opt_from_millis(row.try_get("last_pipedrive_sync_attempt")?),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn user_from_row(row: &SqliteRow) -> Result<LocalUser> {
    Ok(LocalUser {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        remote_user_id: row.try_get("remote_user_id")?,
        remote_api_token: row.try_get("remote_api_token")?,
    })
}

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    Ok(Campaign {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let action: String = row.try_get("action")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        action: AuditAction::from_str(&action)?,
        actor_id: row.try_get("actor_id")?,
        reason: row.try_get("reason")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_contact(&self, c: &LocalContact) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO contacts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            CONTACT_COLUMNS
        ))
        .bind(&c.id)
        .bind(&c.name)
        .bind(&c.email)
        .bind(&c.phone)
        .bind(&c.organization)
        .bind(&c.organization_id)
        .bind(c.warmness_score)
        .bind(opt_millis(c.last_contacted))
        .bind(c.added_to_campaign)
        .bind(c.is_active)
        .bind(opt_millis(c.deactivated_at))
        .bind(&c.deactivated_by)
        .bind(&c.deactivation_reason)
        .bind(&c.remote_person_id)
        .bind(&c.remote_org_id)
        .bind(opt_millis(c.last_remote_update))
        .bind(c.update_sync_status.as_str())
        .bind(millis(c.created_at))
        .bind(millis(c.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<LocalContact>> {
        let row = sqlx::query(&format!("SELECT {} FROM contacts WHERE id = ?", CONTACT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn list_contacts(&self, limit: i64, offset: i64) -> Result<Vec<LocalContact>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM contacts ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            CONTACT_COLUMNS
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contact_from_row).collect()
    }

    async fn find_contact_by_remote_person(
        &self,
        remote_person_id: &str,
    ) -> Result<Option<LocalContact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM contacts WHERE remote_person_id = ?",
            CONTACT_COLUMNS
        ))
        .bind(remote_person_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<LocalContact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM contacts WHERE lower(trim(email)) = ? ORDER BY created_at ASC LIMIT 1",
            CONTACT_COLUMNS
        ))
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn update_contact(&self, c: &LocalContact) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE contacts SET
                name = ?, email = ?, phone = ?, organization = ?, organization_id = ?,
                warmness_score = ?, last_contacted = ?, added_to_campaign = ?, is_active = ?,
                deactivated_at = ?, deactivated_by = ?, deactivation_reason = ?,
                remote_org_id = ?, last_remote_update = ?, update_sync_status = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&c.name)
        .bind(&c.email)
        .bind(&c.phone)
        .bind(&c.organization)
        .bind(&c.organization_id)
        .bind(c.warmness_score)
        .bind(opt_millis(c.last_contacted))
        .bind(c.added_to_campaign)
        .bind(c.is_active)
        .bind(opt_millis(c.deactivated_at))
        .bind(&c.deactivated_by)
        .bind(&c.deactivation_reason)
        .bind(&c.remote_org_id)
        .bind(opt_millis(c.last_remote_update))
        .bind(c.update_sync_status.as_str())
        .bind(millis(Utc::now()))
        .bind(&c.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("contact {} not found", c.id);
        }
        Ok(())
    }

    async fn set_contact_warmness(&self, contact_id: &str, score: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE contacts SET warmness_score = ?, updated_at = ? WHERE id = ?")
                .bind(score)
                .bind(millis(Utc::now()))
                .bind(contact_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_contact_organization(
        &self,
        contact_id: &str,
        organization_id: &str,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE contacts SET organization_id = ?, updated_at = ? WHERE id = ?")
                .bind(organization_id)
                .bind(millis(Utc::now()))
                .bind(contact_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("contact {} not found", contact_id);
        }
        Ok(())
    }

    async fn link_contact_if_unlinked(
        &self,
        contact_id: &str,
        remote_person_id: &str,
        remote_org_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contacts SET
                remote_person_id = ?,
                remote_org_id = COALESCE(?, remote_org_id),
                last_remote_update = ?,
                update_sync_status = 'SYNCED',
                updated_at = ?
            WHERE id = ? AND remote_person_id IS NULL
            "#,
        )
        .bind(remote_person_id)
        .bind(remote_org_id)
        .bind(millis(at))
        .bind(millis(at))
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_contact_sync_state(
        &self,
        contact_id: &str,
        status: SyncStatus,
        last_remote_update: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE contacts SET update_sync_status = ?, \
             last_remote_update = COALESCE(?, last_remote_update) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(opt_millis(last_remote_update))
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("contact {} not found", contact_id);
        }
        Ok(())
    }

    async fn insert_organization(&self, o: &LocalOrganization) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO organizations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            ORG_COLUMNS
        ))
        .bind(&o.id)
        .bind(&o.name)
        .bind(&o.normalized_name)
        .bind(&o.remote_org_id)
        .bind(&o.industry)
        .bind(&o.size)
        .bind(&o.country)
        .bind(o.contact_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_organization(&self, id: &str) -> Result<Option<LocalOrganization>> {
        let row = sqlx::query(&format!("SELECT {} FROM organizations WHERE id = ?", ORG_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn find_organization_by_name(
        &self,
        normalized_name: &str,
    ) -> Result<Option<LocalOrganization>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM organizations WHERE normalized_name = ? LIMIT 1",
            ORG_COLUMNS
        ))
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn find_organization_by_remote_id(
        &self,
        remote_org_id: &str,
    ) -> Result<Option<LocalOrganization>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM organizations WHERE remote_org_id = ?",
            ORG_COLUMNS
        ))
        .bind(remote_org_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn update_organization(&self, o: &LocalOrganization) -> Result<()> {
        let result = sqlx::query(
            "UPDATE organizations SET name = ?, normalized_name = ?, industry = ?, size = ?, \
             country = ?, contact_count = ? WHERE id = ?",
        )
        .bind(&o.name)
        .bind(&o.normalized_name)
        .bind(&o.industry)
        .bind(&o.size)
        .bind(&o.country)
        .bind(o.contact_count)
        .bind(&o.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("organization {} not found", o.id);
        }
        Ok(())
    }

    async fn set_organization_remote_id_if_unset(
        &self,
        org_id: &str,
        remote_org_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE organizations SET remote_org_id = ? WHERE id = ? AND remote_org_id IS NULL",
        )
        .bind(remote_org_id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_activity(&self, a: &LocalActivity) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO activities ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ACTIVITY_COLUMNS
        ))
        .bind(&a.id)
        .bind(a.activity_type.as_str())
        .bind(&a.subject)
        .bind(&a.note)
        .bind(opt_millis(a.due_date))
        .bind(&a.contact_id)
        .bind(&a.user_id)
        .bind(&a.campaign_id)
        .bind(a.replicated_to_pipedrive)
        .bind(&a.remote_activity_id)
        .bind(a.pipedrive_sync_attempts)
        .bind(opt_millis(a.last_pipedrive_sync_attempt))
        .bind(millis(a.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_activity(&self, id: &str) -> Result<Option<LocalActivity>> {
        let row = sqlx::query(&format!("SELECT {} FROM activities WHERE id = ?", ACTIVITY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(activity_from_row).transpose()
    }

    async fn list_activities_for_contact(&self, contact_id: &str) -> Result<Vec<LocalActivity>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM activities WHERE contact_id = ? ORDER BY created_at ASC",
            ACTIVITY_COLUMNS
        ))
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn count_future_activities(
        &self,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM activities WHERE contact_id = ? AND due_date > ?",
        )
        .bind(contact_id)
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn record_replication_attempt(
        &self,
        activity_id: &str,
        attempt: &ReplicationAttempt,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE activities SET
                pipedrive_sync_attempts = ?,
                last_pipedrive_sync_attempt = ?,
                remote_activity_id = COALESCE(?, remote_activity_id),
                replicated_to_pipedrive = CASE WHEN ? IS NULL THEN replicated_to_pipedrive ELSE 1 END
            WHERE id = ?
            "#,
        )
        .bind(attempt.attempts)
        .bind(millis(attempt.attempted_at))
        .bind(&attempt.remote_activity_id)
        .bind(&attempt.remote_activity_id)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("activity {} not found", activity_id);
        }
        Ok(())
    }

    async fn insert_user(&self, u: &LocalUser) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, email, remote_user_id, remote_api_token) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&u.id)
        .bind(&u.name)
        .bind(&u.email)
        .bind(&u.remote_user_id)
        .bind(&u.remote_api_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<LocalUser>> {
        let row = sqlx::query(
            "SELECT id, name, email, remote_user_id, remote_api_token FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<LocalUser>> {
        let row = sqlx::query(
            "SELECT id, name, email, remote_user_id, remote_api_token FROM users \
             WHERE lower(trim(email)) = ?",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_user_remote_id(&self, user_id: &str, remote_user_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET remote_user_id = ? WHERE id = ?")
            .bind(remote_user_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("user {} not found", user_id);
        }
        Ok(())
    }

    async fn insert_campaign(&self, c: &Campaign) -> Result<()> {
        sqlx::query("INSERT INTO campaigns (id, name, description, created_at) VALUES (?, ?, ?, ?)")
            .bind(&c.id)
            .bind(&c.name)
            .bind(&c.description)
            .bind(millis(c.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let row = sqlx::query("SELECT id, name, description, created_at FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(
            "SELECT id, name, description, created_at FROM campaigns ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn add_contact_to_campaign(&self, campaign_id: &str, contact_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO campaign_contacts (campaign_id, contact_id, added_at) VALUES (?, ?, ?) \
             ON CONFLICT(campaign_id, contact_id) DO NOTHING",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(millis(Utc::now()))
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE contacts SET added_to_campaign = 1 WHERE id = ?")
            .bind(contact_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_audit(&self, e: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_entries (id, contact_id, action, actor_id, reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.id)
        .bind(&e.contact_id)
        .bind(e.action.as_str())
        .bind(&e.actor_id)
        .bind(&e.reason)
        .bind(millis(e.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, contact_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, contact_id, action, actor_id, reason, created_at FROM audit_entries \
             WHERE contact_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    async fn set_checkpoint(&self, source: &str, cursor: &str) -> Result<()> {
        let now = millis(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(cursor)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
