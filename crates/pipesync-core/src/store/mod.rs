//! Storage abstraction for the local CRM.
//!
//! The [`Store`] trait is the explicitly injected store handle every
//! service receives (`Arc<dyn Store>`). It covers only what the sync
//! core reads and writes; schema design beyond those fields is left to
//! the backend.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Linkage guards
//!
//! Two operations are conditional writes rather than blind updates:
//!
//! | Method | Writes only when |
//! |--------|------------------|
//! | [`link_contact_if_unlinked`](Store::link_contact_if_unlinked) | `remote_person_id` is still null |
//! | [`set_organization_remote_id_if_unset`](Store::set_organization_remote_id_if_unset) | `remote_org_id` is still null |
//!
//! Both return `false` when another writer got there first. Callers use
//! them instead of `update_*` to persist remote identifiers.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AuditEntry, Campaign, LocalActivity, LocalContact, LocalOrganization, LocalUser, SyncStatus,
};

/// Outcome of one replication attempt, persisted after every try.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationAttempt {
    pub attempts: i64,
    pub attempted_at: DateTime<Utc>,
    /// Set only when the attempt succeeded.
    pub remote_activity_id: Option<String>,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Contacts | insert, get, list, find by remote id / email, update, set warmness or organization, link, sync state |
/// | Organizations | insert, get, find by name / remote id, update, set remote id |
/// | Activities | insert, get, list, count future-due, record replication attempt |
/// | Users | insert, get, find by email, set remote user id |
/// | Campaigns | insert, get, list, add contact |
/// | Audit | append, list |
/// | Checkpoints | get, set |
#[async_trait]
pub trait Store: Send + Sync {
    // ── contacts ─────────────────────────────────────────────────────

    async fn insert_contact(&self, contact: &LocalContact) -> Result<()>;

    async fn get_contact(&self, id: &str) -> Result<Option<LocalContact>>;

    async fn list_contacts(&self, limit: i64, offset: i64) -> Result<Vec<LocalContact>>;

    async fn find_contact_by_remote_person(
        &self,
        remote_person_id: &str,
    ) -> Result<Option<LocalContact>>;

    /// Case-insensitive email lookup.
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<LocalContact>>;

    /// Overwrite profile and lifecycle fields.
    ///
    /// Never touches `remote_person_id`; use
    /// [`link_contact_if_unlinked`](Store::link_contact_if_unlinked).
    async fn update_contact(&self, contact: &LocalContact) -> Result<()>;

    /// Set only the warmness score. Returns `false` if the contact does
    /// not exist.
    async fn set_contact_warmness(&self, contact_id: &str, score: i64) -> Result<bool>;

    /// Point the contact at a normalized organization, leaving every other
    /// column alone.
    async fn set_contact_organization(&self, contact_id: &str, organization_id: &str)
        -> Result<()>;

    /// Set the remote person id only if the contact is still unlinked.
    ///
    /// Also records `remote_org_id` (when given), `last_remote_update`,
    /// and marks the contact `SYNCED`. Returns `false` if the contact was
    /// already linked or does not exist.
    async fn link_contact_if_unlinked(
        &self,
        contact_id: &str,
        remote_person_id: &str,
        remote_org_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn set_contact_sync_state(
        &self,
        contact_id: &str,
        status: SyncStatus,
        last_remote_update: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // ── organizations ────────────────────────────────────────────────

    async fn insert_organization(&self, org: &LocalOrganization) -> Result<()>;

    async fn get_organization(&self, id: &str) -> Result<Option<LocalOrganization>>;

    async fn find_organization_by_name(
        &self,
        normalized_name: &str,
    ) -> Result<Option<LocalOrganization>>;

    async fn find_organization_by_remote_id(
        &self,
        remote_org_id: &str,
    ) -> Result<Option<LocalOrganization>>;

    /// Overwrite descriptive fields. Never touches `remote_org_id`.
    async fn update_organization(&self, org: &LocalOrganization) -> Result<()>;

    async fn set_organization_remote_id_if_unset(
        &self,
        org_id: &str,
        remote_org_id: &str,
    ) -> Result<bool>;

    // ── activities ───────────────────────────────────────────────────

    async fn insert_activity(&self, activity: &LocalActivity) -> Result<()>;

    async fn get_activity(&self, id: &str) -> Result<Option<LocalActivity>>;

    async fn list_activities_for_contact(&self, contact_id: &str) -> Result<Vec<LocalActivity>>;

    /// Number of the contact's activities due strictly after `now`.
    async fn count_future_activities(&self, contact_id: &str, now: DateTime<Utc>)
        -> Result<i64>;

    /// Persist attempt bookkeeping; marks the activity replicated when
    /// `attempt.remote_activity_id` is set.
    async fn record_replication_attempt(
        &self,
        activity_id: &str,
        attempt: &ReplicationAttempt,
    ) -> Result<()>;

    // ── users ────────────────────────────────────────────────────────

    async fn insert_user(&self, user: &LocalUser) -> Result<()>;

    async fn get_user(&self, id: &str) -> Result<Option<LocalUser>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<LocalUser>>;

    async fn set_user_remote_id(&self, user_id: &str, remote_user_id: &str) -> Result<()>;

    // ── campaigns ────────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;

    async fn list_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Record membership and set the contact's `added_to_campaign` flag.
    async fn add_contact_to_campaign(&self, campaign_id: &str, contact_id: &str) -> Result<()>;

    // ── audit ────────────────────────────────────────────────────────

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    async fn list_audit(&self, contact_id: &str) -> Result<Vec<AuditEntry>>;

    // ── checkpoints ──────────────────────────────────────────────────

    async fn get_checkpoint(&self, source: &str) -> Result<Option<String>>;

    async fn set_checkpoint(&self, source: &str, cursor: &str) -> Result<()>;
}
