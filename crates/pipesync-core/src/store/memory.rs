//! In-memory [`Store`] implementation for tests and fakes.
//!
//! Uses `HashMap`s behind `parking_lot::RwLock`. Conditional writes hold
//! the write lock across check and update, which gives them the same
//! single-writer semantics as the SQL `UPDATE ... WHERE ... IS NULL`.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::{
    AuditEntry, Campaign, LocalActivity, LocalContact, LocalOrganization, LocalUser, SyncStatus,
};

use super::{ReplicationAttempt, Store};

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    contacts: RwLock<HashMap<String, LocalContact>>,
    organizations: RwLock<HashMap<String, LocalOrganization>>,
    activities: RwLock<HashMap<String, LocalActivity>>,
    users: RwLock<HashMap<String, LocalUser>>,
    campaigns: RwLock<HashMap<String, Campaign>>,
    memberships: RwLock<HashSet<(String, String)>>,
    audit: RwLock<Vec<AuditEntry>>,
    checkpoints: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_contact(&self, contact: &LocalContact) -> Result<()> {
        let mut contacts = self.contacts.write();
        if contacts.contains_key(&contact.id) {
            anyhow::bail!("contact {} already exists", contact.id);
        }
        contacts.insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<LocalContact>> {
        Ok(self.contacts.read().get(id).cloned())
    }

    async fn list_contacts(&self, limit: i64, offset: i64) -> Result<Vec<LocalContact>> {
        let mut all: Vec<LocalContact> = self.contacts.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn find_contact_by_remote_person(
        &self,
        remote_person_id: &str,
    ) -> Result<Option<LocalContact>> {
        Ok(self
            .contacts
            .read()
            .values()
            .find(|c| c.remote_person_id.as_deref() == Some(remote_person_id))
            .cloned())
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<LocalContact>> {
        let wanted = email.trim().to_lowercase();
        Ok(self
            .contacts
            .read()
            .values()
            .find(|c| c.email.as_deref().map(|e| e.trim().to_lowercase()) == Some(wanted.clone()))
            .cloned())
    }

    async fn update_contact(&self, contact: &LocalContact) -> Result<()> {
        let mut contacts = self.contacts.write();
        let Some(existing) = contacts.get_mut(&contact.id) else {
            anyhow::bail!("contact {} not found", contact.id);
        };
        let remote_person_id = existing.remote_person_id.clone();
        *existing = contact.clone();
        existing.remote_person_id = remote_person_id;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn set_contact_warmness(&self, contact_id: &str, score: i64) -> Result<bool> {
        let mut contacts = self.contacts.write();
        let Some(c) = contacts.get_mut(contact_id) else {
            return Ok(false);
        };
        c.warmness_score = score;
        c.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_contact_organization(
        &self,
        contact_id: &str,
        organization_id: &str,
    ) -> Result<()> {
        let mut contacts = self.contacts.write();
        let Some(c) = contacts.get_mut(contact_id) else {
            anyhow::bail!("contact {} not found", contact_id);
        };
        c.organization_id = Some(organization_id.to_string());
        c.updated_at = Utc::now();
        Ok(())
    }

    async fn link_contact_if_unlinked(
        &self,
        contact_id: &str,
        remote_person_id: &str,
        remote_org_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut contacts = self.contacts.write();
        match contacts.get_mut(contact_id) {
            Some(c) if c.remote_person_id.is_none() => {
                c.remote_person_id = Some(remote_person_id.to_string());
                if let Some(org) = remote_org_id {
                    c.remote_org_id = Some(org.to_string());
                }
                c.last_remote_update = Some(at);
                c.update_sync_status = SyncStatus::Synced;
                c.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_contact_sync_state(
        &self,
        contact_id: &str,
        status: SyncStatus,
        last_remote_update: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut contacts = self.contacts.write();
        let Some(c) = contacts.get_mut(contact_id) else {
            anyhow::bail!("contact {} not found", contact_id);
        };
        c.update_sync_status = status;
        if last_remote_update.is_some() {
            c.last_remote_update = last_remote_update;
        }
        Ok(())
    }

    async fn insert_organization(&self, org: &LocalOrganization) -> Result<()> {
        let mut orgs = self.organizations.write();
        if let Some(remote) = &org.remote_org_id {
            if orgs
                .values()
                .any(|o| o.remote_org_id.as_deref() == Some(remote.as_str()))
            {
                anyhow::bail!("remote organization {} already linked", remote);
            }
        }
        orgs.insert(org.id.clone(), org.clone());
        Ok(())
    }

    async fn get_organization(&self, id: &str) -> Result<Option<LocalOrganization>> {
        Ok(self.organizations.read().get(id).cloned())
    }

    async fn find_organization_by_name(
        &self,
        normalized_name: &str,
    ) -> Result<Option<LocalOrganization>> {
        Ok(self
            .organizations
            .read()
            .values()
            .find(|o| o.normalized_name == normalized_name)
            .cloned())
    }

    async fn find_organization_by_remote_id(
        &self,
        remote_org_id: &str,
    ) -> Result<Option<LocalOrganization>> {
        Ok(self
            .organizations
            .read()
            .values()
            .find(|o| o.remote_org_id.as_deref() == Some(remote_org_id))
            .cloned())
    }

    async fn update_organization(&self, org: &LocalOrganization) -> Result<()> {
        let mut orgs = self.organizations.write();
        let Some(existing) = orgs.get_mut(&org.id) else {
            anyhow::bail!("organization {} not found", org.id);
        };
        let remote = existing.remote_org_id.clone();
        *existing = org.clone();
        existing.remote_org_id = remote;
        Ok(())
    }

    async fn set_organization_remote_id_if_unset(
        &self,
        org_id: &str,
        remote_org_id: &str,
    ) -> Result<bool> {
        let mut orgs = self.organizations.write();
        if orgs
            .values()
            .any(|o| o.id != org_id && o.remote_org_id.as_deref() == Some(remote_org_id))
        {
            anyhow::bail!("remote organization {} already linked", remote_org_id);
        }
        match orgs.get_mut(org_id) {
            Some(o) if o.remote_org_id.is_none() => {
                o.remote_org_id = Some(remote_org_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_activity(&self, activity: &LocalActivity) -> Result<()> {
        self.activities
            .write()
            .insert(activity.id.clone(), activity.clone());
        Ok(())
    }

    async fn get_activity(&self, id: &str) -> Result<Option<LocalActivity>> {
        Ok(self.activities.read().get(id).cloned())
    }

    async fn list_activities_for_contact(&self, contact_id: &str) -> Result<Vec<LocalActivity>> {
        let mut list: Vec<LocalActivity> = self
            .activities
            .read()
            .values()
            .filter(|a| a.contact_id == contact_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn count_future_activities(
        &self,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|a| a.contact_id == contact_id && a.due_date.is_some_and(|d| d > now))
            .count() as i64)
    }

    async fn record_replication_attempt(
        &self,
        activity_id: &str,
        attempt: &ReplicationAttempt,
    ) -> Result<()> {
        let mut activities = self.activities.write();
        let Some(a) = activities.get_mut(activity_id) else {
            anyhow::bail!("activity {} not found", activity_id);
        };
        a.pipedrive_sync_attempts = attempt.attempts;
        a.last_pipedrive_sync_attempt = Some(attempt.attempted_at);
        if let Some(remote) = &attempt.remote_activity_id {
            a.remote_activity_id = Some(remote.clone());
            a.replicated_to_pipedrive = true;
        }
        Ok(())
    }

    async fn insert_user(&self, user: &LocalUser) -> Result<()> {
        self.users.write().insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<LocalUser>> {
        Ok(self.users.read().get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<LocalUser>> {
        let wanted = email.trim().to_lowercase();
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.email.trim().to_lowercase() == wanted)
            .cloned())
    }

    async fn set_user_remote_id(&self, user_id: &str, remote_user_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let Some(u) = users.get_mut(user_id) else {
            anyhow::bail!("user {} not found", user_id);
        };
        u.remote_user_id = Some(remote_user_id.to_string());
        Ok(())
    }

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.campaigns
            .write()
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.campaigns.read().get(id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let mut list: Vec<Campaign> = self.campaigns.read().values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn add_contact_to_campaign(&self, campaign_id: &str, contact_id: &str) -> Result<()> {
        if !self.campaigns.read().contains_key(campaign_id) {
            anyhow::bail!("campaign {} not found", campaign_id);
        }
        {
            let mut contacts = self.contacts.write();
            let Some(c) = contacts.get_mut(contact_id) else {
                anyhow::bail!("contact {} not found", contact_id);
            };
            c.added_to_campaign = true;
        }
        self.memberships
            .write()
            .insert((campaign_id.to_string(), contact_id.to_string()));
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.write().push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, contact_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| e.contact_id == contact_id)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Option<String>> {
        Ok(self.checkpoints.read().get(source).cloned())
    }

    async fn set_checkpoint(&self, source: &str, cursor: &str) -> Result<()> {
        self.checkpoints
            .write()
            .insert(source.to_string(), cursor.to_string());
        Ok(())
    }
}
