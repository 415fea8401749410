//! Person and organization reconciliation.
//!
//! Decides create-vs-update against Pipedrive for a local record and
//! writes the remote identifier back only after the remote call
//! succeeded.
//!
//! # Double-create prevention
//!
//! Each local entity gets an async lock from a shared registry. Inside
//! the lock the record is re-read from the store before deciding, and
//! the identifier is persisted with a conditional write
//! ([`Store::link_contact_if_unlinked`]). Two triggers racing on the same
//! contact therefore serialize, and the second one sees the link and
//! issues an update. The conditional write also covers writers in other
//! processes sharing the database.
//!
//! If the remote create succeeded but the local write did not, the call
//! fails with [`SyncError::Inconsistent`] and the divergence is logged at
//! `error`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use pipesync_core::error::SyncError;
use pipesync_core::models::{
    normalize_org_name, LocalContact, LocalOrganization, SyncStatus,
};
use pipesync_core::remote::{RemoteOrganization, RemotePerson};
use pipesync_core::sanitize::SanitizeLimits;
use pipesync_core::store::Store;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::client::PipedriveClient;
use crate::discovery::FieldContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
    /// An existing remote record was found by lookup and linked.
    Matched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub remote_id: String,
    pub action: ReconcileAction,
}

/// Optional extras sent with a person create or update.
#[derive(Debug, Clone, Default)]
pub struct PersonEnrichment {
    pub owner_id: Option<String>,
    pub org_id: Option<String>,
    pub label: Option<String>,
    pub custom_fields: Map<String, Value>,
}

/// Result of reconciling one inbound remote person into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Created(String),
    Updated(String),
    /// An unlinked local contact matched by email and was linked.
    Linked(String),
}

impl InboundOutcome {
    pub fn contact_id(&self) -> &str {
        match self {
            InboundOutcome::Created(id)
            | InboundOutcome::Updated(id)
            | InboundOutcome::Linked(id) => id.as_str(),
        }
    }
}

/// Remote ids are numeric in Pipedrive; send them as numbers when they are.
pub fn remote_id_value(id: &str) -> Value {
    match id.trim().parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

/// Per-entity async locks, shared by every reconciliation caller.
///
/// An entry lives only while someone holds or waits on it.
#[derive(Default)]
pub struct EntityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EntityLocks {
    pub async fn acquire(&self, key: String) -> EntityGuard<'_> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        EntityGuard {
            locks: self,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock on one entity key. Dropping it releases the lock and
/// removes the key when nobody else is waiting.
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Clones are taken under the shard lock, so a count of one means
        // only the map still refers to this mutex.
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    client: PipedriveClient,
    limits: SanitizeLimits,
    locks: EntityLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, client: PipedriveClient, limits: SanitizeLimits) -> Self {
        Self {
            store,
            client,
            limits,
            locks: EntityLocks::default(),
        }
    }

    pub fn client(&self) -> &PipedriveClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn limits(&self) -> &SanitizeLimits {
        &self.limits
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// The default client, or one carrying the user's own token.
    pub fn client_for(&self, token: Option<&str>) -> PipedriveClient {
        match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => self.client.with_token(token),
            None => self.client.clone(),
        }
    }

    /// Build the outbound person payload from a contact.
    pub fn person_payload(&self, contact: &LocalContact, extra: &PersonEnrichment) -> Value {
        let mut payload = Map::new();
        payload.insert("name".into(), json!(self.limits.name(&contact.name)));
        if let Some(email) = contact.email.as_deref().filter(|e| !e.trim().is_empty()) {
            payload.insert(
                "email".into(),
                json!([{ "value": self.limits.email(email), "primary": true, "label": "work" }]),
            );
        }
        if let Some(phone) = contact.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            payload.insert(
                "phone".into(),
                json!([{ "value": self.limits.phone(phone), "primary": true, "label": "work" }]),
            );
        }
        if let Some(org) = extra.org_id.as_deref().or(contact.remote_org_id.as_deref()) {
            payload.insert("org_id".into(), remote_id_value(org));
        }
        if let Some(owner) = extra.owner_id.as_deref() {
            payload.insert("owner_id".into(), remote_id_value(owner));
        }
        if let Some(label) = extra.label.as_deref() {
            payload.insert("label".into(), remote_id_value(label));
        }
        for (key, value) in &extra.custom_fields {
            payload.insert(key.clone(), value.clone());
        }
        Value::Object(payload)
    }

    /// Reconcile a contact with the default client and no extras.
    pub async fn reconcile_person(&self, contact_id: &str) -> Result<ReconcileOutcome, SyncError> {
        self.reconcile_person_with(&self.client, contact_id, &PersonEnrichment::default())
            .await
    }

    /// Create the remote person if the contact is unlinked, else update it.
    pub async fn reconcile_person_with(
        &self,
        client: &PipedriveClient,
        contact_id: &str,
        extra: &PersonEnrichment,
    ) -> Result<ReconcileOutcome, SyncError> {
        let _guard = self.locks.acquire(format!("contact:{}", contact_id)).await;

        let contact = self
            .store
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", contact_id)))?;
        let payload = self.person_payload(&contact, extra);

        if let Some(remote_id) = contact.remote_person_id.clone() {
            return match client.update_person(&remote_id, &payload).await {
                Ok(_) => {
                    self.store
                        .set_contact_sync_state(contact_id, SyncStatus::Synced, Some(Utc::now()))
                        .await?;
                    Ok(ReconcileOutcome {
                        remote_id,
                        action: ReconcileAction::Updated,
                    })
                }
                Err(e) => {
                    self.mark_failed(contact_id).await;
                    Err(e.into())
                }
            };
        }

        let person = match client.create_person(&payload).await {
            Ok(person) => person,
            Err(e) => {
                self.mark_failed(contact_id).await;
                return Err(e.into());
            }
        };

        let org_id = extra
            .org_id
            .as_deref()
            .or(person.org_id.as_deref())
            .map(str::to_string);
        match self
            .store
            .link_contact_if_unlinked(contact_id, &person.id, org_id.as_deref(), Utc::now())
            .await
        {
            Ok(true) => {
                tracing::info!(contact_id, remote_person_id = %person.id, "created remote person");
                Ok(ReconcileOutcome {
                    remote_id: person.id,
                    action: ReconcileAction::Created,
                })
            }
            Ok(false) => {
                tracing::error!(
                    contact_id,
                    remote_person_id = %person.id,
                    "contact was linked by another writer after remote create"
                );
                Err(SyncError::Inconsistent(format!(
                    "remote person {} created but contact {} was already linked",
                    person.id, contact_id
                )))
            }
            Err(e) => {
                tracing::error!(
                    contact_id,
                    remote_person_id = %person.id,
                    error = %e,
                    "remote person created but local link failed"
                );
                Err(SyncError::Inconsistent(format!(
                    "remote person {} created but linking contact {} failed: {}",
                    person.id, contact_id, e
                )))
            }
        }
    }

    async fn mark_failed(&self, contact_id: &str) {
        if let Err(e) = self
            .store
            .set_contact_sync_state(contact_id, SyncStatus::Failed, None)
            .await
        {
            tracing::warn!(contact_id, error = %e, "could not record failed sync state");
        }
    }

    /// Reconcile an organization with the default client.
    pub async fn reconcile_organization(&self, org_id: &str) -> Result<ReconcileOutcome, SyncError> {
        self.reconcile_organization_with(&self.client, org_id, None)
            .await
    }

    /// Update a linked organization, or look it up by exact name before
    /// creating it.
    pub async fn reconcile_organization_with(
        &self,
        client: &PipedriveClient,
        org_id: &str,
        owner_id: Option<&str>,
    ) -> Result<ReconcileOutcome, SyncError> {
        let _guard = self.locks.acquire(format!("organization:{}", org_id)).await;

        let org = self
            .store
            .get_organization(org_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("organization {}", org_id)))?;
        let name = self.limits.organization(&org.name);
        if name.is_empty() {
            return Err(SyncError::Validation(format!(
                "organization {} has an empty name",
                org_id
            )));
        }
        let mut payload = json!({ "name": name });
        if let Some(owner) = owner_id {
            payload["owner_id"] = remote_id_value(owner);
        }

        if let Some(remote_id) = org.remote_org_id.clone() {
            client.update_organization(&remote_id, &payload).await?;
            return Ok(ReconcileOutcome {
                remote_id,
                action: ReconcileAction::Updated,
            });
        }

        let wanted = normalize_org_name(&name);
        let existing = client
            .search_organizations(&name, true)
            .await?
            .into_iter()
            .find(|o| normalize_org_name(&o.name) == wanted);

        let (remote, action) = match existing {
            Some(found) => (found, ReconcileAction::Matched),
            None => (
                client.create_organization(&payload).await?,
                ReconcileAction::Created,
            ),
        };

        match self
            .store
            .set_organization_remote_id_if_unset(org_id, &remote.id)
            .await
        {
            Ok(true) => {
                tracing::info!(org_id, remote_org_id = %remote.id, ?action, "linked organization");
                Ok(ReconcileOutcome {
                    remote_id: remote.id,
                    action,
                })
            }
            Ok(false) => {
                tracing::error!(org_id, remote_org_id = %remote.id, "organization linked concurrently");
                Err(SyncError::Inconsistent(format!(
                    "organization {} was linked by another writer",
                    org_id
                )))
            }
            Err(e) => {
                tracing::error!(
                    org_id,
                    remote_org_id = %remote.id,
                    error = %e,
                    "remote organization resolved but local link failed"
                );
                Err(SyncError::Inconsistent(format!(
                    "remote organization {} resolved but linking {} failed: {}",
                    remote.id, org_id, e
                )))
            }
        }
    }

    /// The contact's normalized organization, creating it from the
    /// free-text employer name when needed.
    pub async fn ensure_local_organization(
        &self,
        contact: &mut LocalContact,
    ) -> Result<Option<LocalOrganization>, SyncError> {
        if let Some(id) = contact.organization_id.as_deref() {
            if let Some(org) = self.store.get_organization(id).await? {
                return Ok(Some(org));
            }
        }
        let Some(name) = contact
            .organization
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        else {
            return Ok(None);
        };

        let _guard = self
            .locks
            .acquire(format!("organization-name:{}", normalize_org_name(name)))
            .await;
        let org = match self
            .store
            .find_organization_by_name(&normalize_org_name(name))
            .await?
        {
            Some(org) => org,
            None => {
                let org = LocalOrganization::new(name);
                self.store.insert_organization(&org).await?;
                org
            }
        };
        self.store.set_contact_organization(&contact.id, &org.id).await?;
        contact.organization_id = Some(org.id.clone());
        Ok(Some(org))
    }

    /// Bring one inbound remote person into the local store.
    pub async fn reconcile_remote_person(
        &self,
        person: &RemotePerson,
        org: Option<&RemoteOrganization>,
        fields: &FieldContext,
    ) -> Result<InboundOutcome, SyncError> {
        let _guard = self
            .locks
            .acquire(format!("remote-person:{}", person.id))
            .await;
        let now = Utc::now();

        let local_org = self.reconcile_remote_organization(person, org, fields).await?;

        let candidate = match self.store.find_contact_by_remote_person(&person.id).await? {
            Some(contact) => Some(contact.id),
            None => match person.primary_email() {
                Some(email) => self
                    .store
                    .find_contact_by_email(email)
                    .await?
                    .filter(|c| !c.is_linked())
                    .map(|c| c.id),
                None => None,
            },
        };

        // Outbound reconciliation and lifecycle changes hold the contact
        // lock; re-read under it so their writes are not overwritten.
        let mut _contact_guard = None;
        let mut existing = None;
        if let Some(contact_id) = candidate {
            _contact_guard = Some(self.locks.acquire(format!("contact:{}", contact_id)).await);
            existing = match self.store.get_contact(&contact_id).await? {
                Some(c) if c.remote_person_id.is_none() => Some((c, true)),
                Some(c) if c.remote_person_id.as_deref() == Some(person.id.as_str()) => {
                    Some((c, false))
                }
                Some(c) => {
                    tracing::debug!(
                        contact_id = %c.id,
                        remote_person_id = %person.id,
                        "email match was linked to another person meanwhile"
                    );
                    None
                }
                None => None,
            };
        }

        let outcome = match existing {
            Some((mut contact, needs_link)) => {
                apply_remote_person(&mut contact, person, local_org.as_ref(), fields);
                if needs_link {
                    let linked = self
                        .store
                        .link_contact_if_unlinked(&contact.id, &person.id, person.org_id.as_deref(), now)
                        .await?;
                    if !linked {
                        return Err(SyncError::Inconsistent(format!(
                            "contact {} was linked concurrently while importing person {}",
                            contact.id, person.id
                        )));
                    }
                }
                self.store.update_contact(&contact).await?;
                if needs_link {
                    InboundOutcome::Linked(contact.id)
                } else {
                    InboundOutcome::Updated(contact.id)
                }
            }
            None => {
                let mut contact = LocalContact::new(self.limits.name(&person.name));
                apply_remote_person(&mut contact, person, local_org.as_ref(), fields);
                contact.remote_person_id = Some(person.id.clone());
                contact.update_sync_status = SyncStatus::Synced;
                self.store.insert_contact(&contact).await?;
                InboundOutcome::Created(contact.id)
            }
        };

        if let (Some(mut org), InboundOutcome::Created(_) | InboundOutcome::Linked(_)) =
            (local_org, &outcome)
        {
            org.contact_count += 1;
            self.store.update_organization(&org).await?;
        }

        self.store
            .set_contact_sync_state(
                outcome.contact_id(),
                SyncStatus::Synced,
                Some(person.update_time.unwrap_or(now)),
            )
            .await?;
        Ok(outcome)
    }

    async fn reconcile_remote_organization(
        &self,
        person: &RemotePerson,
        org: Option<&RemoteOrganization>,
        fields: &FieldContext,
    ) -> Result<Option<LocalOrganization>, SyncError> {
        let Some(remote_org_id) = person.org_id.as_deref() else {
            return Ok(None);
        };
        let name = org
            .map(|o| o.name.as_str())
            .filter(|n| !n.trim().is_empty())
            .or(person.org_name.as_deref())
            .unwrap_or_default()
            .trim()
            .to_string();

        let mut local = match self.store.find_organization_by_remote_id(remote_org_id).await? {
            Some(local) => local,
            None if !name.is_empty() => {
                match self
                    .store
                    .find_organization_by_name(&normalize_org_name(&name))
                    .await?
                {
                    Some(local) if local.remote_org_id.is_none() => {
                        self.store
                            .set_organization_remote_id_if_unset(&local.id, remote_org_id)
                            .await?;
                        LocalOrganization {
                            remote_org_id: Some(remote_org_id.to_string()),
                            ..local
                        }
                    }
                    _ => {
                        let mut created = LocalOrganization::new(name.clone());
                        created.remote_org_id = Some(remote_org_id.to_string());
                        self.store.insert_organization(&created).await?;
                        created
                    }
                }
            }
            None => return Ok(None),
        };

        if let Some(org) = org {
            let mapping = &fields.organization_mapping;
            let translated = |key: &Option<String>| {
                fields.organization_value(key.as_deref(), key.as_deref().and_then(|k| org.field(k)))
            };
            if let Some(country) = translated(&mapping.country_field_key) {
                local.country = Some(country);
            }
            if let Some(sector) = translated(&mapping.sector_field_key) {
                local.industry = Some(sector);
            }
            if let Some(size) = translated(&mapping.size_field_key) {
                local.size = Some(size);
            }
            if !org.name.trim().is_empty() {
                local.name = org.name.trim().to_string();
                local.normalized_name = normalize_org_name(&local.name);
            }
            self.store.update_organization(&local).await?;
        }
        Ok(Some(local))
    }
}

/// Copy remote profile values onto a contact. Local values survive when
/// the remote side has none.
fn apply_remote_person(
    contact: &mut LocalContact,
    person: &RemotePerson,
    org: Option<&LocalOrganization>,
    fields: &FieldContext,
) {
    if !person.name.trim().is_empty() && person.name != "(unnamed)" {
        contact.name = person.name.trim().to_string();
    }
    if let Some(email) = person.primary_email() {
        contact.email = Some(email.to_string());
    }
    if let Some(phone) = person.primary_phone() {
        contact.phone = Some(phone.to_string());
    }
    if let Some(org) = org {
        contact.organization = Some(org.name.clone());
        contact.organization_id = Some(org.id.clone());
        contact.remote_org_id = org.remote_org_id.clone();
    } else if let Some(name) = person.org_name.as_deref() {
        contact.organization = Some(name.to_string());
    }
    if let Some(last) = fields
        .person_mapping
        .last_contacted_field_key
        .as_deref()
        .and_then(|k| person.field(k))
        .and_then(pipesync_core::remote::parse_remote_time)
    {
        contact.last_contacted = Some(last);
    }
    contact.last_remote_update = person.update_time;
}
