//! Contact deactivation and reactivation.
//!
//! A contact is either active or inactive. Both transitions are
//! remote-first: when remote sync is requested and the contact is linked,
//! the Pipedrive "still active" field is updated before the local row
//! flips, and a remote failure leaves the local state untouched.
//!
//! Deactivation is blocked while the contact has activities due in the
//! future. Each successful transition appends an [`AuditEntry`].

use std::sync::Arc;

use chrono::Utc;
use pipesync_core::error::SyncError;
use pipesync_core::models::{AuditAction, AuditEntry, LocalContact};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::client::PipedriveClient;
use crate::discovery::discover_field_mapping;
use crate::reconcile::{remote_id_value, Reconciler};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRequest {
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Also update the contact's status in Pipedrive.
    #[serde(default = "default_sync_remote")]
    pub sync_remote: bool,
}

fn default_sync_remote() -> bool {
    true
}

impl LifecycleRequest {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            reason: None,
            sync_remote: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Deactivate,
    Reactivate,
}

pub struct Lifecycle {
    reconciler: Arc<Reconciler>,
}

impl Lifecycle {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub async fn deactivate(
        &self,
        contact_id: &str,
        request: &LifecycleRequest,
    ) -> Result<LocalContact, SyncError> {
        self.transition(contact_id, request, Transition::Deactivate)
            .await
    }

    pub async fn reactivate(
        &self,
        contact_id: &str,
        request: &LifecycleRequest,
    ) -> Result<LocalContact, SyncError> {
        self.transition(contact_id, request, Transition::Reactivate)
            .await
    }

    async fn transition(
        &self,
        contact_id: &str,
        request: &LifecycleRequest,
        transition: Transition,
    ) -> Result<LocalContact, SyncError> {
        let store = self.reconciler.store();
        let _guard = self
            .reconciler
            .locks()
            .acquire(format!("contact:{}", contact_id))
            .await;

        let mut contact = store
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", contact_id)))?;
        let actor = store
            .get_user(&request.actor_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("user {}", request.actor_id)))?;

        let now = Utc::now();
        match transition {
            Transition::Deactivate => {
                if !contact.is_active {
                    return Err(SyncError::Validation(format!(
                        "contact {} is already inactive",
                        contact_id
                    )));
                }
                let pending = store.count_future_activities(contact_id, now).await?;
                if pending > 0 {
                    return Err(SyncError::Validation(format!(
                        "contact {} has {} activit{} due in the future; complete or reschedule them first",
                        contact_id,
                        pending,
                        if pending == 1 { "y" } else { "ies" }
                    )));
                }
            }
            Transition::Reactivate => {
                if contact.is_active {
                    return Err(SyncError::Validation(format!(
                        "contact {} is already active",
                        contact_id
                    )));
                }
            }
        }

        let mut remote_updated = false;
        if request.sync_remote {
            if let Some(remote_id) = contact.remote_person_id.clone() {
                let client = self
                    .reconciler
                    .client_for(actor.remote_api_token.as_deref());
                self.update_remote_status(&client, &remote_id, transition)
                    .await?;
                remote_updated = true;
            }
        }

        let action = match transition {
            Transition::Deactivate => {
                contact.is_active = false;
                contact.deactivated_at = Some(now);
                contact.deactivated_by = Some(actor.id.clone());
                contact.deactivation_reason = request.reason.clone();
                AuditAction::Deactivated
            }
            Transition::Reactivate => {
                contact.is_active = true;
                contact.deactivated_at = None;
                contact.deactivated_by = None;
                contact.deactivation_reason = None;
                AuditAction::Reactivated
            }
        };
        contact.updated_at = now;

        let entry = AuditEntry::new(contact_id, action, actor.id.clone(), request.reason.clone());
        let written = match store.update_contact(&contact).await {
            Ok(()) => store.append_audit(&entry).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if remote_updated {
                tracing::error!(
                    contact_id,
                    action = action.as_str(),
                    error = %e,
                    "remote status updated but local write failed"
                );
                return Err(SyncError::Inconsistent(format!(
                    "remote status for contact {} updated but local {} failed: {}",
                    contact_id,
                    action.as_str(),
                    e
                )));
            }
            return Err(SyncError::Store(e));
        }

        tracing::info!(
            contact_id,
            actor_id = %actor.id,
            action = action.as_str(),
            remote_updated,
            "contact lifecycle changed"
        );
        Ok(contact)
    }

    async fn update_remote_status(
        &self,
        client: &PipedriveClient,
        remote_person_id: &str,
        transition: Transition,
    ) -> Result<(), SyncError> {
        let mapping = discover_field_mapping(client).await?;
        let Some(field_key) = mapping.still_active_field_key else {
            return Err(SyncError::Configuration(
                "no \"Still Active\" person field exists in Pipedrive; create it or use a local-only change"
                    .into(),
            ));
        };
        let value = match transition {
            Transition::Deactivate => mapping.inactive_value,
            Transition::Reactivate => mapping.active_value,
        };
        let Some(value) = value else {
            return Err(SyncError::Configuration(format!(
                "the \"Still Active\" field ({}) has no {} option",
                field_key,
                match transition {
                    Transition::Deactivate => "inactive",
                    Transition::Reactivate => "active",
                }
            )));
        };

        let mut payload = Map::new();
        payload.insert(field_key, remote_id_value(&value));
        client
            .update_person(remote_person_id, &Value::Object(payload))
            .await?;
        Ok(())
    }
}
