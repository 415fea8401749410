//! Warm-lead promotion.
//!
//! A contact whose warmness score reaches the configured threshold is
//! promoted to a Pipedrive person:
//!
//! ```text
//! NotEligible ──score ≥ threshold──▶ Eligible ──promote──▶ Linked
//! ```
//!
//! Promotion resolves the acting user's Pipedrive id (cached on the user
//! record), links or creates the contact's organization, looks up the
//! warm-lead label, and then creates the person with whatever of
//! {owner, organization, label} resolved. Only the person create is
//! fatal; every enrichment step degrades to a warning.

use std::sync::Arc;

use pipesync_core::error::SyncError;
use pipesync_core::models::{LocalContact, LocalUser};
use serde::Serialize;

use crate::client::PipedriveClient;
use crate::config::PromotionConfig;
use crate::discovery;
use crate::reconcile::{PersonEnrichment, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionState {
    NotEligible,
    Eligible,
    Linked,
}

pub fn promotion_state(contact: &LocalContact, threshold: i64) -> PromotionState {
    if contact.is_linked() {
        PromotionState::Linked
    } else if contact.warmness_score >= threshold {
        PromotionState::Eligible
    } else {
        PromotionState::NotEligible
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionOutcome {
    pub contact_id: String,
    pub remote_person_id: String,
    /// True when the contact was linked before this call and nothing ran.
    pub already_linked: bool,
    pub owner_id: Option<String>,
    pub remote_org_id: Option<String>,
    pub label_applied: bool,
    /// Enrichment steps that were skipped, with the reason.
    pub warnings: Vec<String>,
}

/// The acting user's Pipedrive id, looked up by email on first use and
/// cached on the user record.
pub async fn resolve_owner(
    reconciler: &Reconciler,
    client: &PipedriveClient,
    user: &LocalUser,
) -> Result<Option<String>, SyncError> {
    if let Some(id) = &user.remote_user_id {
        return Ok(Some(id.clone()));
    }
    let Some(remote) = client.find_user_by_email(&user.email).await? else {
        return Ok(None);
    };
    reconciler
        .store()
        .set_user_remote_id(&user.id, &remote.id)
        .await?;
    tracing::debug!(user_id = %user.id, remote_user_id = %remote.id, "cached remote user id");
    Ok(Some(remote.id))
}

pub struct Promoter {
    reconciler: Arc<Reconciler>,
    config: PromotionConfig,
}

impl Promoter {
    pub fn new(reconciler: Arc<Reconciler>, config: PromotionConfig) -> Self {
        Self { reconciler, config }
    }

    pub fn threshold(&self) -> i64 {
        self.config.warm_threshold
    }

    pub async fn promote(
        &self,
        contact_id: &str,
        user_id: &str,
    ) -> Result<PromotionOutcome, SyncError> {
        let store = self.reconciler.store();
        let mut contact = store
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", contact_id)))?;

        match promotion_state(&contact, self.config.warm_threshold) {
            PromotionState::Linked => {
                return Ok(PromotionOutcome {
                    contact_id: contact.id,
                    remote_person_id: contact.remote_person_id.unwrap_or_default(),
                    already_linked: true,
                    owner_id: None,
                    remote_org_id: contact.remote_org_id,
                    label_applied: false,
                    warnings: Vec::new(),
                })
            }
            PromotionState::NotEligible => {
                return Err(SyncError::Validation(format!(
                    "warmness score {} is below the promotion threshold {}",
                    contact.warmness_score, self.config.warm_threshold
                )))
            }
            PromotionState::Eligible => {}
        }

        let user = store
            .get_user(user_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("user {}", user_id)))?;
        let client = self
            .reconciler
            .client_for(user.remote_api_token.as_deref());
        let mut warnings = Vec::new();

        let owner_id = match resolve_owner(&self.reconciler, &client, &user).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                warnings.push(format!("no Pipedrive user matches {}", user.email));
                None
            }
            Err(e) => {
                tracing::warn!(contact_id, error = %e, "owner lookup failed; promoting without owner");
                warnings.push(format!("owner lookup failed: {}", e));
                None
            }
        };

        let remote_org_id = match self
            .link_organization(&client, &mut contact, owner_id.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    contact_id,
                    error = %e,
                    "organization link failed; promoting without organization"
                );
                warnings.push(format!("organization not linked: {}", e));
                None
            }
        };

        let label = discovery::resolve_label_option(&client, &self.config.warm_lead_label).await;
        if label.is_none() {
            warnings.push(format!(
                "label '{}' not available; promoted unlabeled",
                self.config.warm_lead_label
            ));
        }

        let enrichment = PersonEnrichment {
            owner_id: owner_id.clone(),
            org_id: remote_org_id.clone(),
            label: label.clone(),
            ..PersonEnrichment::default()
        };
        let outcome = self
            .reconciler
            .reconcile_person_with(&client, contact_id, &enrichment)
            .await?;

        tracing::info!(
            contact_id,
            remote_person_id = %outcome.remote_id,
            warnings = warnings.len(),
            "promoted warm lead"
        );
        Ok(PromotionOutcome {
            contact_id: contact_id.to_string(),
            remote_person_id: outcome.remote_id,
            already_linked: false,
            owner_id,
            remote_org_id,
            label_applied: label.is_some(),
            warnings,
        })
    }

    async fn link_organization(
        &self,
        client: &PipedriveClient,
        contact: &mut LocalContact,
        owner_id: Option<&str>,
    ) -> Result<Option<String>, SyncError> {
        let Some(org) = self.reconciler.ensure_local_organization(contact).await? else {
            return Ok(None);
        };
        if let Some(id) = org.remote_org_id {
            return Ok(Some(id));
        }
        let outcome = self
            .reconciler
            .reconcile_organization_with(client, &org.id, owner_id)
            .await?;
        Ok(Some(outcome.remote_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipedriveConfig;
    use mockito::Matcher;
    use pipesync_core::models::LocalOrganization;
    use pipesync_core::sanitize::SanitizeLimits;
    use pipesync_core::store::memory::InMemoryStore;
    use pipesync_core::store::Store;
    use serde_json::json;
    use tracing_test::traced_test;

    fn setup(server: &mockito::ServerGuard) -> (Arc<InMemoryStore>, Promoter) {
        let config = PipedriveConfig {
            base_url: server.url(),
            retry_base_delay_ms: 1,
            max_retry_delay_ms: 2,
            ..PipedriveConfig::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let client = PipedriveClient::new(&config, "t").unwrap();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            client,
            SanitizeLimits::default(),
        ));
        (store, Promoter::new(reconciler, PromotionConfig::default()))
    }

    async fn seed_user(store: &InMemoryStore) -> LocalUser {
        let mut user = LocalUser::new("Owner", "owner@example.com");
        user.remote_user_id = Some("42".into());
        store.insert_user(&user).await.unwrap();
        user
    }

    #[test]
    fn test_state_follows_threshold() {
        let mut c = LocalContact::new("Ada");
        for score in 0..=3 {
            c.warmness_score = score;
            assert_eq!(promotion_state(&c, 4), PromotionState::NotEligible);
        }
        for score in 4..=10 {
            c.warmness_score = score;
            assert_eq!(promotion_state(&c, 4), PromotionState::Eligible);
        }
        c.remote_person_id = Some("1".into());
        assert_eq!(promotion_state(&c, 4), PromotionState::Linked);
    }

    #[tokio::test]
    async fn test_promotion_creates_org_then_person_then_noops() {
        let mut server = mockito::Server::new_async().await;
        let search = server
            .mock("GET", "/organizations/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"success": true, "data": {"items": []}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let org_create = server
            .mock("POST", "/organizations")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({"name": "Acme Corp"})))
            .with_status(201)
            .with_body(json!({"success": true, "data": {"id": 501, "name": "Acme Corp"}}).to_string())
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/personFields")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"success": true, "data": [
                    {"id": 9, "key": "label", "name": "Label", "field_type": "enum",
                     "options": [{"id": 3, "label": "Warm Lead"}]}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let person_create = server
            .mock("POST", "/persons")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(
                json!({"org_id": 501, "owner_id": 42, "label": 3}),
            ))
            .with_status(201)
            .with_body(json!({"success": true, "data": {"id": 900, "name": "Ada"}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let (store, promoter) = setup(&server);
        let user = seed_user(&store).await;
        let org = LocalOrganization::new("Acme Corp");
        store.insert_organization(&org).await.unwrap();
        let mut contact = LocalContact::new("Ada");
        contact.warmness_score = 5;
        contact.organization = Some("Acme Corp".into());
        contact.organization_id = Some(org.id.clone());
        store.insert_contact(&contact).await.unwrap();

        let outcome = promoter.promote(&contact.id, &user.id).await.unwrap();
        assert!(!outcome.already_linked);
        assert_eq!(outcome.remote_person_id, "900");
        assert_eq!(outcome.remote_org_id.as_deref(), Some("501"));
        assert!(outcome.label_applied);
        assert!(outcome.warnings.is_empty());

        let stored = store.get_contact(&contact.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_person_id.as_deref(), Some("900"));
        assert_eq!(stored.remote_org_id.as_deref(), Some("501"));
        let stored_org = store.get_organization(&org.id).await.unwrap().unwrap();
        assert_eq!(stored_org.remote_org_id.as_deref(), Some("501"));

        let again = promoter.promote(&contact.id, &user.id).await.unwrap();
        assert!(again.already_linked);
        assert_eq!(again.remote_person_id, "900");

        search.assert_async().await;
        org_create.assert_async().await;
        person_create.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_organization_and_label_failures_degrade() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/organizations/search")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(json!({"success": false, "error": "bad term"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/personFields")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"success": true, "data": []}).to_string())
            .create_async()
            .await;
        let person_create = server
            .mock("POST", "/persons")
            .match_query(Matcher::Any)
            .with_status(201)
            .with_body(json!({"success": true, "data": {"id": 901}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let (store, promoter) = setup(&server);
        let user = seed_user(&store).await;
        let mut contact = LocalContact::new("Grace");
        contact.warmness_score = 8;
        contact.organization = Some("Navy".into());
        store.insert_contact(&contact).await.unwrap();

        let outcome = promoter.promote(&contact.id, &user.id).await.unwrap();
        assert_eq!(outcome.remote_person_id, "901");
        assert!(outcome.remote_org_id.is_none());
        assert!(!outcome.label_applied);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(logs_contain("organization link failed"));
        person_create.assert_async().await;
    }

    #[tokio::test]
    async fn test_cold_contact_is_rejected_without_remote_calls() {
        let mut server = mockito::Server::new_async().await;
        let any = server
            .mock("POST", Matcher::Any)
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let (store, promoter) = setup(&server);
        let user = seed_user(&store).await;
        let mut contact = LocalContact::new("Cold");
        contact.warmness_score = 3;
        store.insert_contact(&contact).await.unwrap();

        let err = promoter.promote(&contact.id, &user.id).await.unwrap_err();
        assert_eq!(err.category(), "validation");
        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_person_create_failure_fails_promotion() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/personFields")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"success": true, "data": []}).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/persons")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let (store, promoter) = setup(&server);
        let user = seed_user(&store).await;
        let mut contact = LocalContact::new("Ada");
        contact.warmness_score = 4;
        store.insert_contact(&contact).await.unwrap();

        let err = promoter.promote(&contact.id, &user.id).await.unwrap_err();
        assert_eq!(err.category(), "auth_expired");
        let stored = store.get_contact(&contact.id).await.unwrap().unwrap();
        assert!(stored.remote_person_id.is_none());
    }
}
