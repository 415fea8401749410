//! Activity replication.
//!
//! Mirrors a logged local activity as a Pipedrive activity on the
//! contact's linked person. Replication is one-shot per activity: once
//! `replicated_to_pipedrive` is set, later triggers return without any
//! remote call.
//!
//! The whole create is retried on retryable errors up to
//! `replication.max_attempts` times. Attempt bookkeeping
//! (`pipedrive_sync_attempts`, `last_pipedrive_sync_attempt`) is written
//! after every attempt, successful or not.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipesync_core::error::SyncError;
use pipesync_core::models::{Campaign, LocalActivity, LocalContact, LocalUser};
use pipesync_core::store::ReplicationAttempt;
use serde::Serialize;
use serde_json::{json, Value};

use crate::client::PipedriveClient;
use crate::reconcile::{remote_id_value, Reconciler};
use crate::retry::{retry_with_backoff, RetryDirective, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplicationOutcome {
    #[serde(rename_all = "camelCase")]
    Replicated {
        remote_activity_id: String,
        attempts: i64,
    },
    /// Replicated earlier; nothing was sent.
    AlreadyReplicated,
    /// The contact has no remote person yet; nothing was sent.
    ContactNotLinked,
}

impl ReplicationOutcome {
    /// Whether the activity now exists remotely.
    pub fn is_replicated(&self) -> bool {
        !matches!(self, ReplicationOutcome::ContactNotLinked)
    }
}

pub struct Replicator {
    reconciler: Arc<Reconciler>,
    policy: RetryPolicy,
}

impl Replicator {
    pub fn new(reconciler: Arc<Reconciler>, policy: RetryPolicy) -> Self {
        Self { reconciler, policy }
    }

    pub async fn replicate(&self, activity_id: &str) -> Result<ReplicationOutcome, SyncError> {
        let store = self.reconciler.store();
        let _guard = self
            .reconciler
            .locks()
            .acquire(format!("activity:{}", activity_id))
            .await;

        let activity = store
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("activity {}", activity_id)))?;
        if activity.replicated_to_pipedrive {
            return Ok(ReplicationOutcome::AlreadyReplicated);
        }

        let contact = store
            .get_contact(&activity.contact_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", activity.contact_id)))?;
        if !contact.is_linked() {
            tracing::debug!(activity_id, contact_id = %contact.id, "contact not linked; skipping replication");
            return Ok(ReplicationOutcome::ContactNotLinked);
        }

        let user = store.get_user(&activity.user_id).await?;
        let campaign = match activity.campaign_id.as_deref() {
            Some(id) => store.get_campaign(id).await?,
            None => None,
        };
        let client = self
            .reconciler
            .client_for(user.as_ref().and_then(|u| u.remote_api_token.as_deref()));
        let payload = self.activity_payload(&activity, &contact, user.as_ref(), campaign.as_ref(), Utc::now());

        let prior_attempts = activity.pipedrive_sync_attempts;
        let outcome = retry_with_backoff(
            &self.policy,
            |e: &SyncError| {
                if e.is_retryable() {
                    RetryDirective::Backoff
                } else {
                    RetryDirective::Stop
                }
            },
            |attempt| self.attempt(&client, activity_id, &payload, prior_attempts + i64::from(attempt)),
        )
        .await;

        match outcome.result {
            Ok(remote_activity_id) => {
                let attempts = prior_attempts + i64::from(outcome.attempts);
                tracing::info!(activity_id, %remote_activity_id, attempts, "replicated activity");
                Ok(ReplicationOutcome::Replicated {
                    remote_activity_id,
                    attempts,
                })
            }
            Err(e) => {
                tracing::warn!(activity_id, attempts = outcome.attempts, error = %e, "activity replication failed");
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        client: &PipedriveClient,
        activity_id: &str,
        payload: &Value,
        attempts: i64,
    ) -> Result<String, SyncError> {
        let result = client.create_activity(payload).await;
        let record = ReplicationAttempt {
            attempts,
            attempted_at: Utc::now(),
            remote_activity_id: result.as_ref().ok().cloned(),
        };
        let written = self
            .reconciler
            .store()
            .record_replication_attempt(activity_id, &record)
            .await;

        match (result, written) {
            (Ok(remote_id), Ok(())) => Ok(remote_id),
            (Ok(remote_id), Err(e)) => {
                tracing::error!(
                    activity_id,
                    remote_activity_id = %remote_id,
                    error = %e,
                    "remote activity created but local record not updated"
                );
                Err(SyncError::Inconsistent(format!(
                    "remote activity {} created but activity {} was not marked replicated: {}",
                    remote_id, activity_id, e
                )))
            }
            (Err(api), written) => {
                if let Err(e) = written {
                    tracing::warn!(activity_id, error = %e, "could not record replication attempt");
                }
                Err(api.into())
            }
        }
    }

    /// Build the remote activity body.
    pub fn activity_payload(
        &self,
        activity: &LocalActivity,
        contact: &LocalContact,
        user: Option<&LocalUser>,
        campaign: Option<&Campaign>,
        now: DateTime<Utc>,
    ) -> Value {
        let limits = self.reconciler.limits();
        let mut payload = json!({
            "subject": limits.subject(&activity.subject),
            "type": activity.activity_type.remote_type(),
            "done": if activity.due_date.is_some_and(|d| d > now) { 0 } else { 1 },
        });
        if let Some(person) = contact.remote_person_id.as_deref() {
            payload["person_id"] = remote_id_value(person);
        }
        if let Some(org) = contact.remote_org_id.as_deref() {
            payload["org_id"] = remote_id_value(org);
        }
        if let Some(owner) = user.and_then(|u| u.remote_user_id.as_deref()) {
            payload["user_id"] = remote_id_value(owner);
        }
        if let Some(due) = activity.due_date {
            payload["due_date"] = json!(due.format("%Y-%m-%d").to_string());
            payload["due_time"] = json!(due.format("%H:%M").to_string());
        }

        let mut note = activity.note.clone().unwrap_or_default();
        if let Some(campaign) = campaign {
            if !note.is_empty() {
                note.push_str("\n\n");
            }
            note.push_str(&format!("Campaign: {}", campaign.name));
        }
        if !note.trim().is_empty() {
            payload["note"] = json!(limits.note(&note));
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipedriveConfig;
    use mockito::Matcher;
    use pipesync_core::models::ActivityType;
    use pipesync_core::sanitize::SanitizeLimits;
    use pipesync_core::store::memory::InMemoryStore;
    use pipesync_core::store::Store;
    use std::time::Duration;

    fn setup(server: &mockito::ServerGuard, max_attempts: u32) -> (Arc<InMemoryStore>, Replicator) {
        let config = PipedriveConfig {
            base_url: server.url(),
            max_retries: 0,
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
        let policy = RetryPolicy {
            max_retries: max_attempts - 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        (store, Replicator::new(reconciler, policy))
    }

    async fn seed(store: &InMemoryStore, linked: bool, kind: ActivityType) -> LocalActivity {
        let user = LocalUser::new("Owner", "owner@example.com");
        store.insert_user(&user).await.unwrap();
        let mut contact = LocalContact::new("Ada");
        if linked {
            contact.remote_person_id = Some("123".into());
        }
        store.insert_contact(&contact).await.unwrap();
        let activity = LocalActivity::new(kind, "Intro", contact.id, user.id);
        store.insert_activity(&activity).await.unwrap();
        activity
    }

    #[tokio::test]
    async fn test_meeting_request_replicates_on_first_attempt() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/activities")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(
                json!({"type": "meeting_request", "person_id": 123}),
            ))
            .with_status(201)
            .with_body(json!({"success": true, "data": {"id": 555}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let (store, replicator) = setup(&server, 3);
        let activity = seed(&store, true, ActivityType::MeetingRequest).await;

        let outcome = replicator.replicate(&activity.id).await.unwrap();
        assert_eq!(
            outcome,
            ReplicationOutcome::Replicated {
                remote_activity_id: "555".into(),
                attempts: 1
            }
        );
        let stored = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert!(stored.replicated_to_pipedrive);
        assert_eq!(stored.pipedrive_sync_attempts, 1);
        assert_eq!(stored.remote_activity_id.as_deref(), Some("555"));
        assert!(stored.last_pipedrive_sync_attempt.is_some());

        // Replicating again makes no remote call.
        let again = replicator.replicate(&activity.id).await.unwrap();
        assert_eq!(again, ReplicationOutcome::AlreadyReplicated);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_unlinked_contact_is_noop() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/activities")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let (store, replicator) = setup(&server, 3);
        let activity = seed(&store, false, ActivityType::Call).await;

        let outcome = replicator.replicate(&activity.id).await.unwrap();
        assert_eq!(outcome, ReplicationOutcome::ContactNotLinked);
        assert!(!outcome.is_replicated());
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_failures_record_every_attempt() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/activities")
            .match_query(Matcher::Any)
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let (store, replicator) = setup(&server, 3);
        let activity = seed(&store, true, ActivityType::Linkedin).await;

        let err = replicator.replicate(&activity.id).await.unwrap_err();
        assert!(err.is_retryable());
        let stored = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.pipedrive_sync_attempts, 3);
        assert!(!stored.replicated_to_pipedrive);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stops_after_one_attempt() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/activities")
            .match_query(Matcher::Any)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let (store, replicator) = setup(&server, 3);
        let activity = seed(&store, true, ActivityType::Email).await;

        let err = replicator.replicate(&activity.id).await.unwrap_err();
        assert_eq!(err.category(), "auth_expired");
        let stored = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.pipedrive_sync_attempts, 1);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_payload_maps_type_and_appends_campaign() {
        let server = mockito::Server::new_async().await;
        let (_store, replicator) = setup(&server, 3);
        let mut contact = LocalContact::new("Ada");
        contact.remote_person_id = Some("123".into());
        contact.remote_org_id = Some("8".into());
        let mut activity = LocalActivity::new(ActivityType::Conference, "<b>Booth</b> chat", &contact.id, "u");
        activity.note = Some("Met at booth".into());
        let campaign = Campaign::new("Spring Expo");

        let payload = replicator.activity_payload(&activity, &contact, None, Some(&campaign), Utc::now());
        assert_eq!(payload["type"], "meeting");
        assert_eq!(payload["subject"], "Booth chat");
        assert_eq!(payload["org_id"], 8);
        assert_eq!(payload["done"], 1);
        assert_eq!(payload["note"], "Met at booth\n\nCampaign: Spring Expo");
    }
}
