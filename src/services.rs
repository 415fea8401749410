//! Local CRUD services.
//!
//! Thin validation layers over the store that also trigger the sync
//! side effects tied to a local change: an unlinked contact at or above
//! the warmness threshold is promoted, and logging an activity on a
//! linked contact replicates it.

use std::sync::Arc;

use pipesync_core::error::SyncError;
use pipesync_core::models::{
    ActivityType, Campaign, LocalActivity, LocalContact, LocalUser,
};
use pipesync_core::store::Store;
use serde::{Deserialize, Serialize};

use crate::promote::{PromotionOutcome, Promoter};
use crate::reconcile::Reconciler;
use crate::replicate::{ReplicationOutcome, Replicator};

/// Highest warmness score.
pub const MAX_WARMNESS: i64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub warmness_score: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmnessUpdate {
    pub contact: LocalContact,
    /// Present when this update promoted the contact.
    pub promotion: Option<PromotionOutcome>,
    pub promotion_error: Option<String>,
}

/// A new contact, plus the promotion attempt when it was created warm.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedContact {
    #[serde(flatten)]
    pub contact: LocalContact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_error: Option<String>,
}

pub struct ContactService {
    reconciler: Arc<Reconciler>,
    promoter: Arc<Promoter>,
}

impl ContactService {
    pub fn new(reconciler: Arc<Reconciler>, promoter: Arc<Promoter>) -> Self {
        Self {
            reconciler,
            promoter,
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.reconciler.store()
    }

    /// Store a new contact. A contact created at or above the promotion
    /// threshold is promoted on behalf of `user_id`.
    pub async fn create(
        &self,
        input: NewContact,
        user_id: Option<&str>,
    ) -> Result<CreatedContact, SyncError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(SyncError::Validation("contact name is required".into()));
        }
        validate_warmness(input.warmness_score)?;
        let email = non_empty(input.email);
        if let Some(email) = email.as_deref() {
            if !email.contains('@') {
                return Err(SyncError::Validation(format!("invalid email address: {}", email)));
            }
        }

        let mut contact = LocalContact::new(name);
        contact.email = email;
        contact.phone = non_empty(input.phone);
        contact.organization = non_empty(input.organization);
        contact.warmness_score = input.warmness_score;
        self.store().insert_contact(&contact).await?;
        self.reconciler.ensure_local_organization(&mut contact).await?;
        tracing::debug!(contact_id = %contact.id, "created contact");

        if contact.warmness_score < self.promoter.threshold() {
            return Ok(CreatedContact {
                contact,
                promotion: None,
                promotion_error: None,
            });
        }
        let (promotion, promotion_error) = match user_id {
            Some(user_id) => self.auto_promote(&contact.id, user_id).await,
            None => {
                tracing::warn!(
                    contact_id = %contact.id,
                    "warm contact created without an acting user; not promoted"
                );
                (None, Some("promotion needs an acting user".to_string()))
            }
        };
        Ok(CreatedContact {
            contact: self.get(&contact.id).await?,
            promotion,
            promotion_error,
        })
    }

    pub async fn get(&self, id: &str) -> Result<LocalContact, SyncError> {
        self.store()
            .get_contact(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", id)))
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<LocalContact>, SyncError> {
        Ok(self
            .store()
            .list_contacts(limit.clamp(1, 500), offset.max(0))
            .await?)
    }

    /// Set the warmness score. An unlinked contact at or above the
    /// threshold is promoted; a failed promotion keeps the new score and
    /// reports the error alongside it.
    pub async fn update_warmness(
        &self,
        contact_id: &str,
        score: i64,
        user_id: &str,
    ) -> Result<WarmnessUpdate, SyncError> {
        validate_warmness(score)?;
        {
            let _guard = self
                .reconciler
                .locks()
                .acquire(format!("contact:{}", contact_id))
                .await;
            if !self.store().set_contact_warmness(contact_id, score).await? {
                return Err(SyncError::NotFound(format!("contact {}", contact_id)));
            }
        }
        let contact = self.get(contact_id).await?;

        if score < self.promoter.threshold() || contact.is_linked() {
            return Ok(WarmnessUpdate {
                contact,
                promotion: None,
                promotion_error: None,
            });
        }

        tracing::info!(contact_id, score, "unlinked contact is warm; promoting");
        let (promotion, promotion_error) = self.auto_promote(contact_id, user_id).await;
        Ok(WarmnessUpdate {
            contact: self.get(contact_id).await?,
            promotion,
            promotion_error,
        })
    }

    async fn auto_promote(
        &self,
        contact_id: &str,
        user_id: &str,
    ) -> (Option<PromotionOutcome>, Option<String>) {
        match self.promoter.promote(contact_id, user_id).await {
            Ok(outcome) if outcome.already_linked => (None, None),
            Ok(outcome) => (Some(outcome), None),
            Err(e) => {
                tracing::warn!(contact_id, error = %e, "automatic promotion failed");
                (None, Some(e.to_string()))
            }
        }
    }
}

fn validate_warmness(score: i64) -> Result<(), SyncError> {
    if (0..=MAX_WARMNESS).contains(&score) {
        Ok(())
    } else {
        Err(SyncError::Validation(format!(
            "warmness score must be between 0 and {}, got {}",
            MAX_WARMNESS, score
        )))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct CampaignService {
    store: Arc<dyn Store>,
}

impl CampaignService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, input: NewCampaign) -> Result<Campaign, SyncError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(SyncError::Validation("campaign name is required".into()));
        }
        let mut campaign = Campaign::new(name);
        campaign.description = non_empty(input.description);
        self.store.insert_campaign(&campaign).await?;
        Ok(campaign)
    }

    pub async fn get(&self, id: &str) -> Result<Campaign, SyncError> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("campaign {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<Campaign>, SyncError> {
        Ok(self.store.list_campaigns().await?)
    }

    pub async fn add_contact(&self, campaign_id: &str, contact_id: &str) -> Result<(), SyncError> {
        self.get(campaign_id).await?;
        if self.store.get_contact(contact_id).await?.is_none() {
            return Err(SyncError::NotFound(format!("contact {}", contact_id)));
        }
        self.store
            .add_contact_to_campaign(campaign_id, contact_id)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActivity {
    pub activity_type: ActivityType,
    pub subject: String,
    pub contact_id: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub due_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedActivity {
    pub activity: LocalActivity,
    pub replication: Option<ReplicationOutcome>,
    pub replication_error: Option<String>,
}

pub struct ActivityService {
    store: Arc<dyn Store>,
    replicator: Arc<Replicator>,
}

impl ActivityService {
    pub fn new(store: Arc<dyn Store>, replicator: Arc<Replicator>) -> Self {
        Self { store, replicator }
    }

    /// Store the activity, then replicate it if the contact is linked.
    /// Replication failures are reported but never undo the log.
    pub async fn log(&self, user_id: &str, input: NewActivity) -> Result<LoggedActivity, SyncError> {
        let subject = input.subject.trim();
        if subject.is_empty() {
            return Err(SyncError::Validation("activity subject is required".into()));
        }
        let contact = self
            .store
            .get_contact(&input.contact_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", input.contact_id)))?;
        if self.store.get_user(user_id).await?.is_none() {
            return Err(SyncError::NotFound(format!("user {}", user_id)));
        }
        if let Some(campaign_id) = input.campaign_id.as_deref() {
            if self.store.get_campaign(campaign_id).await?.is_none() {
                return Err(SyncError::NotFound(format!("campaign {}", campaign_id)));
            }
        }

        let mut activity = LocalActivity::new(input.activity_type, subject, &contact.id, user_id);
        activity.note = non_empty(input.note);
        activity.due_date = input.due_date;
        activity.campaign_id = input.campaign_id;
        self.store.insert_activity(&activity).await?;

        if !contact.is_linked() {
            return Ok(LoggedActivity {
                activity,
                replication: None,
                replication_error: None,
            });
        }

        let (replication, replication_error) = match self.replicator.replicate(&activity.id).await {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let activity = self.get(&activity.id).await?;
        Ok(LoggedActivity {
            activity,
            replication,
            replication_error,
        })
    }

    pub async fn get(&self, id: &str) -> Result<LocalActivity, SyncError> {
        self.store
            .get_activity(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("activity {}", id)))
    }

    pub async fn list_for_contact(&self, contact_id: &str) -> Result<Vec<LocalActivity>, SyncError> {
        Ok(self.store.list_activities_for_contact(contact_id).await?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub remote_api_token: Option<String>,
}

pub struct UserService {
    store: Arc<dyn Store>,
}

impl UserService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, input: NewUser) -> Result<LocalUser, SyncError> {
        let email = input.email.trim().to_lowercase();
        if input.name.trim().is_empty() || !email.contains('@') {
            return Err(SyncError::Validation("user name and a valid email are required".into()));
        }
        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(SyncError::Validation(format!("a user with email {} already exists", email)));
        }
        let mut user = LocalUser::new(input.name.trim(), email);
        user.remote_api_token = non_empty(input.remote_api_token);
        self.store.insert_user(&user).await?;
        Ok(user)
    }

    pub async fn get(&self, id: &str) -> Result<LocalUser, SyncError> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("user {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PipedriveClient;
    use crate::config::{PipedriveConfig, PromotionConfig};
    use crate::retry::RetryPolicy;
    use mockito::Matcher;
    use pipesync_core::sanitize::SanitizeLimits;
    use pipesync_core::store::memory::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        contacts: ContactService,
        activities: ActivityService,
        campaigns: CampaignService,
        users: UserService,
    }

    fn fixture(base_url: String) -> Fixture {
        let config = PipedriveConfig {
            base_url,
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
        let promoter = Arc::new(Promoter::new(reconciler.clone(), PromotionConfig::default()));
        let replicator = Arc::new(Replicator::new(
            reconciler.clone(),
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        Fixture {
            contacts: ContactService::new(reconciler, promoter),
            activities: ActivityService::new(store.clone(), replicator),
            campaigns: CampaignService::new(store.clone()),
            users: UserService::new(store.clone()),
            store,
        }
    }

    fn new_contact(name: &str, score: i64) -> NewContact {
        NewContact {
            name: name.into(),
            email: None,
            phone: None,
            organization: None,
            warmness_score: score,
        }
    }

    async fn owner(f: &Fixture) -> LocalUser {
        let mut user = f
            .users
            .create(NewUser {
                name: "Owner".into(),
                email: "Owner@Example.com".into(),
                remote_api_token: None,
            })
            .await
            .unwrap();
        f.store.set_user_remote_id(&user.id, "42").await.unwrap();
        user.remote_user_id = Some("42".into());
        user
    }

    #[tokio::test]
    async fn test_create_contact_validates_and_links_organization() {
        let f = fixture("http://127.0.0.1:1".into());
        assert!(f.contacts.create(new_contact("  ", 0), None).await.is_err());
        assert!(f.contacts.create(new_contact("Ada", 11), None).await.is_err());

        let mut input = new_contact("Ada", 2);
        input.organization = Some("Acme Corp".into());
        let contact = f.contacts.create(input, None).await.unwrap().contact;
        assert!(contact.organization_id.is_some());
        let stored = f.contacts.get(&contact.id).await.unwrap();
        assert_eq!(stored.organization_id, contact.organization_id);
    }

    #[tokio::test]
    async fn test_warmness_below_threshold_never_promotes() {
        let mut server = mockito::Server::new_async().await;
        let any_post = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let f = fixture(server.url());
        let user = owner(&f).await;
        let contact = f.contacts.create(new_contact("Ada", 0), None).await.unwrap().contact;

        for score in 1..=3 {
            let update = f
                .contacts
                .update_warmness(&contact.id, score, &user.id)
                .await
                .unwrap();
            assert!(update.promotion.is_none());
            assert_eq!(update.contact.warmness_score, score);
        }
        any_post.assert_async().await;
    }

    #[tokio::test]
    async fn test_crossing_threshold_promotes_once() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/personFields")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"success": true, "data": []}).to_string())
            .create_async()
            .await;
        let create = server
            .mock("POST", "/persons")
            .match_query(Matcher::Any)
            .with_status(201)
            .with_body(json!({"success": true, "data": {"id": 77, "name": "Ada"}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let f = fixture(server.url());
        let user = owner(&f).await;
        let contact = f.contacts.create(new_contact("Ada", 3), None).await.unwrap().contact;

        let update = f
            .contacts
            .update_warmness(&contact.id, 5, &user.id)
            .await
            .unwrap();
        assert_eq!(
            update.promotion.map(|p| p.remote_person_id).as_deref(),
            Some("77")
        );
        assert_eq!(update.contact.remote_person_id.as_deref(), Some("77"));

        let again = f
            .contacts
            .update_warmness(&contact.id, 8, &user.id)
            .await
            .unwrap();
        assert!(again.promotion.is_none());
        create.assert_async().await;
    }

    async fn mock_person_create(server: &mut mockito::ServerGuard, id: i64) -> mockito::Mock {
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
            .with_status(201)
            .with_body(json!({"success": true, "data": {"id": id, "name": "Ada"}}).to_string())
            .expect(1)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_contact_created_warm_is_promoted() {
        let mut server = mockito::Server::new_async().await;
        let create = mock_person_create(&mut server, 31).await;
        let f = fixture(server.url());
        let user = owner(&f).await;

        let created = f
            .contacts
            .create(new_contact("Ada", 7), Some(&user.id))
            .await
            .unwrap();
        assert_eq!(
            created.promotion.map(|p| p.remote_person_id).as_deref(),
            Some("31")
        );
        assert_eq!(created.contact.remote_person_id.as_deref(), Some("31"));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_warm_unlinked_contact_promotes_on_warm_to_warm_update() {
        let mut server = mockito::Server::new_async().await;
        let create = mock_person_create(&mut server, 32).await;
        let f = fixture(server.url());
        let user = owner(&f).await;

        let created = f.contacts.create(new_contact("Ada", 7), None).await.unwrap();
        assert!(created.promotion.is_none());
        assert!(created.promotion_error.is_some());
        assert!(!created.contact.is_linked());

        let update = f
            .contacts
            .update_warmness(&created.contact.id, 8, &user.id)
            .await
            .unwrap();
        assert_eq!(
            update.promotion.map(|p| p.remote_person_id).as_deref(),
            Some("32")
        );
        assert_eq!(update.contact.warmness_score, 8);

        let again = f
            .contacts
            .update_warmness(&created.contact.id, 9, &user.id)
            .await
            .unwrap();
        assert!(again.promotion.is_none());
        assert!(again.promotion_error.is_none());
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_warmness_update_keeps_concurrent_deactivation() {
        let f = fixture("http://127.0.0.1:1".into());
        let user = owner(&f).await;
        let contact = f.contacts.create(new_contact("Ada", 1), None).await.unwrap().contact;

        let mut deactivated = contact.clone();
        deactivated.is_active = false;
        f.store.update_contact(&deactivated).await.unwrap();

        let update = f
            .contacts
            .update_warmness(&contact.id, 2, &user.id)
            .await
            .unwrap();
        assert_eq!(update.contact.warmness_score, 2);
        assert!(!update.contact.is_active);
        assert!(matches!(
            f.contacts.update_warmness("missing", 2, &user.id).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_logging_on_unlinked_contact_does_not_replicate() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/activities")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let f = fixture(server.url());
        let user = owner(&f).await;
        let contact = f.contacts.create(new_contact("Ada", 0), None).await.unwrap().contact;

        let logged = f
            .activities
            .log(
                &user.id,
                NewActivity {
                    activity_type: ActivityType::Call,
                    subject: "Intro call".into(),
                    contact_id: contact.id.clone(),
                    note: None,
                    due_date: None,
                    campaign_id: None,
                },
            )
            .await
            .unwrap();
        assert!(logged.replication.is_none());
        assert!(!logged.activity.replicated_to_pipedrive);
        assert_eq!(f.activities.list_for_contact(&contact.id).await.unwrap().len(), 1);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_replication_failure_keeps_logged_activity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/activities")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let f = fixture(server.url());
        let user = owner(&f).await;
        let mut contact = LocalContact::new("Ada");
        contact.remote_person_id = Some("123".into());
        f.store.insert_contact(&contact).await.unwrap();

        let logged = f
            .activities
            .log(
                &user.id,
                NewActivity {
                    activity_type: ActivityType::Email,
                    subject: "Follow-up".into(),
                    contact_id: contact.id.clone(),
                    note: None,
                    due_date: None,
                    campaign_id: None,
                },
            )
            .await
            .unwrap();
        assert!(logged.replication_error.is_some());
        assert_eq!(logged.activity.pipedrive_sync_attempts, 1);
        assert!(!logged.activity.replicated_to_pipedrive);
    }

    #[tokio::test]
    async fn test_campaign_membership_and_duplicate_users() {
        let f = fixture("http://127.0.0.1:1".into());
        let user = owner(&f).await;
        assert_eq!(user.email, "owner@example.com");
        let dup = f
            .users
            .create(NewUser {
                name: "Other".into(),
                email: "owner@example.com".into(),
                remote_api_token: None,
            })
            .await;
        assert!(matches!(dup, Err(SyncError::Validation(_))));

        let campaign = f
            .campaigns
            .create(NewCampaign {
                name: "Spring Expo".into(),
                description: None,
            })
            .await
            .unwrap();
        let contact = f.contacts.create(new_contact("Ada", 0), None).await.unwrap().contact;
        f.campaigns.add_contact(&campaign.id, &contact.id).await.unwrap();
        assert!(f.contacts.get(&contact.id).await.unwrap().added_to_campaign);
        assert!(matches!(
            f.campaigns.add_contact(&campaign.id, "missing").await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(f.campaigns.list().await.unwrap().len(), 1);
    }
}
