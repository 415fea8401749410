//! Core data models for the local CRM and its Pipedrive linkage.
//!
//! Local records (`LocalContact`, `LocalOrganization`, `LocalActivity`,
//! `LocalUser`, `Campaign`, `AuditEntry`) are what the store persists.
//! Remote schema types (`RemoteCustomField` and the discovered mappings)
//! are fetched fresh per discovery pass and never persisted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Synchronization state of a contact's last outbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "SYNCED" => Ok(SyncStatus::Synced),
            "FAILED" => Ok(SyncStatus::Failed),
            other => anyhow::bail!("unknown sync status: {}", other),
        }
    }
}

/// Kind of a logged local activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    Call,
    Email,
    Meeting,
    MeetingRequest,
    Linkedin,
    Referral,
    Conference,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Call => "CALL",
            ActivityType::Email => "EMAIL",
            ActivityType::Meeting => "MEETING",
            ActivityType::MeetingRequest => "MEETING_REQUEST",
            ActivityType::Linkedin => "LINKEDIN",
            ActivityType::Referral => "REFERRAL",
            ActivityType::Conference => "CONFERENCE",
        }
    }

    /// Remote activity-type key this local type is mirrored as.
    ///
    /// | Local | Remote |
    /// |-------|--------|
    /// | `CALL` | `call` |
    /// | `EMAIL` | `email` |
    /// | `MEETING`, `CONFERENCE` | `meeting` |
    /// | `MEETING_REQUEST` | `meeting_request` |
    /// | `LINKEDIN`, `REFERRAL` | `task` |
    pub fn remote_type(&self) -> &'static str {
        match self {
            ActivityType::Call => "call",
            ActivityType::Email => "email",
            ActivityType::Meeting | ActivityType::Conference => "meeting",
            ActivityType::MeetingRequest => "meeting_request",
            ActivityType::Linkedin | ActivityType::Referral => "task",
        }
    }
}

impl FromStr for ActivityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CALL" => Ok(ActivityType::Call),
            "EMAIL" => Ok(ActivityType::Email),
            "MEETING" => Ok(ActivityType::Meeting),
            "MEETING_REQUEST" => Ok(ActivityType::MeetingRequest),
            "LINKEDIN" => Ok(ActivityType::Linkedin),
            "REFERRAL" => Ok(ActivityType::Referral),
            "CONFERENCE" => Ok(ActivityType::Conference),
            other => anyhow::bail!("unknown activity type: {}", other),
        }
    }
}

/// A person in the local CRM.
///
/// A contact with a non-null `remote_person_id` is *linked*: reconciliation
/// updates that remote person and never creates a second one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalContact {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Free-text employer name as typed by the user.
    pub organization: Option<String>,
    /// Link to the normalized [`LocalOrganization`].
    pub organization_id: Option<String>,
    /// 0 (cold) to 10 (warm).
    pub warmness_score: i64,
    pub last_contacted: Option<DateTime<Utc>>,
    pub added_to_campaign: bool,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<String>,
    pub deactivation_reason: Option<String>,
    pub remote_person_id: Option<String>,
    pub remote_org_id: Option<String>,
    pub last_remote_update: Option<DateTime<Utc>>,
    pub update_sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalContact {
    /// A fresh, active, unlinked contact.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: None,
            phone: None,
            organization: None,
            organization_id: None,
            warmness_score: 0,
            last_contacted: None,
            added_to_campaign: false,
            is_active: true,
            deactivated_at: None,
            deactivated_by: None,
            deactivation_reason: None,
            remote_person_id: None,
            remote_org_id: None,
            last_remote_update: None,
            update_sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.remote_person_id.is_some()
    }
}

/// Normalize an organization name for de-duplication.
///
/// Lowercases, trims, and collapses internal whitespace, so
/// `"  Acme   Corp "` and `"acme corp"` compare equal.
pub fn normalize_org_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A normalized employer record shared by contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalOrganization {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    /// Unique when present.
    pub remote_org_id: Option<String>,
    pub industry: Option<String>,
    pub size: Option<String>,
    pub country: Option<String>,
    pub contact_count: i64,
}

impl LocalOrganization {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            normalized_name: normalize_org_name(&name),
            name,
            remote_org_id: None,
            industry: None,
            size: None,
            country: None,
            contact_count: 0,
        }
    }
}

/// A logged interaction with a contact.
///
/// Once `replicated_to_pipedrive` is true the activity is never
/// replicated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalActivity {
    pub id: String,
    pub activity_type: ActivityType,
    pub subject: String,
    pub note: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub contact_id: String,
    pub user_id: String,
    pub campaign_id: Option<String>,
    pub replicated_to_pipedrive: bool,
    pub remote_activity_id: Option<String>,
    pub pipedrive_sync_attempts: i64,
    pub last_pipedrive_sync_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl LocalActivity {
    pub fn new(
        activity_type: ActivityType,
        subject: impl Into<String>,
        contact_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            activity_type,
            subject: subject.into(),
            note: None,
            due_date: None,
            contact_id: contact_id.into(),
            user_id: user_id.into(),
            campaign_id: None,
            replicated_to_pipedrive: false,
            remote_activity_id: None,
            pipedrive_sync_attempts: 0,
            last_pipedrive_sync_attempt: None,
            created_at: Utc::now(),
        }
    }
}

/// The authenticated user acting on the CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Pipedrive user id, cached after the first successful lookup.
    pub remote_user_id: Option<String>,
    /// Per-user API token; overrides the configured default when set.
    #[serde(skip_serializing)]
    pub remote_api_token: Option<String>,
}

impl LocalUser {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            remote_user_id: None,
            remote_api_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Deactivated,
    Reactivated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Deactivated => "DEACTIVATED",
            AuditAction::Reactivated => "REACTIVATED",
        }
    }
}

impl FromStr for AuditAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEACTIVATED" => Ok(AuditAction::Deactivated),
            "REACTIVATED" => Ok(AuditAction::Reactivated),
            other => anyhow::bail!("unknown audit action: {}", other),
        }
    }
}

/// Lifecycle audit record appended by deactivate / reactivate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub contact_id: String,
    pub action: AuditAction,
    pub actor_id: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        contact_id: impl Into<String>,
        action: AuditAction,
        actor_id: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact_id: contact_id.into(),
            action,
            actor_id: actor_id.into(),
            reason,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Remote schema
// ═══════════════════════════════════════════════════════════════════════

/// Which remote entity a custom-field schema belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Organization,
}

impl EntityKind {
    /// Remote schema endpoint for this entity kind.
    pub fn fields_endpoint(&self) -> &'static str {
        match self {
            EntityKind::Person => "personFields",
            EntityKind::Organization => "organizationFields",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Person => write!(f, "person"),
            EntityKind::Organization => write!(f, "organization"),
        }
    }
}

/// One selectable option of an enum custom field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCustomFieldOption {
    pub id: i64,
    pub label: String,
    /// Some responses carry a separate value; others only the id.
    #[serde(default)]
    pub value: Option<String>,
}

impl RemoteCustomFieldOption {
    /// The value to send when selecting this option.
    pub fn payload_value(&self) -> String {
        self.value.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// A field from the remote person/organization schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCustomField {
    pub id: i64,
    /// Opaque key used in payloads (a hash for custom fields).
    pub key: String,
    /// Human label, fuzzy-matched during discovery.
    pub name: String,
    pub field_type: String,
    pub options: Vec<RemoteCustomFieldOption>,
}

/// Person field keys resolved by name-matching. Every entry is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCustomFieldMapping {
    pub still_active_field_key: Option<String>,
    pub active_value: Option<String>,
    pub inactive_value: Option<String>,
    pub campaign_field_key: Option<String>,
    pub warmness_field_key: Option<String>,
    pub last_contacted_field_key: Option<String>,
    pub label_field_key: Option<String>,
}

/// Organization field keys resolved by name-matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationFieldMapping {
    pub country_field_key: Option<String>,
    pub sector_field_key: Option<String>,
    pub size_field_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_org_name() {
        assert_eq!(normalize_org_name("  Acme   Corp "), "acme corp");
        assert_eq!(normalize_org_name("ACME CORP"), "acme corp");
        assert_eq!(normalize_org_name(""), "");
    }

    #[test]
    fn test_remote_activity_type_mapping() {
        assert_eq!(ActivityType::Call.remote_type(), "call");
        assert_eq!(ActivityType::Email.remote_type(), "email");
        assert_eq!(ActivityType::Meeting.remote_type(), "meeting");
        assert_eq!(ActivityType::Conference.remote_type(), "meeting");
        assert_eq!(ActivityType::MeetingRequest.remote_type(), "meeting_request");
        assert_eq!(ActivityType::Linkedin.remote_type(), "task");
        assert_eq!(ActivityType::Referral.remote_type(), "task");
    }

    #[test]
    fn test_enum_string_forms_parse_back() {
        for t in [
            ActivityType::Call,
            ActivityType::MeetingRequest,
            ActivityType::Conference,
        ] {
            assert_eq!(t.as_str().parse::<ActivityType>().unwrap(), t);
        }
        assert_eq!("SYNCED".parse::<SyncStatus>().unwrap(), SyncStatus::Synced);
        assert!("synced".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_option_payload_value_prefers_value() {
        let with_value = RemoteCustomFieldOption {
            id: 7,
            label: "Active".into(),
            value: Some("1".into()),
        };
        let id_only = RemoteCustomFieldOption {
            id: 7,
            label: "Active".into(),
            value: None,
        };
        assert_eq!(with_value.payload_value(), "1");
        assert_eq!(id_only.payload_value(), "7");
    }

    #[test]
    fn test_new_contact_is_active_and_unlinked() {
        let c = LocalContact::new("Ada");
        assert!(c.is_active);
        assert!(!c.is_linked());
        assert_eq!(c.update_sync_status, SyncStatus::Pending);
    }
}
