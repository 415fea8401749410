//! Custom-field discovery against the live Pipedrive schema.
//!
//! Schemas are fetched fresh on every call and never cached across
//! requests, since fields and options can be edited in Pipedrive at any
//! time. Matching and translation themselves live in
//! [`pipesync_core::fields`].

use pipesync_core::error::SyncError;
use pipesync_core::fields;
use pipesync_core::models::{
    EntityKind, OrganizationFieldMapping, RemoteCustomField, RemoteCustomFieldMapping,
};

use crate::client::PipedriveClient;

pub async fn discover_fields(
    client: &PipedriveClient,
    kind: EntityKind,
) -> Result<Vec<RemoteCustomField>, SyncError> {
    let fields = match kind {
        EntityKind::Person => client.list_person_fields().await?,
        EntityKind::Organization => client.list_organization_fields().await?,
    };
    tracing::debug!(%kind, count = fields.len(), "discovered remote fields");
    Ok(fields)
}

/// Resolve the person field mapping. Absent fields stay `None`.
pub async fn discover_field_mapping(
    client: &PipedriveClient,
) -> Result<RemoteCustomFieldMapping, SyncError> {
    let fields = discover_fields(client, EntityKind::Person).await?;
    Ok(fields::build_person_mapping(&fields))
}

pub async fn discover_organization_mapping(
    client: &PipedriveClient,
) -> Result<OrganizationFieldMapping, SyncError> {
    let fields = discover_fields(client, EntityKind::Organization).await?;
    Ok(fields::build_organization_mapping(&fields))
}

/// Remote option id for a person label such as "Warm Lead".
///
/// Never fails: a missing label field, a missing option, or a failed
/// schema fetch all log a warning and return `None`.
pub async fn resolve_label_option(client: &PipedriveClient, label: &str) -> Option<String> {
    let fields = match discover_fields(client, EntityKind::Person).await {
        Ok(fields) => fields,
        Err(e) => {
            tracing::warn!(error = %e, label, "could not load person fields for label lookup");
            return None;
        }
    };
    let Some(field) = fields::find_field(&fields, fields::LABEL_CANDIDATES) else {
        tracing::warn!(label, "person schema has no label field");
        return None;
    };
    match fields::find_option_by_label(field, label) {
        Some(option) => Some(option.id.to_string()),
        None => {
            tracing::warn!(label, field = %field.name, "label option not found");
            None
        }
    }
}

/// Both schemas and their mappings, loaded once per bulk sync.
#[derive(Debug, Clone, Default)]
pub struct FieldContext {
    pub person_fields: Vec<RemoteCustomField>,
    pub person_mapping: RemoteCustomFieldMapping,
    pub organization_fields: Vec<RemoteCustomField>,
    pub organization_mapping: OrganizationFieldMapping,
}

impl FieldContext {
    pub async fn discover(client: &PipedriveClient) -> Result<Self, SyncError> {
        let person_fields = discover_fields(client, EntityKind::Person).await?;
        let organization_fields = discover_fields(client, EntityKind::Organization).await?;
        Ok(Self {
            person_mapping: fields::build_person_mapping(&person_fields),
            organization_mapping: fields::build_organization_mapping(&organization_fields),
            person_fields,
            organization_fields,
        })
    }

    /// Translate an organization enum field into its label.
    pub fn organization_value(
        &self,
        key: Option<&str>,
        value: Option<&serde_json::Value>,
    ) -> Option<String> {
        let key = key?;
        let value = value?;
        match fields::field_by_key(&self.organization_fields, key) {
            Some(field) if !field.options.is_empty() => fields::translate_value(field, value),
            _ => match value {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
        }
    }
}
