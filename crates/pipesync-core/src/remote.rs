//! Normalization of Pipedrive payloads into canonical shapes.
//!
//! The remote API is loosely typed and inconsistent across endpoints:
//! a person's email may arrive as a string, as an array of strings, or as
//! an array of `{value, primary}` objects, under `email` or `emails`;
//! `org_id` and `owner_id` are numbers on some endpoints and nested
//! objects on others; labels come as `label` or `label_ids`. All of that
//! probing happens here, once, at the boundary. Nothing above the client
//! looks at raw JSON field shapes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{RemoteCustomField, RemoteCustomFieldOption};

/// Canonical remote person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemotePerson {
    pub id: String,
    pub name: String,
    /// Primary address first.
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub org_id: Option<String>,
    pub org_name: Option<String>,
    pub owner_id: Option<String>,
    pub label: Option<i64>,
    pub update_time: Option<DateTime<Utc>>,
    /// The full raw record, for custom-field lookups by key.
    #[serde(skip)]
    pub fields: Map<String, Value>,
}

impl RemotePerson {
    pub fn primary_email(&self) -> Option<&str> {
        self.emails.first().map(String::as_str)
    }

    pub fn primary_phone(&self) -> Option<&str> {
        self.phones.first().map(String::as_str)
    }

    /// Raw value of a custom field by payload key, ignoring nulls.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Human label for this record in progress reports.
    pub fn display_label(&self) -> String {
        match self.primary_email() {
            Some(email) => format!("{} <{}>", self.name, email),
            None => self.name.clone(),
        }
    }
}

/// Canonical remote organization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteOrganization {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub fields: Map<String, Value>,
}

impl RemoteOrganization {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteUser {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteFilter {
    pub id: String,
    pub name: String,
    pub filter_type: Option<String>,
}

/// One page of a list endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    /// `additional_data.pagination.more_items_in_collection`, when present.
    pub more_items: Option<bool>,
    pub next_start: Option<u64>,
    /// Collection size, when the endpoint reports one.
    pub total: Option<u64>,
}

/// Render a numeric or string id as a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(obj) => obj
            .get("value")
            .or_else(|| obj.get("id"))
            .and_then(id_string),
        _ => None,
    }
}

/// Pipedrive timestamps are `YYYY-MM-DD HH:MM:SS` in UTC; RFC 3339 is
/// accepted too.
pub fn parse_remote_time(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Collect contact values from every shape the API uses.
fn contact_values(record: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    let mut primary = Vec::new();
    let mut rest = Vec::new();
    for key in keys {
        match record.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => rest.push(s.trim().to_string()),
            Some(Value::Array(entries)) => {
                for entry in entries {
                    match entry {
                        Value::String(s) if !s.trim().is_empty() => {
                            rest.push(s.trim().to_string())
                        }
                        Value::Object(obj) => {
                            let Some(v) = obj.get("value").and_then(Value::as_str) else {
                                continue;
                            };
                            if v.trim().is_empty() {
                                continue;
                            }
                            if obj.get("primary").and_then(Value::as_bool) == Some(true) {
                                primary.push(v.trim().to_string());
                            } else {
                                rest.push(v.trim().to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    primary.extend(rest);
    let mut seen = std::collections::HashSet::new();
    primary.retain(|v| seen.insert(v.to_lowercase()));
    primary
}

/// Normalize a person record. Returns `None` when the record has no id.
pub fn normalize_person(value: &Value) -> Option<RemotePerson> {
    let record = value.as_object()?;
    let id = record.get("id").and_then(id_string)?;
    let name = record
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("(unnamed)")
        .to_string();

    let org_id = record.get("org_id").and_then(id_string);
    let org_name = record
        .get("org_name")
        .and_then(Value::as_str)
        .or_else(|| {
            record
                .get("org_id")
                .and_then(|v| v.get("name"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);

    let label = record
        .get("label")
        .and_then(Value::as_i64)
        .or_else(|| {
            record
                .get("label_ids")
                .and_then(Value::as_array)
                .and_then(|ids| ids.first())
                .and_then(Value::as_i64)
        });

    Some(RemotePerson {
        id,
        name,
        emails: contact_values(record, &["email", "emails", "primary_email"]),
        phones: contact_values(record, &["phone", "phones"]),
        org_id,
        org_name,
        owner_id: record.get("owner_id").and_then(id_string),
        label,
        update_time: record.get("update_time").and_then(parse_remote_time),
        fields: record.clone(),
    })
}

/// Normalize an organization record, including search-result wrappers
/// of the form `{ "item": { ... } }`.
pub fn normalize_organization(value: &Value) -> Option<RemoteOrganization> {
    let record = match value.get("item") {
        Some(inner) => inner.as_object()?,
        None => value.as_object()?,
    };
    Some(RemoteOrganization {
        id: record.get("id").and_then(id_string)?,
        name: record
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        fields: record.clone(),
    })
}

pub fn normalize_user(value: &Value) -> Option<RemoteUser> {
    let record = value.as_object()?;
    Some(RemoteUser {
        id: record.get("id").and_then(id_string)?,
        name: record.get("name").and_then(Value::as_str).map(str::to_string),
        email: record
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub fn normalize_filter(value: &Value) -> Option<RemoteFilter> {
    let record = value.as_object()?;
    Some(RemoteFilter {
        id: record.get("id").and_then(id_string)?,
        name: record.get("name").and_then(Value::as_str)?.to_string(),
        filter_type: record.get("type").and_then(Value::as_str).map(str::to_string),
    })
}

/// Normalize a schema field from `personFields` / `organizationFields`.
pub fn normalize_field(value: &Value) -> Option<RemoteCustomField> {
    let record = value.as_object()?;
    let options = record
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    Some(RemoteCustomFieldOption {
                        id: o
                            .get("id")
                            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))?,
                        label: o.get("label").and_then(Value::as_str)?.to_string(),
                        value: o.get("value").and_then(id_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RemoteCustomField {
        id: record.get("id").and_then(Value::as_i64).unwrap_or_default(),
        key: record.get("key").and_then(Value::as_str)?.to_string(),
        name: record.get("name").and_then(Value::as_str)?.to_string(),
        field_type: record
            .get("field_type")
            .and_then(Value::as_str)
            .unwrap_or("varchar")
            .to_string(),
        options,
    })
}

/// Split a list response into items and pagination metadata.
///
/// `data` may be an array, `null` (empty collection), or an object with
/// an `items` array (search endpoints).
pub fn parse_page(body: &Value) -> Page {
    let items = match body.get("data") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(obj)) => obj
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    let pagination = body
        .get("additional_data")
        .and_then(|a| a.get("pagination"));
    Page {
        items,
        more_items: pagination
            .and_then(|p| p.get("more_items_in_collection"))
            .and_then(Value::as_bool),
        next_start: pagination
            .and_then(|p| p.get("next_start"))
            .and_then(Value::as_u64),
        total: body
            .get("additional_data")
            .and_then(|a| a.get("summary"))
            .and_then(|s| s.get("total_count"))
            .and_then(Value::as_u64),
    }
}
