//! Custom-field matching and option translation.
//!
//! Pipedrive custom fields are identified by opaque hash keys that differ
//! per account, so logical fields ("is this person still active?") are
//! located by case-insensitive substring matching of the field's human
//! name against an ordered candidate list. The first candidate that
//! matches any field wins; no match leaves the mapping entry empty.
//!
//! Enum fields carry options whose numeric id and `value` are used
//! interchangeably by different endpoints, so [`translate_option_id`]
//! accepts either.
//!
//! # Candidate lists
//!
//! | Logical field | Candidates (in priority order) |
//! |---------------|--------------------------------|
//! | still active | `still active`, `active`, `status` |
//! | campaign | `campaign` |
//! | warmness | `warmness`, `warm`, `lead score` |
//! | last contacted | `last contacted`, `last contact` |
//! | label | `label` |
//! | country | `country` |
//! | sector | `sector`, `industry` |
//! | size | `size`, `employees` |

use serde_json::Value;

use crate::models::{
    OrganizationFieldMapping, RemoteCustomField, RemoteCustomFieldMapping, RemoteCustomFieldOption,
};

pub const STILL_ACTIVE_CANDIDATES: &[&str] = &["still active", "active", "status"];
pub const CAMPAIGN_CANDIDATES: &[&str] = &["campaign"];
pub const WARMNESS_CANDIDATES: &[&str] = &["warmness", "warm", "lead score"];
pub const LAST_CONTACTED_CANDIDATES: &[&str] = &["last contacted", "last contact"];
pub const LABEL_CANDIDATES: &[&str] = &["label"];
pub const COUNTRY_CANDIDATES: &[&str] = &["country"];
pub const SECTOR_CANDIDATES: &[&str] = &["sector", "industry"];
pub const SIZE_CANDIDATES: &[&str] = &["size", "employees"];

const ACTIVE_LABELS: &[&str] = &["active", "yes", "still active", "true"];
const INACTIVE_LABELS: &[&str] = &["inactive", "no", "not active", "false"];

/// Locate the first field whose name contains one of `candidates`.
///
/// Candidates are tried in order; for each, fields are scanned in schema
/// order. Comparison is case-insensitive.
pub fn find_field<'a>(
    fields: &'a [RemoteCustomField],
    candidates: &[&str],
) -> Option<&'a RemoteCustomField> {
    candidates.iter().find_map(|candidate| {
        let candidate = candidate.to_lowercase();
        fields
            .iter()
            .find(|f| f.name.to_lowercase().contains(&candidate))
    })
}

fn normalized_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The option meaning "still active" on a yes/no style enum field.
pub fn active_option(field: &RemoteCustomField) -> Option<&RemoteCustomFieldOption> {
    field
        .options
        .iter()
        .find(|o| ACTIVE_LABELS.contains(&normalized_label(&o.label).as_str()))
        .or_else(|| {
            field.options.iter().find(|o| {
                let l = normalized_label(&o.label);
                l.contains("active") && !l.contains("inactive") && !l.contains("not")
            })
        })
}

/// The option meaning "no longer active".
pub fn inactive_option(field: &RemoteCustomField) -> Option<&RemoteCustomFieldOption> {
    field
        .options
        .iter()
        .find(|o| INACTIVE_LABELS.contains(&normalized_label(&o.label).as_str()))
        .or_else(|| {
            field.options.iter().find(|o| {
                let l = normalized_label(&o.label);
                l.contains("inactive") || l.contains("not active")
            })
        })
}

/// Find an option by its human label, case-insensitively.
pub fn find_option_by_label<'a>(
    field: &'a RemoteCustomField,
    label: &str,
) -> Option<&'a RemoteCustomFieldOption> {
    let wanted = normalized_label(label);
    field
        .options
        .iter()
        .find(|o| normalized_label(&o.label) == wanted)
}

/// Translate an opaque option id into its label.
///
/// Matches against both the option's `id` and its `value` parsed as an
/// integer. Returns `None` (and logs a warning) when neither matches;
/// callers treat that as a soft miss.
pub fn translate_option_id(field: &RemoteCustomField, option_id: i64) -> Option<String> {
    let found = field.options.iter().find(|o| {
        o.id == option_id
            || o
                .value
                .as_deref()
                .and_then(|v| v.trim().parse::<i64>().ok())
                == Some(option_id)
    });
    match found {
        Some(option) => Some(option.label.clone()),
        None => {
            tracing::warn!(
                field = %field.name,
                key = %field.key,
                option_id,
                "no option matches id or value; leaving untranslated"
            );
            None
        }
    }
}

/// Translate a raw payload value for an enum/set field.
///
/// Accepts a number, a numeric string, or a comma-separated list of ids
/// (multi-select). Translated labels are joined with `", "`. Returns
/// `None` when nothing translates.
pub fn translate_value(field: &RemoteCustomField, value: &Value) -> Option<String> {
    let ids: Vec<i64> = match value {
        Value::Number(n) => n.as_i64().into_iter().collect(),
        Value::String(s) => s
            .split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect(),
        _ => Vec::new(),
    };
    if ids.is_empty() {
        return match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };
    }
    let labels: Vec<String> = ids
        .into_iter()
        .filter_map(|id| translate_option_id(field, id))
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels.join(", "))
    }
}

/// Resolve the person field mapping from a freshly fetched schema.
pub fn build_person_mapping(fields: &[RemoteCustomField]) -> RemoteCustomFieldMapping {
    let still_active = find_field(fields, STILL_ACTIVE_CANDIDATES);
    RemoteCustomFieldMapping {
        still_active_field_key: still_active.map(|f| f.key.clone()),
        active_value: still_active
            .and_then(active_option)
            .map(|o| o.payload_value()),
        inactive_value: still_active
            .and_then(inactive_option)
            .map(|o| o.payload_value()),
        campaign_field_key: find_field(fields, CAMPAIGN_CANDIDATES).map(|f| f.key.clone()),
        warmness_field_key: find_field(fields, WARMNESS_CANDIDATES).map(|f| f.key.clone()),
        last_contacted_field_key: find_field(fields, LAST_CONTACTED_CANDIDATES)
            .map(|f| f.key.clone()),
        label_field_key: find_field(fields, LABEL_CANDIDATES).map(|f| f.key.clone()),
    }
}

/// Resolve the organization field mapping from a freshly fetched schema.
pub fn build_organization_mapping(fields: &[RemoteCustomField]) -> OrganizationFieldMapping {
    OrganizationFieldMapping {
        country_field_key: find_field(fields, COUNTRY_CANDIDATES).map(|f| f.key.clone()),
        sector_field_key: find_field(fields, SECTOR_CANDIDATES).map(|f| f.key.clone()),
        size_field_key: find_field(fields, SIZE_CANDIDATES).map(|f| f.key.clone()),
    }
}

/// Look a field up by its payload key.
pub fn field_by_key<'a>(fields: &'a [RemoteCustomField], key: &str) -> Option<&'a RemoteCustomField> {
    fields.iter().find(|f| f.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    fn option(id: i64, label: &str, value: Option<&str>) -> RemoteCustomFieldOption {
        RemoteCustomFieldOption {
            id,
            label: label.to_string(),
            value: value.map(str::to_string),
        }
    }

    fn field(key: &str, name: &str, options: Vec<RemoteCustomFieldOption>) -> RemoteCustomField {
        RemoteCustomField {
            id: 1,
            key: key.to_string(),
            name: name.to_string(),
            field_type: if options.is_empty() { "varchar" } else { "enum" }.to_string(),
            options,
        }
    }

    fn still_active_field() -> RemoteCustomField {
        field(
            "abc123",
            "Still Active?",
            vec![option(1, "Active", Some("1")), option(2, "Inactive", Some("2"))],
        )
    }

    #[test]
    fn test_still_active_mapping_resolves_key_and_active_value() {
        let fields = vec![field("name", "Name", vec![]), still_active_field()];
        let mapping = build_person_mapping(&fields);
        assert_eq!(mapping.still_active_field_key.as_deref(), Some("abc123"));
        assert_eq!(mapping.active_value.as_deref(), Some("1"));
        assert_eq!(mapping.inactive_value.as_deref(), Some("2"));
    }

    #[test]
    fn test_first_candidate_wins_over_schema_order() {
        let fields = vec![
            field("s1", "Status", vec![]),
            field("s2", "Still active", vec![]),
        ];
        let found = find_field(&fields, STILL_ACTIVE_CANDIDATES).unwrap();
        assert_eq!(found.key, "s2");
    }

    #[test]
    fn test_missing_fields_leave_mapping_empty() {
        let mapping = build_person_mapping(&[field("name", "Name", vec![])]);
        assert_eq!(mapping, RemoteCustomFieldMapping::default());
    }

    #[test]
    fn test_translate_matches_id_or_value() {
        let f = field(
            "k",
            "Sector",
            vec![option(40, "Fintech", Some("7")), option(41, "Health", None)],
        );
        assert_eq!(translate_option_id(&f, 40).as_deref(), Some("Fintech"));
        assert_eq!(translate_option_id(&f, 7).as_deref(), Some("Fintech"));
        assert_eq!(translate_option_id(&f, 41).as_deref(), Some("Health"));
    }

    #[traced_test]
    #[test]
    fn test_translate_miss_warns_and_returns_none() {
        let f = still_active_field();
        assert_eq!(translate_option_id(&f, 99), None);
        assert!(logs_contain("no option matches"));
    }

    #[test]
    fn test_translate_value_handles_sets_and_strings() {
        let f = field(
            "k",
            "Country",
            vec![option(1, "Germany", None), option(2, "France", None)],
        );
        assert_eq!(translate_value(&f, &json!(2)).as_deref(), Some("France"));
        assert_eq!(
            translate_value(&f, &json!("1,2")).as_deref(),
            Some("Germany, France")
        );
        assert_eq!(translate_value(&f, &json!("Spain")).as_deref(), Some("Spain"));
        assert_eq!(translate_value(&f, &json!(null)), None);
    }

    #[test]
    fn test_find_option_by_label_ignores_case_and_punctuation() {
        let f = field(
            "label",
            "Label",
            vec![option(5, "Hot lead", None), option(6, "Warm Lead", None)],
        );
        assert_eq!(find_option_by_label(&f, "warm lead").map(|o| o.id), Some(6));
        assert_eq!(find_option_by_label(&f, "WARM LEAD!").map(|o| o.id), Some(6));
        assert!(find_option_by_label(&f, "Cold").is_none());
    }

    #[test]
    fn test_organization_mapping() {
        let fields = vec![
            field("c", "HQ Country", vec![]),
            field("i", "Industry", vec![]),
            field("s", "Company Size", vec![]),
        ];
        let m = build_organization_mapping(&fields);
        assert_eq!(m.country_field_key.as_deref(), Some("c"));
        assert_eq!(m.sector_field_key.as_deref(), Some("i"));
        assert_eq!(m.size_field_key.as_deref(), Some("s"));
    }
}
