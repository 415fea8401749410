//! Outbound payload sanitization.
//!
//! Every free-text value sent to Pipedrive passes through [`clean_text`]:
//! `<script>`/`<style>` blocks are removed with their content, remaining
//! tags are stripped, `javascript:` URLs are neutralized, whitespace is
//! collapsed, and the result is truncated to a per-field character limit.
//!
//! Truncation counts `char`s, not bytes, so multi-byte text never splits
//! inside a code point.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<\s*(script|style)\b[^>]*>.*?<\s*/\s*(script|style)\s*>")
        .expect("script block pattern is valid")
});

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern is valid"));

static JS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)javascript\s*:").expect("javascript url pattern is valid"));

/// Per-field maximum lengths, in characters.
#[derive(Debug, Clone, Deserialize)]
pub struct SanitizeLimits {
    #[serde(default = "default_name_max")]
    pub name_max: usize,
    #[serde(default = "default_email_max")]
    pub email_max: usize,
    #[serde(default = "default_phone_max")]
    pub phone_max: usize,
    #[serde(default = "default_organization_max")]
    pub organization_max: usize,
    #[serde(default = "default_note_max")]
    pub note_max: usize,
    #[serde(default = "default_subject_max")]
    pub subject_max: usize,
}

fn default_name_max() -> usize {
    255
}
fn default_email_max() -> usize {
    255
}
fn default_phone_max() -> usize {
    50
}
fn default_organization_max() -> usize {
    255
}
fn default_note_max() -> usize {
    10_000
}
fn default_subject_max() -> usize {
    255
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            name_max: default_name_max(),
            email_max: default_email_max(),
            phone_max: default_phone_max(),
            organization_max: default_organization_max(),
            note_max: default_note_max(),
            subject_max: default_subject_max(),
        }
    }
}

impl SanitizeLimits {
    pub fn name(&self, s: &str) -> String {
        clean_text(s, self.name_max)
    }

    pub fn email(&self, s: &str) -> String {
        clean_text(s, self.email_max)
    }

    pub fn phone(&self, s: &str) -> String {
        clean_text(s, self.phone_max)
    }

    pub fn organization(&self, s: &str) -> String {
        clean_text(s, self.organization_max)
    }

    pub fn subject(&self, s: &str) -> String {
        clean_text(s, self.subject_max)
    }

    /// Notes keep their line breaks; only runs of spaces are collapsed.
    pub fn note(&self, s: &str) -> String {
        let stripped = strip_markup(s);
        let lines: Vec<String> = stripped
            .lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect();
        truncate_chars(lines.join("\n").trim(), self.note_max)
    }
}

/// Remove script/style blocks, tags, and `javascript:` schemes.
pub fn strip_markup(input: &str) -> String {
    let without_blocks = SCRIPT_BLOCK.replace_all(input, "");
    let without_tags = TAG.replace_all(&without_blocks, "");
    JS_URL.replace_all(&without_tags, "").into_owned()
}

/// Strip markup, collapse whitespace, and truncate to `max_chars`.
pub fn clean_text(input: &str, max_chars: usize) -> String {
    let stripped = strip_markup(input);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].trim_end().to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_script_blocks_with_content() {
        let out = clean_text("Ada<script>alert('x')</script> Lovelace", 100);
        assert_eq!(out, "Ada Lovelace");
    }

    #[test]
    fn test_strips_tags_keeps_text() {
        assert_eq!(clean_text("<b>Acme</b> <i>Corp</i>", 100), "Acme Corp");
    }

    #[test]
    fn test_neutralizes_javascript_scheme() {
        let out = clean_text("JavaScript:alert(1)", 100);
        assert!(!out.to_lowercase().contains("javascript:"));
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let out = clean_text("Zoë Ångström", 3);
        assert_eq!(out, "Zoë");
    }

    #[test]
    fn test_short_text_unchanged() {
        assert_eq!(clean_text("+1 555 0100", 50), "+1 555 0100");
    }

    #[test]
    fn test_note_keeps_line_breaks() {
        let limits = SanitizeLimits::default();
        let out = limits.note("Line one\n<p>Line   two</p>");
        assert_eq!(out, "Line one\nLine two");
    }

    #[test]
    fn test_limits_apply_per_field() {
        let limits = SanitizeLimits {
            phone_max: 4,
            ..SanitizeLimits::default()
        };
        assert_eq!(limits.phone("123456"), "1234");
        assert_eq!(limits.name("123456"), "123456");
    }
}
