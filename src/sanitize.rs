// Input sanitizing
// Every value read from an import file is untrusted. Each stored field goes
// through the cleaner for its type first; no cleaner ever fails, bad input
// comes out as an empty string.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use regex::Regex;
use scraper::{Html, Node};
use serde::{Deserialize, Serialize};
use validator::ValidateEmail;

use crate::constants::{PHONE_MASK, PHONE_MASK_MIN_DIGITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Name,
    Phone,
    Email,
    License,
    Specialty,
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static sanitizer pattern"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\s+")
}

/// Markup-free, entity-decoded, whitespace-collapsed text.
pub fn text(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let fragment = Html::parse_fragment(value);
    let mut out = String::with_capacity(value.len());

    for node in fragment.tree.root().descendants() {
        let Node::Text(chunk) = node.value() else {
            continue;
        };
        let in_code = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|el| matches!(el.name(), "script" | "style"))
                .unwrap_or(false)
        });
        if !in_code {
            out.push_str(chunk);
        }
    }

    whitespace_re().replace_all(&out, " ").trim().to_string()
}

/// Person name: letters, spaces, hyphens and apostrophes only.
pub fn name(value: &str) -> String {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    static DISALLOWED: OnceLock<Regex> = OnceLock::new();
    static HYPHENS: OnceLock<Regex> = OnceLock::new();

    let value = text(value);
    let value = regex(&DIGITS, r"[0-9]").replace_all(&value, "");
    let value = regex(&DISALLOWED, r"[^\p{L}\s\-']").replace_all(&value, "");
    let value = whitespace_re().replace_all(&value, " ");
    let value = regex(&HYPHENS, r"-+").replace_all(&value, "-");
    value.trim().to_string()
}

/// Phone: digits and dialling punctuation only.
pub fn phone(value: &str) -> String {
    static DISALLOWED: OnceLock<Regex> = OnceLock::new();

    let value = regex(&DISALLOWED, r"[^0-9+\-\s()]").replace_all(value, "");
    whitespace_re().replace_all(&value, " ").trim().to_string()
}

/// Lower-cased email, or "" if it is not a deliverable-looking address.
pub fn email(value: &str) -> String {
    let value = text(value).to_lowercase();
    if value.is_empty() || !value.validate_email() {
        return String::new();
    }

    // Reject dotless domains such as "user@localhost"
    let dotted = value
        .rsplit_once('@')
        .map(|(_, domain)| {
            domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        })
        .unwrap_or(false);

    if dotted { value } else { String::new() }
}

/// License number: ASCII alphanumerics, hyphen and slash.
pub fn license(value: &str) -> String {
    static DISALLOWED: OnceLock<Regex> = OnceLock::new();
    regex(&DISALLOWED, r"[^a-zA-Z0-9\-/]")
        .replace_all(value, "")
        .trim()
        .to_string()
}

/// Specialty: Hebrew and Latin letters plus simple separators.
pub fn specialty(value: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static DISALLOWED: OnceLock<Regex> = OnceLock::new();

    let value = text(value);
    let value = regex(&TAGS, r"<[^>]*>").replace_all(&value, "");
    let value = regex(&DISALLOWED, r"[^\p{Hebrew}\p{Latin}\s\-()/,]").replace_all(&value, "");
    value.trim().to_string()
}

/// Clean one value by type. Absent input yields "".
pub fn field(field_type: FieldType, value: Option<&str>) -> String {
    let Some(value) = value else {
        return String::new();
    };

    match field_type {
        FieldType::Text => text(value),
        FieldType::Name => name(value),
        FieldType::Phone => phone(value),
        FieldType::Email => email(value),
        FieldType::License => license(value),
        FieldType::Specialty => specialty(value),
    }
}

/// Clean every value in a row. Fields without a declared type are text.
pub fn row(
    fields: &BTreeMap<String, String>,
    field_types: &HashMap<String, FieldType>,
) -> BTreeMap<String, String> {
    fields
        .iter()
        .map(|(key, value)| {
            let field_type = field_types.get(key).copied().unwrap_or_default();
            (key.clone(), field(field_type, Some(value)))
        })
        .collect()
}

/// Phone for log lines: "050-***-4567", or "***" when too short to mask.
pub fn mask_phone(value: &str) -> String {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < PHONE_MASK_MIN_DIGITS {
        return PHONE_MASK.to_string();
    }
    format!("{}-***-{}", &digits[..3], &digits[digits.len() - 4..])
}
