// Column mapping: source header text -> canonical doctor field

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DocrateError;
use crate::sanitize::FieldType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    FirstName,
    LastName,
    LicenseNumber,
    Phone,
    Email,
    City,
    Address,
    Specialty,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 8] = [
        CanonicalField::FirstName,
        CanonicalField::LastName,
        CanonicalField::LicenseNumber,
        CanonicalField::Phone,
        CanonicalField::Email,
        CanonicalField::City,
        CanonicalField::Address,
        CanonicalField::Specialty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::FirstName => "first_name",
            CanonicalField::LastName => "last_name",
            CanonicalField::LicenseNumber => "license_number",
            CanonicalField::Phone => "phone",
            CanonicalField::Email => "email",
            CanonicalField::City => "city",
            CanonicalField::Address => "address",
            CanonicalField::Specialty => "specialty",
        }
    }

    /// Header spellings seen in insurer files, in priority order.
    pub fn synonyms(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::FirstName => &["שם פרטי", "first name", "firstname", "שם"],
            CanonicalField::LastName => &["שם משפחה", "last name", "lastname", "משפחה"],
            CanonicalField::LicenseNumber => &["מספר רישיון", "רישיון", "license", "license number", "lic"],
            CanonicalField::Phone => &["טלפון", "phone", "tel", "telephone", "נייד", "mobile"],
            CanonicalField::Email => &["אימייל", "מייל", "email", "e-mail"],
            CanonicalField::City => &["עיר", "city", "ישוב"],
            CanonicalField::Address => &["כתובת", "address", "רחוב"],
            CanonicalField::Specialty => &["התמחות", "specialty", "specialization", "תחום"],
        }
    }

    /// Sanitizer applied to values of this field.
    pub fn field_type(&self) -> FieldType {
        match self {
            CanonicalField::FirstName | CanonicalField::LastName => FieldType::Name,
            CanonicalField::LicenseNumber => FieldType::License,
            CanonicalField::Phone => FieldType::Phone,
            CanonicalField::Email => FieldType::Email,
            CanonicalField::City | CanonicalField::Address => FieldType::Text,
            CanonicalField::Specialty => FieldType::Specialty,
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = DocrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalField::ALL
            .into_iter()
            .find(|f| f.as_str() == s.trim())
            .ok_or_else(|| DocrateError::Other(format!("Unknown field '{}'", s)))
    }
}

/// canonical field -> source header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    columns: BTreeMap<CanonicalField, String>,
}

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: CanonicalField, header: impl Into<String>) {
        self.columns.insert(field, header.into());
    }

    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.columns.get(&field).map(|h| h.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CanonicalField, &str)> {
        self.columns.iter().map(|(f, h)| (*f, h.as_str()))
    }

    /// Re-key a raw row by canonical field name. Unmapped headers keep their
    /// original text; a mapped header never appears under its source name.
    pub fn apply(&self, fields: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let by_header: BTreeMap<&str, CanonicalField> =
            self.columns.iter().map(|(f, h)| (h.as_str(), *f)).collect();

        let mut out = BTreeMap::new();
        for (header, value) in fields {
            match by_header.get(header.as_str()) {
                Some(field) => {
                    out.insert(field.as_str().to_string(), value.clone());
                }
                None => {
                    out.entry(header.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        out
    }
}

/// Match headers against the synonym table. Case-insensitive on trimmed
/// headers; for each field the first synonym present wins.
pub fn detect_column_mapping<S: AsRef<str>>(headers: &[S]) -> ColumnMapping {
    let normalized: Vec<String> = headers
        .iter()
        .map(|h| h.as_ref().trim().to_lowercase())
        .collect();

    let mut mapping = ColumnMapping::new();
    for field in CanonicalField::ALL {
        let found = field.synonyms().iter().find_map(|synonym| {
            let synonym = synonym.to_lowercase();
            normalized.iter().position(|h| *h == synonym)
        });
        if let Some(idx) = found {
            mapping.insert(field, headers[idx].as_ref());
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_english_headers() {
        let mapping = detect_column_mapping(&["Phone", "Email", "City"]);
        assert_eq!(mapping.get(CanonicalField::Phone), Some("Phone"));
        assert_eq!(mapping.get(CanonicalField::Email), Some("Email"));
        assert_eq!(mapping.get(CanonicalField::City), Some("City"));
        assert_eq!(mapping.get(CanonicalField::FirstName), None);
    }

    #[test]
    fn test_detect_hebrew_headers() {
        let mapping = detect_column_mapping(&[" שם פרטי ", "שם משפחה", "מספר רישיון", "התמחות"]);
        assert_eq!(mapping.get(CanonicalField::FirstName), Some(" שם פרטי "));
        assert_eq!(mapping.get(CanonicalField::LastName), Some("שם משפחה"));
        assert_eq!(mapping.get(CanonicalField::LicenseNumber), Some("מספר רישיון"));
        assert_eq!(mapping.get(CanonicalField::Specialty), Some("התמחות"));
    }

    #[test]
    fn test_first_synonym_wins() {
        // "tel" and "mobile" both map to phone; "tel" is listed first
        let mapping = detect_column_mapping(&["Mobile", "TEL"]);
        assert_eq!(mapping.get(CanonicalField::Phone), Some("TEL"));
    }

    #[test]
    fn test_apply_rekeys_and_keeps_unmapped() {
        let mapping = detect_column_mapping(&["First Name", "Notes"]);
        let mut row = BTreeMap::new();
        row.insert("First Name".to_string(), "Dana".to_string());
        row.insert("Notes".to_string(), "x".to_string());

        let applied = mapping.apply(&row);
        assert_eq!(applied["first_name"], "Dana");
        assert_eq!(applied["Notes"], "x");
        assert!(!applied.contains_key("First Name"));
    }

    #[test]
    fn test_field_from_str() {
        assert_eq!("license_number".parse::<CanonicalField>().unwrap(), CanonicalField::LicenseNumber);
        assert!("nickname".parse::<CanonicalField>().is_err());
        assert_eq!(CanonicalField::Email.field_type(), FieldType::Email);
    }
}
