//! Identifier quoting and user-facing name validation for tables and columns.
use crate::error::{ModelError, ModelResult};
use unicode_normalization::UnicodeNormalization;

/// Name of the mandatory first column of every table.
pub const ID_COLUMN: &str = "id";

/// Quote an identifier for SQLite (`"name"`, with embedded quotes doubled).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comparison key for uniqueness checks.
///
/// SQLite compares identifiers case-insensitively, so two names that only
/// differ by case (or by Unicode normalization form) would collide.
pub fn name_key(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

/// Check a proposed table or column name.
pub fn validate_name(name: &str) -> ModelResult<()> {
    let invalid = |reason: &'static str| ModelError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.starts_with('_') {
        return Err(invalid("name must not start with an underscore"));
    }
    if name.contains(['"', '\'', '&']) {
        return Err(invalid("name must not contain quotes or '&'"));
    }
    Ok(())
}

/// Validate `name` and check it against `existing` (compared via [`name_key`]).
pub fn validate_unique<'a>(
    name: &str,
    existing: impl IntoIterator<Item = &'a str>,
) -> ModelResult<()> {
    validate_name(name)?;
    let key = name_key(name);
    if existing.into_iter().any(|other| name_key(other) == key) {
        return Err(ModelError::InvalidName {
            name: name.to_string(),
            reason: "name is already in use",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_shapes() {
        assert!(validate_name("").is_err());
        assert!(validate_name("_hidden").is_err());
        assert!(validate_name("a\"b").is_err());
        assert!(validate_name("R&D").is_err());
        assert!(validate_name("weight (g)").is_ok());
    }

    #[test]
    fn uniqueness_ignores_case() {
        assert!(validate_unique("Weight", ["id", "weight"]).is_err());
        assert!(validate_unique("height", ["id", "weight"]).is_ok());
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
