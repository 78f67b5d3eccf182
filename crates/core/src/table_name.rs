//! Storage object names
//!
//! Table names come from configuration and are interpolated into SQL, so they
//! are validated before use. A valid name matches
//! `^[A-Za-z_][A-Za-z0-9_.]{0,127}$`:
//!
//! - 1-128 characters
//! - first character is an ASCII letter or underscore
//! - remaining characters are ASCII alphanumeric, underscore or dot
//!
//! A dot separates a schema from a table (`audit.aggregator_groups`). At most
//! one dot is allowed, and both sides must be non-empty and start with a
//! letter or underscore, so that the name is a valid unquoted SQL identifier.

use crate::error::AggregatorError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a table name
pub const MAX_TABLE_NAME_LENGTH: usize = 128;

/// A validated storage object name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

/// Error when validating a table name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableNameError {
    /// Name is empty
    Empty,
    /// Name exceeds maximum length
    TooLong {
        /// Actual length of the name
        length: usize,
    },
    /// First character is not a letter or underscore
    InvalidStart {
        /// The offending character
        char: char,
    },
    /// Character outside `[A-Za-z0-9_.]`
    InvalidChar {
        /// The offending character
        char: char,
        /// Position of the character
        position: usize,
    },
    /// More than one dot
    TooManySegments,
    /// Schema or table part is empty or starts with a digit
    InvalidSegment {
        /// Byte offset where the bad segment starts
        position: usize,
    },
}

impl fmt::Display for TableNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableNameError::Empty => write!(f, "table name cannot be empty"),
            TableNameError::TooLong { length } => write!(
                f,
                "table name too long: {} chars (max {})",
                length, MAX_TABLE_NAME_LENGTH
            ),
            TableNameError::InvalidStart { char } => write!(
                f,
                "table name cannot start with '{}' (must start with a letter or underscore)",
                char
            ),
            TableNameError::InvalidChar { char, position } => write!(
                f,
                "invalid character '{}' at position {} (only letters, digits, underscore, dot allowed)",
                char, position
            ),
            TableNameError::TooManySegments => write!(
                f,
                "table name may contain at most one dot (schema.table)"
            ),
            TableNameError::InvalidSegment { position } => write!(
                f,
                "empty or invalid name segment at position {} (segments must start with a letter or underscore)",
                position
            ),
        }
    }
}

impl std::error::Error for TableNameError {}

impl TableName {
    /// Create a table name, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, TableNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(TableName(name))
    }

    /// Create a table name without validation
    ///
    /// The caller must ensure the name is valid. Use `new()` for untrusted input.
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        TableName(name.into())
    }

    /// Create a table name, reporting failures as configuration errors
    pub fn parse(name: &str) -> Result<Self, AggregatorError> {
        Self::new(name).map_err(|e| {
            AggregatorError::configuration(format!("invalid table name '{}': {}", name, e))
        })
    }

    /// Validate a table name
    pub fn validate(name: &str) -> Result<(), TableNameError> {
        let mut chars = name.chars();
        let first = match chars.next() {
            Some(c) => c,
            None => return Err(TableNameError::Empty),
        };

        if name.len() > MAX_TABLE_NAME_LENGTH {
            return Err(TableNameError::TooLong { length: name.len() });
        }

        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(TableNameError::InvalidStart { char: first });
        }

        for (pos, ch) in name.chars().enumerate().skip(1) {
            if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '.') {
                return Err(TableNameError::InvalidChar {
                    char: ch,
                    position: pos,
                });
            }
        }

        // Only ASCII remains, so byte offsets equal char positions
        if name.matches('.').count() > 1 {
            return Err(TableNameError::TooManySegments);
        }
        if let Some(dot) = name.find('.') {
            let table = &name[dot + 1..];
            match table.chars().next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
                _ => return Err(TableNameError::InvalidSegment { position: dot + 1 }),
            }
        }

        Ok(())
    }

    /// Full name as written in configuration
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name without any schema qualifier (`audit.groups` -> `groups`)
    pub fn unqualified(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = TableNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TableName::new(value)
    }
}

impl From<TableName> for String {
    fn from(name: TableName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_name_valid() {
        assert!(TableName::new("aggregator_groups").is_ok());
        assert!(TableName::new("_private").is_ok());
        assert!(TableName::new("audit.aggregator_items").is_ok());
        assert!(TableName::new("T1").is_ok());
        assert!(TableName::new("a".repeat(MAX_TABLE_NAME_LENGTH)).is_ok());
    }

    #[test]
    fn test_table_name_rejects_injection() {
        let err = TableName::new("groups; DROP TABLE items").unwrap_err();
        assert_eq!(
            err,
            TableNameError::InvalidChar {
                char: ';',
                position: 6
            }
        );
        assert!(TableName::new("groups--").is_err());
        assert!(TableName::new("\"quoted\"").is_err());
    }

    #[test]
    fn test_table_name_invalid_start() {
        assert_eq!(
            TableName::new("1groups").unwrap_err(),
            TableNameError::InvalidStart { char: '1' }
        );
        assert!(TableName::new(".groups").is_err());
    }

    #[test]
    fn test_table_name_empty_and_long() {
        assert_eq!(TableName::new("").unwrap_err(), TableNameError::Empty);
        let long = "a".repeat(MAX_TABLE_NAME_LENGTH + 1);
        assert!(matches!(
            TableName::new(long).unwrap_err(),
            TableNameError::TooLong { .. }
        ));
    }

    #[test]
    fn test_parse_reports_configuration_error() {
        let err = TableName::parse("bad name").unwrap_err();
        assert!(matches!(err, AggregatorError::Configuration(_)));
        assert!(err.to_string().contains("bad name"));
    }

    #[test]
    fn test_table_name_segments() {
        assert_eq!(
            TableName::new("x.").unwrap_err(),
            TableNameError::InvalidSegment { position: 2 }
        );
        assert_eq!(
            TableName::new("audit.1items").unwrap_err(),
            TableNameError::InvalidSegment { position: 6 }
        );
        assert_eq!(
            TableName::new("a.b.c").unwrap_err(),
            TableNameError::TooManySegments
        );
        assert!(TableName::new("a..b").is_err());
        assert!(TableName::new("_s._t").is_ok());

        let err = TableName::parse("x.").unwrap_err();
        assert!(matches!(err, AggregatorError::Configuration(_)));
    }

    proptest! {
        #[test]
        fn prop_identifiers_are_accepted(
            name in "[A-Za-z_][A-Za-z0-9_]{0,60}(\\.[A-Za-z_][A-Za-z0-9_]{0,60})?"
        ) {
            prop_assert!(TableName::new(name).is_ok());
        }

        #[test]
        fn prop_foreign_characters_are_rejected(
            name in "[A-Za-z_][A-Za-z0-9_]{0,20}[^A-Za-z0-9_.][A-Za-z0-9_]{0,20}"
        ) {
            let is_invalid_char = matches!(
                TableName::new(name),
                Err(TableNameError::InvalidChar { .. })
            );
            prop_assert!(is_invalid_char);
        }

        #[test]
        fn prop_long_names_are_rejected(extra in 1usize..64) {
            let name = "t".repeat(MAX_TABLE_NAME_LENGTH + extra);
            let is_too_long = matches!(
                TableName::new(name),
                Err(TableNameError::TooLong { .. })
            );
            prop_assert!(is_too_long);
        }
    }

    #[test]
    fn test_unqualified() {
        assert_eq!(TableName::new("audit.groups").unwrap().unqualified(), "groups");
        assert_eq!(TableName::new("groups").unwrap().unqualified(), "groups");
    }

    #[test]
    fn test_serde_validates() {
        let ok: TableName = serde_json::from_str("\"items\"").unwrap();
        assert_eq!(ok.as_str(), "items");
        assert!(serde_json::from_str::<TableName>("\"it ems\"").is_err());
    }
}
