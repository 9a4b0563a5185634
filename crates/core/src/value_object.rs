//! Value objects: equality by value, not identity.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Maximum length of a [`Username`].
///
/// GitHub logins are short, but organization and bot names imported from the
/// API can be much longer than the usual 30 characters.
pub const USERNAME_MAX_LENGTH: usize = 255;

type UsernameValidator = fn(&str) -> DomainResult<()>;

/// Validators applied, in order, by [`Username::parse`].
const USERNAME_VALIDATORS: &[UsernameValidator] =
    &[validate_not_empty, validate_max_length, validate_charset];

fn validate_not_empty(value: &str) -> DomainResult<()> {
    if value.is_empty() {
        return Err(DomainError::validation("username must not be empty"));
    }
    Ok(())
}

fn validate_max_length(value: &str) -> DomainResult<()> {
    let len = value.chars().count();
    if len > USERNAME_MAX_LENGTH {
        return Err(DomainError::validation(format!(
            "username is {len} characters long, at most {USERNAME_MAX_LENGTH} allowed"
        )));
    }
    Ok(())
}

fn validate_charset(value: &str) -> DomainResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '+' | '-' | '_' | '[' | ']');
    match value.chars().find(|c| !allowed(*c)) {
        Some(c) => Err(DomainError::validation(format!(
            "username contains invalid character {c:?}"
        ))),
        None => Ok(()),
    }
}

/// A GitHub account name, validated once at construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        for validator in USERNAME_VALIDATORS {
            validator(&value)?;
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for Username {}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

impl core::fmt::Display for Username {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_github_style_names() {
        for name in ["octocat", "dependabot[bot]", "some-org", "a.b+c@d_e"] {
            assert!(Username::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn accepts_names_up_to_max_length() {
        let name = "a".repeat(USERNAME_MAX_LENGTH);
        assert_eq!(Username::parse(name.clone()).unwrap().as_str(), name);
    }

    #[test]
    fn rejects_too_long_names() {
        let name = "a".repeat(USERNAME_MAX_LENGTH + 1);
        assert!(matches!(
            Username::parse(name),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn rejects_empty_and_invalid_characters() {
        assert!(Username::parse("").is_err());
        assert!(Username::parse("with space").is_err());
        assert!(Username::parse("slash/name").is_err());
    }

    #[test]
    fn deserialization_runs_validators() {
        let ok: Username = serde_json::from_str("\"octocat\"").unwrap();
        assert_eq!(ok.as_str(), "octocat");
        assert!(serde_json::from_str::<Username>("\"bad name\"").is_err());
    }
}
