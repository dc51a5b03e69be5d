//! URI-like names for state providers and services.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between a collection name and the segment of one of its
/// implicit children.
const CHILD_SEPARATOR: char = '/';

/// Validates `scheme:rest`.
///
/// The scheme starts with an ASCII letter and continues with letters,
/// digits, `+`, `-` or `.`. The remainder is non-empty and has no
/// whitespace or control characters.
fn validate_uri(raw: &str) -> CoreResult<()> {
    let Some((scheme, rest)) = raw.split_once(':') else {
        return Err(CoreError::invalid_name(raw, "missing scheme"));
    };

    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return Err(CoreError::invalid_name(raw, "scheme must start with a letter")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return Err(CoreError::invalid_name(raw, "invalid character in scheme"));
    }

    if rest.is_empty() {
        return Err(CoreError::invalid_name(raw, "empty path"));
    }
    if rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::invalid_name(raw, "whitespace in path"));
    }
    Ok(())
}

/// Unique name of a state provider within a replica, e.g. `urn:testDictionary`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateProviderName(String);

impl StateProviderName {
    /// Parses and validates a provider name.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        validate_uri(&name)?;
        Ok(Self(name))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URI scheme (`urn` for `urn:testDictionary`).
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map_or("", |(scheme, _)| scheme)
    }

    /// Name of an implicit child, `<self>/<segment>`.
    pub fn child(&self, segment: &str) -> CoreResult<Self> {
        Self::new(format!("{}{CHILD_SEPARATOR}{segment}", self.0))
    }
}

impl fmt::Display for StateProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StateProviderName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StateProviderName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StateProviderName> for String {
    fn from(name: StateProviderName) -> Self {
        name.0
    }
}

/// Name of the service a replica belongs to, e.g. `fabric:/unittest/service7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    /// Parses and validates a service name.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        validate_uri(&name)?;
        Ok(Self(name))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
