//! Complex value type stored by the user-data backup.

use crate::generator::DICTIONARY_NAME;
use relcoll_core::{BackupReader, CoreError, CoreResult, StateProviderName, StateSerializer};
use serde::{Deserialize, Serialize};

/// A user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Display name.
    pub name: String,
    /// Age in years.
    pub age: u32,
    /// Contact address.
    pub email: String,
    /// Free-form labels.
    pub tags: Vec<String>,
    /// Mailing address, if known.
    pub address: Option<Address>,
}

/// A postal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Street and number.
    pub street: String,
    /// City.
    pub city: String,
    /// Postal code.
    pub zip: String,
}

impl Default for User {
    fn default() -> Self {
        Self {
            name: "Ada Lovelace".to_string(),
            age: 36,
            email: "ada@example.com".to_string(),
            tags: vec!["admin".to_string(), "beta".to_string()],
            address: Some(Address {
                street: "12 St James's Square".to_string(),
                city: "London".to_string(),
                zip: "SW1Y 4JH".to_string(),
            }),
        }
    }
}

/// JSON serializer for [`User`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UserSerializer;

impl StateSerializer<User> for UserSerializer {
    fn write(&self, value: &User) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CoreError::codec(e.to_string()))
    }

    fn read(&self, bytes: &[u8]) -> CoreResult<User> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

/// Number of users in a generated backup.
///
/// `None` when the backup has no generated dictionary. Fails when its values
/// are not [`User`] records.
pub fn count_users(reader: &BackupReader) -> CoreResult<Option<usize>> {
    let name = StateProviderName::new(DICTIONARY_NAME)?;
    if reader.provider(&name).is_err() {
        return Ok(None);
    }
    let users = reader.dictionary_entries::<i64, User>(&name, &UserSerializer)?;
    Ok(Some(users.len()))
}
