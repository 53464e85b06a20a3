use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{errors::Error, Result};

/// Numeric bot id, taken from the credential prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityId(pub u64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bot credential (`<bot id>:<secret>`).
///
/// `Debug` and `Display` never print the secret part; use [`Credential::expose`]
/// where the raw token is required (client construction, webhook URLs).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    raw: String,
    id: IdentityId,
}

impl Credential {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.chars().any(char::is_whitespace) {
            return Err(Error::InvalidCredential(
                "credential must not contain whitespace".to_string(),
            ));
        }
        let Some((left, right)) = raw.split_once(':') else {
            return Err(Error::InvalidCredential(
                "credential must look like <id>:<secret>".to_string(),
            ));
        };
        if right.is_empty()
            || !right
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidCredential(
                "credential secret part is malformed".to_string(),
            ));
        }
        let id = left
            .parse::<u64>()
            .map_err(|_| Error::InvalidCredential("credential id part is not numeric".to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            id: IdentityId(id),
        })
    }

    pub fn id(&self) -> IdentityId {
        self.id
    }

    pub fn expose(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}:***)", self.id)
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:***", self.id)
    }
}

/// Who-am-i result for a validated credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotProfile {
    pub id: IdentityId,
    pub username: Option<String>,
    pub first_name: String,
}

/// One inbound update, kept in wire form so the core stays framework-agnostic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "update_id")]
    pub id: i64,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl Update {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Full wire representation (payload plus `update_id`).
    pub fn to_value(&self) -> Value {
        let mut obj = self.payload.clone();
        obj.insert("update_id".to_string(), Value::from(self.id));
        Value::Object(obj)
    }
}
