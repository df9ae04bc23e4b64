//! Access levels and client authentication.
//!
//! Three ordered levels gate what a script may do. [`require`] is the only
//! place a level is checked; devices and daemon commands both go through it
//! (via [`Context::require`](crate::context::Context::require)).

use crate::config::{DaemonConfig, PasswdEntry};
use crate::error::{AppResult, IcsError};
use md5::Md5;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Guest,
    User,
    #[default]
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Guest => "guest",
            AccessLevel::User => "user",
            AccessLevel::Admin => "admin",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "guest" | "0" => Some(AccessLevel::Guest),
            "user" | "1" => Some(AccessLevel::User),
            "admin" | "2" => Some(AccessLevel::Admin),
            _ => None,
        }
    }

    /// Accepts `"admin"`, `2` or `{"level": "admin"}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Self::parse(name),
            Value::Number(n) => n.as_u64().and_then(|n| Self::parse(&n.to_string())),
            Value::Object(map) => map.get("level").and_then(Self::from_value),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail with an access error unless `current` reaches `required`.
pub fn require(
    current: AccessLevel,
    required: AccessLevel,
    device: Option<&str>,
    action: &str,
) -> AppResult<()> {
    if current >= required {
        return Ok(());
    }
    Err(IcsError::Access {
        device: device.map(str::to_string),
        required: required.to_string(),
        message: format!("{} not allowed for {} level", action, current),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Everybody is trusted with admin rights.
    #[default]
    None,
    /// Static user list with password hashes.
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Lowercase hex digest of `input`.
    pub fn hex_digest(&self, input: &str) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// An authenticated daemon client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub level: AccessLevel,
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    method: AuthMethod,
    algorithm: HashAlgorithm,
    entries: Vec<PasswdEntry>,
}

impl Authenticator {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            method: config.auth_method,
            algorithm: config.hash_algorithm,
            entries: config.passwd.clone(),
        }
    }

    /// Trust-all authenticator.
    pub fn none() -> Self {
        Self {
            method: AuthMethod::None,
            algorithm: HashAlgorithm::default(),
            entries: Vec::new(),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Check `password`, which may be the plain password or its hex digest.
    pub fn authenticate(&self, user: &str, password: &str) -> AppResult<User> {
        match self.method {
            AuthMethod::None => Ok(User {
                name: if user.is_empty() { "admin" } else { user }.to_string(),
                level: AccessLevel::Admin,
            }),
            AuthMethod::List => {
                let entry = self
                    .entries
                    .iter()
                    .find(|e| e.user == user)
                    .ok_or_else(|| IcsError::Authentication(format!("unknown user '{}'", user)))?;
                let stored = entry.hash.to_ascii_lowercase();
                let accepted = if stored.is_empty() {
                    password.is_empty()
                } else {
                    password.to_ascii_lowercase() == stored
                        || self.algorithm.hex_digest(password) == stored
                };
                if !accepted {
                    return Err(IcsError::Authentication(format!(
                        "wrong password for user '{}'",
                        user
                    )));
                }
                Ok(User {
                    name: entry.user.clone(),
                    level: entry.level,
                })
            }
        }
    }
}
