//! Explicit caller identity passed into every runtime operation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of authenticated account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Books appointments.
    Patient,
    /// Offers slots and stocks doses.
    Caregiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patient => f.write_str("patient"),
            Self::Caregiver => f.write_str("caregiver"),
        }
    }
}

/// An already-authenticated caller. Credential checks happen before one is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    /// Account username.
    pub username: String,
    /// Account kind.
    pub role: Role,
}

/// The session's role does not permit the action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{action} requires a {required} session, not {actual}")]
pub struct Forbidden {
    /// Attempted action.
    pub action: &'static str,
    /// Role the action needs.
    pub required: Role,
    /// Role of the caller.
    pub actual: Role,
}

impl Session {
    /// Session of a patient.
    pub fn patient(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: Role::Patient,
        }
    }

    /// Session of a caregiver.
    pub fn caregiver(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: Role::Caregiver,
        }
    }

    /// Returns the username when the session has `required` role.
    pub fn require(&self, required: Role, action: &'static str) -> Result<&str, Forbidden> {
        if self.role == required {
            Ok(&self.username)
        } else {
            Err(Forbidden {
                action,
                required,
                actual: self.role,
            })
        }
    }
}
