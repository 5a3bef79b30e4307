//! Actor identity as supplied by the session provider.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving stable actor ids from email addresses.
const ACTOR_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_0c52_93a4_4d0e_9a51_2f7c_1e3d_8a40);

/// Role stored on a user's profile row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// The authenticated person performing operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, email: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            email: email.into(),
            role,
        }
    }

    /// Actor whose id is derived from the (case-folded) email address, so the
    /// same login always maps to the same `created_by` owner.
    pub fn from_email(email: &str, role: Role) -> Self {
        let normalized = email.trim().to_ascii_lowercase();
        let id = Uuid::new_v5(&ACTOR_NAMESPACE, normalized.as_bytes());
        Self::new(id, normalized, role)
    }

    pub fn scope(&self) -> AccessScope {
        AccessScope {
            user_id: self.id,
            admin: self.role == Role::Admin,
        }
    }
}

/// Row visibility the backend applies on behalf of an actor.
///
/// Admins see every row. Everyone else sees clients they created, documents
/// they created or that belong to one of their clients, and their own audit
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessScope {
    pub user_id: Uuid,
    pub admin: bool,
}

impl AccessScope {
    pub fn owns(&self, created_by: Uuid) -> bool {
        self.admin || self.user_id == created_by
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_email_is_stable_and_case_insensitive() {
        let a = Actor::from_email("Ana@Office.example", Role::User);
        let b = Actor::from_email("  ana@office.example ", Role::User);
        assert_eq!(a.id, b.id);
        assert_eq!(a.email, "ana@office.example");
    }

    #[test]
    fn scope_owns_only_own_rows_unless_admin() {
        let user = Actor::from_email("user@office.example", Role::User);
        let admin = Actor::from_email("admin@office.example", Role::Admin);
        let other = Uuid::new_v4();

        assert!(user.scope().owns(user.id));
        assert!(!user.scope().owns(other));
        assert!(admin.scope().owns(other));
    }

    #[test]
    fn role_round_trips_through_db_value() {
        for role in [Role::Admin, Role::User] {
            assert_eq!(Role::from_db_value(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_db_value("owner"), None);
    }
}
