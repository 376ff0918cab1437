use crate::{Command, CoreError};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

// --- User ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tenant,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tenant => "tenant",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant" => Ok(Role::Tenant),
            "admin" => Ok(Role::Admin),
            other => Err(UserError::InvalidRole(format!("Unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub role: Role,
    #[serde(default)]
    pub flat_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Commands ---

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUser {
    pub username: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub flat_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChangePassword {
    pub user_id: String,
    /// Required when users change their own password; absent for an admin reset.
    pub current_password: Option<String>,
    pub new_password: String,
}

impl Command for RegisterUser {}
impl Command for ChangePassword {}

// --- Errors ---

#[derive(thiserror::Error, Debug)]
pub enum UserError {
    #[error("Core Error: {0}")]
    Core(#[from] CoreError),
    #[error("User already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid role assignment: {0}")]
    InvalidRole(String),
    #[error("Invalid password")] // Keep generic for security
    InvalidPassword,
}

impl User {
    /// Validates the registration and builds the account. The caller hashes
    /// the password first (see [`hash_password`]).
    pub fn register(
        command: &RegisterUser,
        password_hash: String,
        now: DateTime<Utc>,
    ) -> Result<Self, UserError> {
        let username = command.username.trim();
        if username.is_empty() {
            return Err(UserError::InvalidInput("Username cannot be empty".into()));
        }
        if username.chars().any(char::is_whitespace) {
            return Err(UserError::InvalidInput(
                "Username cannot contain whitespace".into(),
            ));
        }
        validate_password(&command.password)?;
        if command.role == Role::Admin && command.flat_id.is_some() {
            return Err(UserError::InvalidRole(
                "Admins cannot be linked to a flat".into(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash,
            role: command.role,
            flat_id: command.flat_id.clone(),
            created_at: now,
        })
    }
}

pub fn validate_password(password: &str) -> Result<(), UserError> {
    if password.trim().is_empty() {
        return Err(UserError::InvalidInput("Password cannot be empty".into()));
    }
    Ok(())
}

/// Hashes with Argon2 defaults. CPU heavy: call from a blocking task.
pub fn hash_password(password: &str) -> Result<String, UserError> {
    validate_password(password)?;
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| UserError::Core(CoreError::Internal(format!("password hashing: {}", e))))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<(), UserError> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| UserError::Core(CoreError::Internal(format!("stored hash: {}", e))))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| UserError::InvalidPassword)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reading::tests::at;

    fn register(role: Role, flat_id: Option<&str>) -> RegisterUser {
        RegisterUser {
            username: "tenant101".to_string(),
            password: "secret".to_string(),
            role,
            flat_id: flat_id.map(str::to_string),
        }
    }

    #[test]
    fn test_register_tenant() {
        let user = User::register(
            &register(Role::Tenant, Some("flat-1")),
            "hash".into(),
            at(2024, 1, 1),
        )
        .unwrap();
        assert_eq!(user.username, "tenant101");
        assert_eq!(user.role, Role::Tenant);
        assert_eq!(user.flat_id.as_deref(), Some("flat-1"));
    }

    #[test]
    fn test_register_admin_with_flat_is_invalid() {
        let result = User::register(
            &register(Role::Admin, Some("flat-1")),
            "hash".into(),
            at(2024, 1, 1),
        );
        assert!(matches!(result, Err(UserError::InvalidRole(_))));
    }

    #[test]
    fn test_register_validation() {
        let mut cmd = register(Role::Tenant, None);
        cmd.username = "two words".into();
        assert!(matches!(
            User::register(&cmd, "hash".into(), at(2024, 1, 1)),
            Err(UserError::InvalidInput(_))
        ));

        let mut cmd = register(Role::Tenant, None);
        cmd.password = "   ".into();
        assert!(matches!(
            User::register(&cmd, "hash".into(), at(2024, 1, 1)),
            Err(UserError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_hash_and_verify_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash).is_ok());
        assert!(matches!(
            verify_password("wrong", &hash),
            Err(UserError::InvalidPassword)
        ));
        assert!(hash_password("").is_err());
    }

    #[test]
    fn test_role_round_trip_through_str() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::Tenant.as_str(), "tenant");
        assert!("PlatformAdmin".parse::<Role>().is_err());
    }
}
