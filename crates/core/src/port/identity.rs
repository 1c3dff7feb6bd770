// Identity Context Port
// The caller's claims for one request or job execution

use crate::error::{AppError, Result};
use std::sync::RwLock;
use uuid::Uuid;

/// Claim type carrying the caller's id
pub const NAME_IDENTIFIER: &str = "nameidentifier";

/// Claim type carrying a role name
pub const ROLE: &str = "role";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub kind: String,
    pub value: String,
}

impl Claim {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

pub trait IdentityContext: Send + Sync {
    /// Fails with `InvalidOperation` when no valid id claim is present
    fn identity_id(&self) -> Result<Uuid>;

    /// Case-insensitive role check
    fn has_role(&self, role: &str) -> Result<bool>;

    /// Value of the first matching claim, or an empty string
    fn get_value(&self, claim: &str) -> Result<String>;

    fn has_value(&self, claim: &str) -> Result<bool>;
}

/// Claim bag filled by the authentication layer
#[derive(Debug, Default)]
pub struct ClaimsIdentity {
    claims: RwLock<Vec<Claim>>,
}

impl ClaimsIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: Uuid, roles: &[&str]) -> Self {
        let mut claims = vec![Claim::new(NAME_IDENTIFIER, user_id.to_string())];
        claims.extend(roles.iter().map(|r| Claim::new(ROLE, *r)));
        Self {
            claims: RwLock::new(claims),
        }
    }

    /// Replace all claims
    pub fn set_user(&self, claims: Vec<Claim>) -> Result<()> {
        let mut guard = self
            .claims
            .write()
            .map_err(|_| AppError::Internal("identity claims lock poisoned".to_string()))?;
        *guard = claims;
        Ok(())
    }

    fn with_claims<R>(&self, f: impl FnOnce(&[Claim]) -> R) -> Result<R> {
        let guard = self
            .claims
            .read()
            .map_err(|_| AppError::Internal("identity claims lock poisoned".to_string()))?;
        Ok(f(&guard))
    }
}

fn require_name(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} cannot be empty.", what)));
    }
    Ok(())
}

impl IdentityContext for ClaimsIdentity {
    fn identity_id(&self) -> Result<Uuid> {
        let raw = self.with_claims(|claims| {
            claims
                .iter()
                .find(|c| c.kind == NAME_IDENTIFIER)
                .map(|c| c.value.clone())
        })?;

        raw.and_then(|v| Uuid::parse_str(&v).ok())
            .filter(|id| !id.is_nil())
            .ok_or_else(|| {
                AppError::InvalidOperation(
                    "The identity ID is not set or is not a valid GUID.".to_string(),
                )
            })
    }

    fn has_role(&self, role: &str) -> Result<bool> {
        require_name(role, "Role")?;
        self.with_claims(|claims| {
            claims
                .iter()
                .any(|c| c.kind == ROLE && c.value.eq_ignore_ascii_case(role))
        })
    }

    fn get_value(&self, claim: &str) -> Result<String> {
        require_name(claim, "Claim name")?;
        self.with_claims(|claims| {
            claims
                .iter()
                .find(|c| c.kind == claim)
                .map(|c| c.value.clone())
                .unwrap_or_default()
        })
    }

    fn has_value(&self, claim: &str) -> Result<bool> {
        require_name(claim, "Claim name")?;
        self.with_claims(|claims| claims.iter().any(|c| c.kind == claim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_missing_or_invalid() {
        let identity = ClaimsIdentity::new();
        let err = identity.identity_id().unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));

        identity
            .set_user(vec![Claim::new(NAME_IDENTIFIER, "not-a-guid")])
            .unwrap();
        assert!(identity.identity_id().is_err());
    }

    #[test]
    fn test_set_user_replaces_claims() {
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let identity = ClaimsIdentity::for_user(first, &["Admin"]);
        assert_eq!(identity.identity_id().unwrap(), first);

        identity
            .set_user(vec![Claim::new(NAME_IDENTIFIER, second.to_string())])
            .unwrap();
        assert_eq!(identity.identity_id().unwrap(), second);
        assert!(!identity.has_role("admin").unwrap());
    }

    #[test]
    fn test_roles_are_case_insensitive() {
        let identity = ClaimsIdentity::for_user(Uuid::now_v7(), &["Admin"]);
        assert!(identity.has_role("ADMIN").unwrap());
        assert!(!identity.has_role("rider").unwrap());
        assert!(identity.has_role(" ").is_err());
    }

    #[test]
    fn test_get_value_defaults_to_empty() {
        let identity = ClaimsIdentity::new();
        identity
            .set_user(vec![Claim::new("email", "rider@example.com")])
            .unwrap();

        assert_eq!(identity.get_value("email").unwrap(), "rider@example.com");
        assert_eq!(identity.get_value("phone").unwrap(), "");
        assert!(identity.has_value("email").unwrap());
        assert!(!identity.has_value("phone").unwrap());
        assert!(identity.get_value("").is_err());
    }
}
