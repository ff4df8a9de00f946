//! Identity of the local participant
//!
//! A call session must never start without a stable caller identifier, so
//! every entry point resolves one through an `IdentityProvider` first.

mod login;
pub mod tokens;

pub use login::{login, logout, status};
pub use tokens::{StoredToken, TokenStore};

use crate::calling::CallError;
use crate::config::Config;
use crate::models::UserId;

/// Source of the current user's identifier.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Result<UserId, CallError>;
}

/// Identity resolved from the persisted login in `config.toml`.
pub struct ConfigIdentity {
    user_id: Option<String>,
    token: Option<StoredToken>,
}

impl ConfigIdentity {
    pub fn new(config: &Config) -> Self {
        Self {
            user_id: config.user_id.clone(),
            token: config.get_access_token(),
        }
    }
}

impl IdentityProvider for ConfigIdentity {
    fn current_user_id(&self) -> Result<UserId, CallError> {
        let token = self.token.as_ref().ok_or(CallError::NotAuthenticated)?;
        if token.is_expired() {
            tracing::warn!("Access token expired. Run `peercall login` again.");
            return Err(CallError::NotAuthenticated);
        }
        match self.user_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(UserId::new(id)),
            _ => Err(CallError::NotAuthenticated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_login() {
        let config = Config::default();
        let identity = ConfigIdentity::new(&config);
        assert!(matches!(
            identity.current_user_id(),
            Err(CallError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_identity_rejects_expired_token() {
        let mut config = Config::default();
        config.user_id = Some("u-1".to_string());
        config.set_access_token("tok".to_string(), Some(10));
        let identity = ConfigIdentity::new(&config);
        assert!(identity.current_user_id().is_err());
    }

    #[test]
    fn test_identity_from_valid_login() {
        let mut config = Config::default();
        config.user_id = Some("u-1".to_string());
        config.set_access_token("tok".to_string(), None);
        let identity = ConfigIdentity::new(&config);
        assert_eq!(identity.current_user_id().unwrap(), UserId::new("u-1"));
    }
}
