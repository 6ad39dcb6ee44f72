//! Identity collaborator and session keys

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who the notifications are for and how to authorize requests
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Stable user id; also the push channel room name
    pub user_id: String,
    /// Bearer token for pull and acknowledgement requests
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }

    /// `Authorization` header value
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Supplies the logged-in user, when there is one
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    fn auth_token(&self) -> Option<String>;

    /// Both halves, or nothing
    fn credentials(&self) -> Option<Credentials> {
        match (self.current_user_id(), self.auth_token()) {
            (Some(user_id), Some(token)) => Some(Credentials { user_id, token }),
            _ => None,
        }
    }
}

/// Fixed identity, e.g. from environment variables
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
    token: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            token: Some(token.into()),
        }
    }

    /// Nobody logged in
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Key for one authenticated session.
///
/// Every pull, acknowledgement and push reaction carries the session it was
/// issued under; results for any other session are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_redacted_in_debug() {
        let creds = Credentials::new("u1", "secret-token");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("u1"));
        assert!(!debug.contains("secret-token"));
        assert_eq!(creds.bearer(), "Bearer secret-token");
    }

    #[test]
    fn partial_identity_yields_nothing() {
        assert!(StaticIdentity::anonymous().credentials().is_none());
        let identity = StaticIdentity::new("u1", "t");
        assert_eq!(identity.credentials(), Some(Credentials::new("u1", "t")));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
