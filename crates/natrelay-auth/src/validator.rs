//! Token to identity resolution

use std::collections::HashSet;
use std::sync::Arc;

use natrelay_proto::{AuthState, ClientId, NO_TOKEN};
use thiserror::Error;
use tracing::{debug, warn};

use crate::jwt::{JwtError, JwtValidator};
use crate::store::{CredentialStore, UserRecord};

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Anonymous access is disabled")]
    AnonymousDisabled,

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("User is banned: {0}")]
    Banned(String),

    #[error("Invalid user record: {0}")]
    InvalidRecord(String),

    #[error("Credential store error: {0}")]
    Store(String),
}

impl AuthError {
    /// Handshake byte reported for this failure
    pub fn auth_state(&self) -> AuthState {
        match self {
            AuthError::InvalidRecord(_) | AuthError::Store(_) => AuthState::Error,
            _ => AuthState::Fail,
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::EncodingError(e) => AuthError::InvalidToken(e.to_string()),
        }
    }
}

/// Who a connection authenticated as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    /// The anonymous sentinel token
    Anonymous,
    /// A credential-store user, identified by its `userId`
    User(ClientId),
}

impl Principal {
    /// Client identity for a control exchange. Anonymous callers keep their
    /// `hint` (0 asks the registry to generate one).
    pub fn client_id(self, hint: ClientId) -> ClientId {
        match self {
            Principal::Anonymous => hint,
            Principal::User(id) => id,
        }
    }

    pub fn is_anonymous(self) -> bool {
        matches!(self, Principal::Anonymous)
    }
}

/// Resolves tokens to principals
pub struct TokenValidator {
    jwt: Option<JwtValidator>,
    store: Arc<dyn CredentialStore>,
    banned_users: HashSet<String>,
    allow_anonymous: bool,
}

impl TokenValidator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            jwt: None,
            store,
            banned_users: HashSet::new(),
            allow_anonymous: true,
        }
    }

    pub fn with_jwt(mut self, jwt: JwtValidator) -> Self {
        self.jwt = Some(jwt);
        self
    }

    pub fn with_banned_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.banned_users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Authenticate `token`.
    ///
    /// The anonymous sentinel yields [`Principal::Anonymous`]. Any other token
    /// must name a known, non-banned user whose `userId` becomes the identity.
    pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        if token == NO_TOKEN {
            if !self.allow_anonymous {
                debug!("Rejecting anonymous login");
                return Err(AuthError::AnonymousDisabled);
            }
            return Ok(Principal::Anonymous);
        }

        let jwt = self.jwt.as_ref().ok_or_else(|| {
            AuthError::InvalidToken("token authentication is not configured".to_string())
        })?;
        let claims = jwt.validate(token)?;

        let value = self
            .store
            .get(&claims.sub)
            .await?
            .ok_or_else(|| AuthError::UnknownUser(claims.sub.clone()))?;
        let user = UserRecord::from_json(value)?;

        if user.banned || self.banned_users.contains(&user.user_id) {
            warn!(user = %claims.sub, user_id = %user.user_id, "Banned user rejected");
            return Err(AuthError::Banned(user.user_id));
        }

        match user.user_id.parse::<u16>() {
            Ok(0) | Err(_) => Err(AuthError::InvalidRecord(format!(
                "userId {:?} is not a 16-bit identity",
                user.user_id
            ))),
            Ok(id) => Ok(Principal::User(ClientId(id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCredentialStore, MockCredentialStore};
    use crate::TokenIssuer;

    const SECRET: &[u8] = b"validator_test_secret";

    fn store_with(users: &[(&str, &str, bool)]) -> Arc<dyn CredentialStore> {
        let store = MemoryCredentialStore::new();
        for (key, id, banned) in users {
            store.insert_user(
                *key,
                &UserRecord {
                    user_id: id.to_string(),
                    banned: *banned,
                },
            );
        }
        Arc::new(store)
    }

    fn token_for(user: &str) -> String {
        TokenIssuer::new(SECRET).issue(user).unwrap()
    }

    /// Handshake byte a reverse connection would receive
    async fn state_for(validator: &TokenValidator, token: &str) -> AuthState {
        match validator.authenticate(token).await {
            Ok(_) => AuthState::Success,
            Err(e) => e.auth_state(),
        }
    }

    #[tokio::test]
    async fn test_anonymous_keeps_hint() {
        let validator = TokenValidator::new(store_with(&[]));
        let principal = validator.authenticate(NO_TOKEN).await.unwrap();
        assert_eq!(principal, Principal::Anonymous);
        assert_eq!(principal.client_id(ClientId(9)), ClientId(9));
        assert!(principal.client_id(ClientId::UNASSIGNED).is_unassigned());
    }

    #[tokio::test]
    async fn test_anonymous_disabled() {
        let validator = TokenValidator::new(store_with(&[])).with_allow_anonymous(false);
        let err = validator.authenticate(NO_TOKEN).await.unwrap_err();
        assert!(matches!(err, AuthError::AnonymousDisabled));
        assert_eq!(state_for(&validator, NO_TOKEN).await, AuthState::Fail);
    }

    #[tokio::test]
    async fn test_token_resolves_user_id() {
        let validator = TokenValidator::new(store_with(&[("alice", "1234", false)]))
            .with_jwt(JwtValidator::new(SECRET));
        let principal = validator.authenticate(&token_for("alice")).await.unwrap();
        assert_eq!(principal, Principal::User(ClientId(1234)));
        // a user's identity ignores the caller's hint
        assert_eq!(principal.client_id(ClientId(9)), ClientId(1234));
        assert!(!principal.is_anonymous());
    }

    #[tokio::test]
    async fn test_banned_flag_rejects() {
        let validator = TokenValidator::new(store_with(&[("mallory", "66", true)]))
            .with_jwt(JwtValidator::new(SECRET));
        let err = validator
            .authenticate(&token_for("mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Banned(_)));
    }

    #[tokio::test]
    async fn test_ban_list_rejects() {
        let validator = TokenValidator::new(store_with(&[("eve", "77", false)]))
            .with_jwt(JwtValidator::new(SECRET))
            .with_banned_users(["77"]);
        let err = validator.authenticate(&token_for("eve")).await.unwrap_err();
        assert!(matches!(err, AuthError::Banned(ref id) if id == "77"));
    }

    #[tokio::test]
    async fn test_unknown_user_and_bad_token() {
        let validator =
            TokenValidator::new(store_with(&[])).with_jwt(JwtValidator::new(SECRET));
        assert!(matches!(
            validator.authenticate(&token_for("ghost")).await,
            Err(AuthError::UnknownUser(_))
        ));
        assert!(matches!(
            validator.authenticate("garbage").await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_token_without_jwt_configured() {
        let validator = TokenValidator::new(store_with(&[("alice", "5", false)]));
        assert_eq!(
            state_for(&validator, &token_for("alice")).await,
            AuthState::Fail
        );
    }

    #[tokio::test]
    async fn test_non_numeric_user_id() {
        let validator = TokenValidator::new(store_with(&[("zed", "abc", false)]))
            .with_jwt(JwtValidator::new(SECRET));
        assert_eq!(
            state_for(&validator, &token_for("zed")).await,
            AuthState::Error
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_error_state() {
        let mut store = MockCredentialStore::new();
        store
            .expect_get()
            .returning(|_| Err(AuthError::Store("backend down".to_string())));

        let validator = TokenValidator::new(Arc::new(store)).with_jwt(JwtValidator::new(SECRET));
        assert_eq!(
            state_for(&validator, &token_for("alice")).await,
            AuthState::Error
        );
    }

    #[tokio::test]
    async fn test_store_is_queried_with_subject() {
        let mut store = MockCredentialStore::new();
        store
            .expect_get()
            .withf(|key| key == "frank")
            .times(1)
            .returning(|_| Ok(Some(serde_json::json!({ "userId": "300" }))));

        let validator = TokenValidator::new(Arc::new(store)).with_jwt(JwtValidator::new(SECRET));
        let principal = validator.authenticate(&token_for("frank")).await.unwrap();
        assert_eq!(principal, Principal::User(ClientId(300)));
    }
}
