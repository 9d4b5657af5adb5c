//! Authentication for natrelay
//!
//! Clients present either the anonymous sentinel or an HS256 JWT whose
//! subject names a record in an external credential store. The record's
//! `userId` becomes the client identity.

pub mod jwt;
pub mod store;
pub mod validator;

pub use jwt::{JwtError, JwtValidator, TokenClaims, TokenIssuer};
pub use store::{CredentialStore, JsonFileCredentialStore, MemoryCredentialStore, UserRecord};
pub use validator::{AuthError, Principal, TokenValidator};

// Re-export useful types
pub use async_trait::async_trait;
