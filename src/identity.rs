use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use serde::{Deserialize, Serialize};
use std::env;
use std::future::{ready, Ready};

use crate::routes::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Support,
    User,
}

/// The resolved caller for one request. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub role: Role,
}

/// Resolves the caller of the current request. The stub implementation below
/// stands in for real credential verification; swapping providers must not
/// move where identity is consulted in the handlers.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self) -> User;
}

/// Fixed identity source for development and tests.
#[derive(Debug, Clone)]
pub struct StubIdentity {
    user: User,
}

impl StubIdentity {
    pub fn new(user: User) -> Self {
        Self { user }
    }

    /// Reads RSD_IDENTITY_USERNAME / RSD_IDENTITY_EMAIL / RSD_IDENTITY_ROLE,
    /// defaulting to a regular user.
    pub fn from_env() -> Self {
        let username =
            env::var("RSD_IDENTITY_USERNAME").unwrap_or_else(|_| "newbie_quantum".to_string());
        let email = env::var("RSD_IDENTITY_EMAIL")
            .unwrap_or_else(|_| format!("{username}@example.com"));
        let role = match env::var("RSD_IDENTITY_ROLE").as_deref() {
            Ok("support") => Role::Support,
            _ => Role::User,
        };
        Self {
            user: User {
                user_id: 1,
                username,
                email,
                role,
            },
        }
    }
}

impl IdentityProvider for StubIdentity {
    fn resolve(&self) -> User {
        self.user.clone()
    }
}

/// Extractor handing the resolved caller to a handler as an argument.
pub struct Identity(pub User);

impl FromRequest for Identity {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        match req.app_data::<web::Data<AppState>>() {
            Some(state) => ready(Ok(Identity(state.identity.resolve()))),
            None => ready(Err(actix_web::error::ErrorInternalServerError(
                "identity provider not configured",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_resolves_fixed_user() {
        let stub = StubIdentity::new(User {
            user_id: 7,
            username: "alice".into(),
            email: "alice@example.com".into(),
            role: Role::Support,
        });
        let u = stub.resolve();
        assert_eq!(u.username, "alice");
        assert_eq!(u.role, Role::Support);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Support).unwrap(), "\"support\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
