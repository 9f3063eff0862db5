//! Identity of the caller.
//!
//! Shelfwise does not authenticate anyone. A trusted front proxy sets
//! `x-user-id` and `x-user-role`, and the recommendation handler only
//! reads the resolved [`UserIdentity`].

use axum::http::HeaderMap;

use shelfwise_core::models::{Role, UserIdentity};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub trait IdentityResolver: Send + Sync {
    /// `None` means the request is unauthenticated.
    fn resolve(&self, headers: &HeaderMap) -> Option<UserIdentity>;
}

/// Reads identity headers, with an optional anonymous fallback.
#[derive(Debug, Clone, Default)]
pub struct HeaderIdentity {
    anonymous_user: Option<String>,
}

impl HeaderIdentity {
    pub fn new(anonymous_user: Option<String>) -> Self {
        Self { anonymous_user }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserIdentity> {
        if let Some(id) = header_str(headers, USER_ID_HEADER) {
            return Some(UserIdentity {
                id: id.to_string(),
                role: Role::from_claim(header_str(headers, USER_ROLE_HEADER)),
            });
        }
        self.anonymous_user.as_ref().map(|id| UserIdentity {
            id: id.clone(),
            role: Role::Member,
        })
    }
}
