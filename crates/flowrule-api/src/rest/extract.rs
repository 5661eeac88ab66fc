//! Request extractors

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use flowrule_core::Principal;
use std::convert::Infallible;

/// Header naming the principal a request acts as.
pub const ACTOR_HEADER: &str = "x-actor";

/// Principal used when a request carries no actor header.
pub const ANONYMOUS: &str = "anonymous";

/// The calling principal, taken from [`ACTOR_HEADER`].
///
/// Authentication happens in front of this service; the header is trusted.
#[derive(Debug, Clone)]
pub struct Actor(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS);
        Ok(Actor(Principal::from(principal)))
    }
}
