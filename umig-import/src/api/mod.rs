//! HTTP API handlers for umig-import
//!
//! Every mutating or importing route needs the caller identity in the
//! `X-Umig-Actor` header; authentication happens upstream.

pub mod batches;
pub mod health;
pub mod imports;
pub mod sse;

pub use batches::batch_routes;
pub use health::health_routes;
pub use imports::import_routes;
pub use sse::event_stream;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

/// Header carrying the resolved caller identity
pub const ACTOR_HEADER: &str = "x-umig-actor";

/// Caller identity taken from `X-Umig-Actor`
#[derive(Debug, Clone)]
pub struct Actor(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or_else(|| ApiError::BadRequest("missing X-Umig-Actor header".into()))?;
        let actor = value
            .to_str()
            .map_err(|_| ApiError::BadRequest("X-Umig-Actor header is not valid text".into()))?
            .trim();
        if actor.is_empty() {
            return Err(ApiError::BadRequest("X-Umig-Actor header is empty".into()));
        }
        Ok(Actor(actor.to_string()))
    }
}
