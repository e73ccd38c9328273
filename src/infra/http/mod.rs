mod api;
mod middleware;
mod ws;

pub use ws::ConnectError;

pub use middleware::RequestContext;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::feed::FeedService;
use crate::application::posts::PostOrchestrator;
use crate::application::repos::UserStore;
use crate::realtime::pool::PoolHandle;

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub feeds: Arc<FeedService>,
    pub posts: Arc<PostOrchestrator>,
    /// Live connections are only accepted for logins found here.
    pub users: Arc<dyn UserStore>,
    pub connections: PoolHandle,
    /// Envelopes queued per live connection before new ones are dropped.
    pub outbound_buffer: usize,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/users/{id}/posts", post(api::create_post))
        .route("/api/users/{id}/feed", get(api::get_feed))
        .route("/ws/{login}", get(ws::connect))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
