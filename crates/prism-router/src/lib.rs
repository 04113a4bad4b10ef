mod auth;
mod models;
mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use prism_catalog::CatalogHandle;
use prism_core::Dispatcher;

pub use auth::hash_client_key;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: CatalogHandle,
}

/// Client-facing routes, one per supported dialect entry point.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(proxy::claude_messages))
        .route("/v1/chat/completions", post(proxy::openai_chat))
        .route("/v1/responses", post(proxy::openai_responses))
        .route("/v1beta/models/{model_action}", post(proxy::gemini_generate))
        .route("/v1/models", get(models::list_models))
        .route("/v1beta/models", get(models::gemini_list_models))
        .with_state(state)
}
