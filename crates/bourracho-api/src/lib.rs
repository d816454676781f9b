pub mod analysis;
pub mod conversations;
pub mod error;
pub mod media;
pub mod members;
pub mod messages;
pub mod middleware;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, patch, post, put},
};

use bourracho_db::media::MAX_MEDIA_SIZE;

pub use error::ApiError;
pub use state::{AppState, AppStateInner};

/// Every REST route. All of them require a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/chat",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route(
            "/chat/{conversation_id}",
            get(conversations::get_conversation).patch(conversations::update_conversation),
        )
        .route("/chat/{conversation_id}/join", post(conversations::join))
        .route("/chat/{conversation_id}/leave", axum::routing::delete(conversations::leave))
        .route("/chat/{conversation_id}/snapshot", get(conversations::snapshot))
        .route(
            "/chat/{conversation_id}/messages",
            get(messages::list_messages).post(messages::post_message),
        )
        .route(
            "/chat/{conversation_id}/messages/{message_id}/reacts",
            post(messages::react),
        )
        .route(
            "/chat/{conversation_id}/messages/{message_id}/vote",
            put(messages::vote),
        )
        .route(
            "/chat/{conversation_id}/members/{user_id}",
            patch(members::update_membership),
        )
        .route("/chat/{conversation_id}/analysis", get(analysis::get_analysis))
        .route(
            "/chat/{conversation_id}/medias",
            post(media::upload_media).layer(DefaultBodyLimit::max(MAX_MEDIA_SIZE)),
        )
        .route("/media/{media_id}", get(media::download_media))
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
