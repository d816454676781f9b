use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use bourracho_types::api::{Claims, PostMessageRequest, ReactRequest, VoteRequest};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .list_messages(&conversation_id, &claims.sub)
            .await?,
    ))
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .engine
        .post_message(&conversation_id, &claims.sub, req.content, req.media_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Toggles the caller's `emoji` on the message.
pub async fn react(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .react(&conversation_id, &message_id, &claims.sub, &req.emoji)
            .await?,
    ))
}

pub async fn vote(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .vote(&conversation_id, &message_id, &claims.sub, &req.votee_id)
            .await?,
    ))
}
