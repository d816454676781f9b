use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use bourracho_types::api::{
    Claims, CreateConversationRequest, JoinResponse, UpdateConversationRequest,
};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let conversation = state.engine.create_conversation(&claims.sub, req).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_conversations(&claims.sub).await?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(_claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_conversation(&conversation_id).await?))
}

/// PATCH applies rename, lock and visibility as separate commands, in that
/// order, each emitting its own event. Absent fields are skipped.
pub async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let engine = &state.engine;
    let mut conversation = None;
    if let Some(name) = req.name.as_deref() {
        conversation = Some(engine.rename(&conversation_id, &claims.sub, name).await?);
    }
    if let Some(locked) = req.is_locked {
        conversation = Some(engine.set_lock(&conversation_id, &claims.sub, locked).await?);
    }
    if let Some(visible) = req.is_visible {
        conversation = Some(
            engine
                .set_visibility(&conversation_id, &claims.sub, visible)
                .await?,
        );
    }
    let conversation = match conversation {
        Some(c) => c,
        None => engine.get_conversation(&conversation_id).await?,
    };
    Ok(Json(conversation))
}

pub async fn join(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let joined = state.engine.join(&conversation_id, &claims.sub).await?;
    let status = if joined.newly_joined {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(JoinResponse {
            conversation: joined.conversation,
            membership: joined.membership,
            newly_joined: joined.newly_joined,
        }),
    ))
}

pub async fn leave(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.leave(&conversation_id, &claims.sub).await?))
}

/// Point-in-time fetch clients merge with the live stream.
pub async fn snapshot(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.snapshot(&conversation_id, &claims.sub).await?))
}
