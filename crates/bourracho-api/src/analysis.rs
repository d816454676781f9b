use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use bourracho_types::api::Claims;

use crate::error::ApiResult;
use crate::state::AppState;

/// `null` until the conversation has been locked once, then the latest
/// `pending` / `ready` / `failed` state.
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .get_analysis(&conversation_id, &claims.sub)
            .await?,
    ))
}
