use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use bourracho_types::api::{Claims, UpdateMembershipRequest};

use crate::error::ApiResult;
use crate::state::AppState;

/// Members may only edit their own pseudo and smiley.
pub async fn update_membership(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateMembershipRequest>,
) -> ApiResult<impl IntoResponse> {
    let membership = state
        .engine
        .update_membership(
            &conversation_id,
            &claims.sub,
            &user_id,
            req.pseudo.as_deref(),
            req.smiley.as_deref(),
        )
        .await?;
    Ok(Json(membership))
}
