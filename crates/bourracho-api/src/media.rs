use axum::{
    Extension, Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::error;
use uuid::Uuid;

use bourracho_db::media::{MAX_MEDIA_SIZE, MediaStorage};
use bourracho_sync::SyncError;
use bourracho_types::api::Claims;
use bourracho_types::models::{MediaAttachment, MediaKind};

use crate::error::ApiResult;
use crate::state::AppState;

/// POST /chat/{id}/medias: raw bytes with an image, audio or video
/// Content-Type. Returns the attachment to reference from a message.
pub async fn upload_media(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    bytes: Bytes,
) -> ApiResult<impl IntoResponse> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let kind = MediaKind::from_content_type(content_type).ok_or_else(|| {
        SyncError::invalid(format!("unsupported media type '{}'", content_type))
    })?;
    if bytes.is_empty() {
        return Err(SyncError::invalid("empty media payload").into());
    }
    if bytes.len() > MAX_MEDIA_SIZE {
        return Err(SyncError::invalid("media exceeds 50 MiB").into());
    }

    state
        .engine
        .authorize_upload(&conversation_id, &claims.sub)
        .await?;

    let media_id = Uuid::new_v4().to_string();
    let blob = state
        .media
        .put(&conversation_id, &media_id, content_type, &bytes)
        .await
        .map_err(SyncError::Storage)?;

    // The conversation may have been locked since the upload was authorized.
    let recorded = state
        .engine
        .record_media(MediaAttachment {
            url: MediaStorage::url_for(&media_id),
            id: media_id,
            conversation_id,
            issuer_id: claims.sub,
            kind,
            key: blob.key.clone(),
            size: blob.size,
            sha256: blob.sha256,
            timestamp: Utc::now(),
        })
        .await;
    let media = match recorded {
        Ok(media) => media,
        Err(e) => {
            if let Err(cleanup) = state.media.remove(&blob.key).await {
                error!("Failed to remove orphaned blob {}: {}", blob.key, cleanup);
            }
            return Err(e.into());
        }
    };

    Ok((StatusCode::CREATED, Json(media)))
}

/// GET /media/{id}: streams the blob to members of its conversation.
pub async fn download_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let media = state.engine.get_media(&media_id, &claims.sub).await?;

    let file = state.media.open(&media.key).await.map_err(|e| {
        error!("Media {} missing from storage: {}", media.id, e);
        SyncError::not_found(format!("media {}", media.id))
    })?;

    let headers = [
        (header::CONTENT_TYPE, content_type_for(&media).to_string()),
        (header::CONTENT_LENGTH, media.size.to_string()),
        (header::CACHE_CONTROL, "private, max-age=31536000, immutable".to_string()),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))))
}

/// Best-effort MIME type from the stored key's extension.
fn content_type_for(media: &MediaAttachment) -> &'static str {
    let ext = media.key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "weba" => "audio/webm",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
