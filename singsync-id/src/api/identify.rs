//! Upload, aggregate identification and text search endpoints

use super::RunQuery;
use crate::delivery::AggregateResult;
use crate::error::{ApiError, ApiResult};
use crate::types::SampleHandle;
use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use singsync_common::RankedMatch;
use tracing::{info, warn};
use uuid::Uuid;

/// Largest accepted upload
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

const DEFAULT_EXTENSION: &str = "m4a";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct IdentifyAllResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub result: AggregateResult,
}

#[derive(Debug, Deserialize)]
pub struct TextQuery {
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct TextSearchResponse {
    pub ok: bool,
    pub query: String,
    pub matches: Vec<RankedMatch>,
}

/// POST /upload_audio
///
/// Multipart field `audio` (or `file`). Stores the bytes under the upload directory and
/// returns a token for the identify endpoints.
pub async fn upload_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != "audio" && name != "file" {
            continue;
        }
        // `audio` wins over `file`
        if name == "file" && upload.is_some() {
            continue;
        }

        let extension = field
            .file_name()
            .and_then(|f| std::path::Path::new(f).extension())
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {}", e)))?;
        upload = Some((extension, bytes.to_vec()));

        if name == "audio" {
            break;
        }
    }

    let (extension, bytes) = upload
        .ok_or_else(|| ApiError::Unprocessable("multipart field 'audio' or 'file' is required".into()))?;
    if bytes.is_empty() {
        return Err(ApiError::Unprocessable("uploaded file is empty".into()));
    }

    let upload_dir = &state.config.upload_dir;
    tokio::fs::create_dir_all(upload_dir).await?;
    let path = upload_dir.join(format!("{}.{}", Uuid::new_v4().simple(), extension));
    tokio::fs::write(&path, &bytes).await?;

    let token = state.service.submit(SampleHandle::temporary_file(&path)).await;
    info!(token = %token, bytes = bytes.len(), path = %path.display(), "Sample uploaded");

    Ok(Json(UploadResponse { ok: true, token }))
}

/// GET /identify_all?token=&engines=&timeout=
///
/// Runs every selected engine to completion and returns all cards plus the merged ranking.
pub async fn identify_all(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<IdentifyAllResponse>> {
    let engines = query.engine_list();
    let timeout = query.global_timeout()?;

    let result = state
        .service
        .start_aggregate(&query.token, engines.as_deref(), timeout)
        .await?;

    Ok(Json(IdentifyAllResponse { ok: true, result }))
}

/// GET /identify_text?query=
pub async fn identify_text(
    State(state): State<AppState>,
    Query(params): Query<TextQuery>,
) -> ApiResult<Json<TextSearchResponse>> {
    let matches = state.service.text_search(&params.query).await.map_err(|e| {
        warn!(error = %e, "Text search rejected");
        ApiError::from(e)
    })?;

    Ok(Json(TextSearchResponse {
        ok: true,
        query: params.query.trim().to_string(),
        matches,
    }))
}

/// Build identification routes
pub fn identify_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/upload_audio",
            post(upload_audio).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/identify_all", get(identify_all))
        .route("/identify_stream", get(super::identify_stream))
        .route("/identify_text", get(identify_text))
}
