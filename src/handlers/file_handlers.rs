//! HTTP handlers for file records and their content.
//! Content bodies are streamed in both directions; everything else is JSON.

use crate::{
    errors::AppError,
    models::{
        file::{CreateFileArgs, FileRecord, FindFilesQuery, ListFilesQuery, UpdateFileArgs},
        metrics::FilesMetrics,
        share::{CreateShareArgs, ShareWithToken},
    },
    services::{file_service::FileService, storage::ByteStream},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::io;

/// Header carrying the identity the upstream auth layer already verified.
pub const CALLER_HEADER: &str = "x-forwarded-user";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileBody {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

/// POST `/api/files/{kind}`: create a record awaiting upload.
pub async fn create_file(
    State(service): State<FileService>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateFileBody>,
) -> Result<impl IntoResponse, AppError> {
    let created_by = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let file: FileRecord = service
        .create(CreateFileArgs {
            id: body.id,
            kind,
            name: body.name,
            mime_type: body.mime_type,
            alt: body.alt,
            meta: body.meta,
            created_by,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

/// GET `/api/files/{kind}`: list one kind, newest first.
pub async fn list_files(
    State(service): State<FileService>,
    Path(kind): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    Ok(Json(service.list::<Value>(&kind, &query).await?))
}

/// POST `/api/find`: filtered search across kinds.
pub async fn find_files(
    State(service): State<FileService>,
    Json(query): Json<FindFilesQuery>,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    Ok(Json(service.find::<Value>(&query).await?))
}

/// GET `/api/files/{kind}/{id}`
pub async fn get_file(
    State(service): State<FileService>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.get_by_id::<Value>(&id, &kind).await?))
}

/// PATCH `/api/files/{kind}/{id}`: update name and/or meta.
pub async fn update_file(
    State(service): State<FileService>,
    Path((kind, id)): Path<(String, String)>,
    Json(body): Json<UpdateFileBody>,
) -> Result<Json<FileRecord>, AppError> {
    let file = service
        .update(UpdateFileArgs {
            id,
            kind,
            name: body.name,
            meta: body.meta,
        })
        .await?;
    Ok(Json(file))
}

/// DELETE `/api/files/{kind}/{id}`: cascades to shares and content.
pub async fn delete_file(
    State(service): State<FileService>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    service.delete(&id, &kind).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/api/files/{kind}/{id}/blob`: stream the content in.
pub async fn upload_content(
    State(service): State<FileService>,
    Path((kind, id)): Path<(String, String)>,
    body: Body,
) -> Result<Json<FileRecord>, AppError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::other(err)));

    let file = service.upload_content(&id, &kind, stream).await?;
    Ok(Json(file))
}

/// GET `/api/files/{kind}/{id}/blob`: stream the content out.
pub async fn download_content(
    State(service): State<FileService>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (file, content) = service.download(&id, &kind).await?;
    Ok(content_response(&file, content))
}

/// POST `/api/files/{kind}/{id}/shares`: the token is only returned here.
pub async fn create_share(
    State(service): State<FileService>,
    Path((kind, id)): Path<(String, String)>,
    body: Option<Json<CreateShareBody>>,
) -> Result<(StatusCode, Json<ShareWithToken>), AppError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let share = service
        .create_share_object(CreateShareArgs {
            file_id: id,
            kind,
            name: body.name,
            valid_until: body.valid_until,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(share)))
}

/// GET `/api/public/file?token=`: record behind a share token.
pub async fn get_shared_file(
    State(service): State<FileService>,
    Query(q): Query<TokenQuery>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.get_by_token::<Value>(&q.token).await?))
}

/// GET `/api/public/blob?token=`: content behind a share token.
pub async fn download_shared_content(
    State(service): State<FileService>,
    Query(q): Query<TokenQuery>,
) -> Result<Response, AppError> {
    let (file, content) = service.download_by_token(&q.token).await?;
    Ok(content_response(&file, content))
}

/// GET `/api/metrics`
pub async fn usage_metrics(
    State(service): State<FileService>,
) -> Result<Json<FilesMetrics>, AppError> {
    Ok(Json(service.get_usage_metrics().await?))
}

fn content_response(file: &FileRecord, content: ByteStream) -> Response {
    let mut response = Response::new(Body::from_stream(content));
    *response.status_mut() = StatusCode::OK;
    set_content_headers(response.headers_mut(), file);
    response
}

fn set_content_headers(headers: &mut HeaderMap, file: &FileRecord) {
    let content_type = file
        .mime_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    if let Some(size) = file.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    if let Some(hash) = file.hash.as_ref() {
        let quoted = format!("\"{}\"", hash);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    let filename: String = file
        .name
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Ok(value) = HeaderValue::from_str(&file.updated_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
