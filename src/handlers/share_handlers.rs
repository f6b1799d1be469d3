//! HTTP handlers for share objects. Tokens are never returned here.

use crate::{
    errors::AppError,
    models::share::{ListSharesQuery, ShareObject, ShareUpdate},
    services::file_service::FileService,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// GET `/api/shares?fileId=&kind=&page=&perPage=`
pub async fn list_shares(
    State(service): State<FileService>,
    Query(query): Query<ListSharesQuery>,
) -> Result<Json<Vec<ShareObject>>, AppError> {
    Ok(Json(service.list_share_objects(&query).await?))
}

/// GET `/api/shares/{id}`
pub async fn get_share(
    State(service): State<FileService>,
    Path(id): Path<String>,
) -> Result<Json<ShareObject>, AppError> {
    Ok(Json(service.get_share_object(&id).await?))
}

/// PATCH `/api/shares/{id}`: `{"name": .., "validUntil": ..|null}`
pub async fn update_share(
    State(service): State<FileService>,
    Path(id): Path<String>,
    Json(patch): Json<ShareUpdate>,
) -> Result<Json<ShareObject>, AppError> {
    Ok(Json(service.update_share_object(&id, &patch).await?))
}

/// DELETE `/api/shares/{id}`: never touches the shared file.
pub async fn delete_share(
    State(service): State<FileService>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete_share_object(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
