//! Defines routes for all file, share and maintenance operations.
//!
//! ## Structure
//! - **File endpoints**
//!   - `POST   /api/files/{kind}`: create a file record
//!   - `GET    /api/files/{kind}`: list files of a kind
//!   - `GET    /api/files/{kind}/{id}`: fetch a record
//!   - `PATCH  /api/files/{kind}/{id}`: update name / meta
//!   - `DELETE /api/files/{kind}/{id}`: delete record, shares and content
//!   - `PUT    /api/files/{kind}/{id}/blob`: upload content
//!   - `GET    /api/files/{kind}/{id}/blob`: download content
//!   - `POST   /api/files/{kind}/{id}/shares`: share a file
//!   - `POST   /api/find`: search across kinds
//!
//! - **Share endpoints**
//!   - `GET    /api/shares`, `GET|PATCH|DELETE /api/shares/{id}`
//!
//! - **Token access** (no caller identity required)
//!   - `GET    /api/public/file?token=`, `GET /api/public/blob?token=`
//!
//! - `GET /api/metrics`, `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        file_handlers::{
            create_file, create_share, delete_file, download_content, download_shared_content,
            find_files, get_file, get_shared_file, list_files, update_file, upload_content,
            usage_metrics,
        },
        health_handlers::{healthz, readyz},
        share_handlers::{delete_share, get_share, list_shares, update_share},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for every endpoint.
///
/// The router carries shared state (`FileService`) to all handlers.
pub fn routes() -> Router<FileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // File routes
        .route("/api/files/{kind}", get(list_files).post(create_file))
        .route(
            "/api/files/{kind}/{id}",
            get(get_file).patch(update_file).delete(delete_file),
        )
        .route(
            "/api/files/{kind}/{id}/blob",
            get(download_content).put(upload_content),
        )
        .route("/api/files/{kind}/{id}/shares", post(create_share))
        .route("/api/find", post(find_files))
        // Share routes
        .route("/api/shares", get(list_shares))
        .route(
            "/api/shares/{id}",
            get(get_share).patch(update_share).delete(delete_share),
        )
        // Token access
        .route("/api/public/file", get(get_shared_file))
        .route("/api/public/blob", get(download_shared_content))
        .route("/api/metrics", get(usage_metrics))
}
