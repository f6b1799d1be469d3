//! File storage and sharing service.
//!
//! File records live in SQLite, content in pluggable storage backends routed
//! by file kind, and share tokens grant bearer access to single files.
//! [`services::file_service::FileService`] is the entry point.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
