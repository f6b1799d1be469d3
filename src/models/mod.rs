//! Core data models for the file storage and sharing service.
//!
//! Files and shares map to database rows via private `sqlx::FromRow` row
//! types and serialize as JSON via `serde`. Metrics are never persisted.

pub mod file;
pub mod kind;
pub mod metrics;
pub mod share;
