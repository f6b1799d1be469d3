pub mod error;
pub mod file_lifecycle;
pub mod file_service;
pub mod metadata_repository;
pub mod share_service;
pub mod storage;
pub mod token;
pub mod usage_metrics;
