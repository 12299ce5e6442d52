pub mod auth;
pub mod metadata_store;
pub mod multipart;
pub mod persistence;
pub mod resumable;
pub mod session_store;
pub mod storage_service;
pub mod token_manager;
