//! Core data models for the chunked upload service.
//!
//! These entities represent in-flight chunked uploads and the artifacts they
//! are reassembled into. They map cleanly to database tables via
//! `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod chunked_upload;
pub mod stored_upload;
