pub mod artifact_store;
pub mod chunk_store;
pub mod chunked_upload;
pub mod reassembler;
pub mod upload_records;
