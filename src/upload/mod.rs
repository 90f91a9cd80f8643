//! Reliable segment delivery
//!
//! `SegmentUploader` pushes segments to the ingestion endpoint with bounded
//! retry; segments that cannot be delivered land in a durable on-disk cache
//! keyed by sequence number, drained later by `retry_failed_segments`.

pub mod cache;
pub mod endpoint;
pub mod uploader;

pub use cache::SegmentCache;
pub use endpoint::{
    error_from_response, HttpIngestionEndpoint, IngestError, IngestReceipt, IngestionEndpoint,
};
pub use uploader::{SegmentUploader, UploadOutcome, UploaderConfig};
