//! Pipeline error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for pipeline operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Reproject,
    Encode,
    Query,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Load => write!(f, "load"),
            Stage::Reproject => write!(f, "reproject"),
            Stage::Encode => write!(f, "encode"),
            Stage::Query => write!(f, "query"),
            Stage::Assemble => write!(f, "assemble"),
        }
    }
}

/// Errors that can end a fetch run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported boundary format '{format}' for {}", path.display())]
    UnsupportedFormat { path: PathBuf, format: String },

    #[error("failed to read boundary {}: {cause}", path.display())]
    Read { path: PathBuf, cause: String },

    #[error("invalid boundary geometry: {0}")]
    InvalidGeometry(String),

    #[error("reprojection failed: {0}")]
    Reprojection(String),

    #[error("failed to encode query geometry: {0}")]
    Encode(String),

    #[error(
        "unsupported spatial relationship '{0}' \
         (expected intersects, within, contains, touches, overlaps or crosses)"
    )]
    UnsupportedRelationship(String),

    #[error("request at offset {offset} (page {page}) failed after {attempts} attempts: {cause}")]
    TransientRequest {
        offset: u64,
        page: usize,
        attempts: u32,
        cause: String,
    },

    #[error("request at offset {offset} (page {page}) rejected: {cause}")]
    PermanentRequest {
        offset: u64,
        page: usize,
        cause: String,
    },

    #[error("query matched no features")]
    EmptyResult,

    #[error(
        "failed to write {}: {cause} ({unwritten} records retrieved but not written)",
        path.display()
    )]
    Serialization {
        path: PathBuf,
        unwritten: usize,
        cause: String,
    },

    #[error("run cancelled before offset {offset} ({retrieved} records retrieved)")]
    Cancelled { offset: u64, retrieved: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FetchError {
    /// Stage of the pipeline that produced this error
    pub fn stage(&self) -> Stage {
        match self {
            FetchError::UnsupportedFormat { .. }
            | FetchError::Read { .. }
            | FetchError::InvalidGeometry(_) => Stage::Load,
            FetchError::Reprojection(_) => Stage::Reproject,
            FetchError::Encode(_) | FetchError::UnsupportedRelationship(_) => Stage::Encode,
            FetchError::TransientRequest { .. }
            | FetchError::PermanentRequest { .. }
            | FetchError::Cancelled { .. }
            | FetchError::Config(_) => Stage::Query,
            FetchError::EmptyResult | FetchError::Serialization { .. } => Stage::Assemble,
        }
    }

    /// Offset of the page being requested when the error occurred, if any
    pub fn offset(&self) -> Option<u64> {
        match self {
            FetchError::TransientRequest { offset, .. }
            | FetchError::PermanentRequest { offset, .. }
            | FetchError::Cancelled { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping() {
        assert_eq!(FetchError::InvalidGeometry("x".into()).stage(), Stage::Load);
        assert_eq!(FetchError::Reprojection("x".into()).stage(), Stage::Reproject);
        assert_eq!(FetchError::Encode("x".into()).stage(), Stage::Encode);
        assert_eq!(
            FetchError::UnsupportedRelationship("near".into()).stage(),
            Stage::Encode
        );
        assert_eq!(FetchError::EmptyResult.stage(), Stage::Assemble);

        let err = FetchError::PermanentRequest {
            offset: 2000,
            page: 2,
            cause: "HTTP 400".into(),
        };
        assert_eq!(err.stage(), Stage::Query);
        assert_eq!(err.offset(), Some(2000));
        assert_eq!(FetchError::Encode("x".into()).offset(), None);
    }

    #[test]
    fn test_message_includes_offset_and_cause() {
        let err = FetchError::TransientRequest {
            offset: 1000,
            page: 1,
            attempts: 4,
            cause: "HTTP 503".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("offset 1000"));
        assert!(msg.contains("page 1"));
        assert!(msg.contains("HTTP 503"));
    }
}
