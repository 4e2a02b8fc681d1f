use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Run-level failure to resolve the parcellation.
#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Unsupported atlas resolution: {0}")]
    UnsupportedResolution(String),

    #[error("Atlas file not available offline: {}", .0.display())]
    Unavailable(PathBuf),

    #[error("Failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Malformed atlas file {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a per-subject failure, used by the driver's policy.
///
/// Atlas retrieval happens once before any subject runs, so it is an `AtlasError` and never a
/// subject failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubjectErrorKind {
    FileNotFound,
    Geometry,
    Processing,
}

impl SubjectErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectErrorKind::FileNotFound => "file_not_found",
            SubjectErrorKind::Geometry => "geometry",
            SubjectErrorKind::Processing => "processing",
        }
    }
}

impl fmt::Display for SubjectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SubjectError {
    #[error("Volume file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Invalid volume geometry: {0}")]
    Geometry(String),

    #[error("Failed to read volume {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Processing failed: {0}")]
    Processing(String),
}

impl SubjectError {
    pub fn kind(&self) -> SubjectErrorKind {
        match self {
            SubjectError::FileNotFound(_) => SubjectErrorKind::FileNotFound,
            SubjectError::Geometry(_) => SubjectErrorKind::Geometry,
            SubjectError::Read { .. } | SubjectError::Processing(_) => {
                SubjectErrorKind::Processing
            }
        }
    }
}

pub type SubjectResult<T> = std::result::Result<T, SubjectError>;
