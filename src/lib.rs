//! Batch functional-connectivity extraction from resting-state fMRI volumes.
//!
//! Each subject's 4D volume is resampled onto a parcellation grid, reduced to per-region mean
//! time series, standardized, correlated, and Fisher z-transformed. All subjects land in a
//! single `(regions, regions, subjects)` float32 NPY array.

pub mod atlas;
pub mod cache;
pub mod connectivity;
pub mod driver;
pub mod error;
pub mod extractor;
pub mod geometry;
pub mod npy;
pub mod subject;
pub mod volume;

pub use atlas::{Atlas, AtlasProvider, SchaeferAtlas};
pub use driver::{run, FailurePolicy, PipelineConfig, RunSummary};
pub use error::{AtlasError, SubjectError, SubjectErrorKind};
pub use extractor::SignalExtractor;
pub use subject::{SubjectLayout, SubjectProcessor};
