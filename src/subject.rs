//! Per-subject processing: locate, resample, extract, correlate.

use std::path::{Path, PathBuf};

use log::debug;
use ndarray::Array2;

use crate::atlas::Atlas;
use crate::connectivity::connectivity_matrix;
use crate::error::{SubjectError, SubjectResult};
use crate::extractor::SignalExtractor;
use crate::geometry::{resample_to_grid, Interpolation};
use crate::volume::{self, VolumeError};

pub const DEFAULT_VOLUME_SUFFIX: &str = ".gz";

/// Naming convention for a subject's volume: `<dir>/<dir basename><suffix>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectLayout {
    suffix: String,
}

impl Default for SubjectLayout {
    fn default() -> Self {
        SubjectLayout {
            suffix: DEFAULT_VOLUME_SUFFIX.to_string(),
        }
    }
}

impl SubjectLayout {
    pub fn with_suffix<S: Into<String>>(suffix: S) -> Self {
        SubjectLayout {
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn volume_path(&self, subject_dir: &Path) -> SubjectResult<PathBuf> {
        let base = subject_dir.file_name().ok_or_else(|| {
            SubjectError::Processing(format!(
                "subject path {} has no directory name",
                subject_dir.display()
            ))
        })?;
        let mut name = base.to_os_string();
        name.push(&self.suffix);
        Ok(subject_dir.join(name))
    }
}

pub struct SubjectProcessor<'a> {
    atlas: &'a Atlas,
    extractor: &'a SignalExtractor,
    layout: SubjectLayout,
    interpolation: Interpolation,
}

impl<'a> SubjectProcessor<'a> {
    pub fn new(atlas: &'a Atlas, extractor: &'a SignalExtractor) -> Self {
        SubjectProcessor {
            atlas,
            extractor,
            layout: SubjectLayout::default(),
            interpolation: Interpolation::default(),
        }
    }

    pub fn layout(mut self, layout: SubjectLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Returns the Fisher-z connectivity matrix (regions × regions) for one subject.
    pub fn process(&self, subject_dir: &Path) -> SubjectResult<Array2<f64>> {
        let path = self.layout.volume_path(subject_dir)?;
        if !path.is_file() {
            return Err(SubjectError::FileNotFound(path));
        }

        let source = volume::load_signal(&path).map_err(|e| match e {
            VolumeError::Geometry(m) => SubjectError::Geometry(m),
            VolumeError::Read(reason) => SubjectError::Read {
                path: path.clone(),
                reason,
            },
        })?;
        debug!(
            "Loaded {} with grid {:?} and {} timepoints",
            path.display(),
            source.spatial_shape(),
            source.timepoints()
        );
        if source.timepoints() < 2 {
            return Err(SubjectError::Processing(format!(
                "{} has {} timepoint(s); at least 2 are needed to correlate",
                path.display(),
                source.timepoints()
            )));
        }

        let resampled = resample_to_grid(&source, &self.atlas.grid(), self.interpolation)
            .map_err(|e| match e {
                VolumeError::Geometry(m) | VolumeError::Read(m) => SubjectError::Geometry(m),
            })?;
        drop(source);

        let series = self.extractor.extract(&resampled)?;
        if let Some((t, r)) = first_non_finite(&series) {
            return Err(SubjectError::Processing(format!(
                "region {} has a non-finite mean signal at timepoint {}",
                r + 1,
                t
            )));
        }
        Ok(connectivity_matrix(series))
    }
}

fn first_non_finite(series: &Array2<f64>) -> Option<(usize, usize)> {
    series
        .indexed_iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(idx, _)| idx)
}
