//! Per-region mean time-series extraction over a parcellation.

use log::{debug, warn};
use ndarray::{Array2, Array4, Axis};

use crate::atlas::Atlas;
use crate::cache::{CacheKeyBuilder, ExtractionCache, NoCache};
use crate::connectivity::standardize_columns;
use crate::error::{SubjectError, SubjectResult};

/// Bumped whenever the extraction output for identical inputs would change.
const FORMAT_VERSION: &str = "region-mean-v1";

pub struct ExtractorBuilder<'a> {
    atlas: &'a Atlas,
    standardize: bool,
    cache: Box<dyn ExtractionCache>,
}

impl<'a> ExtractorBuilder<'a> {
    pub fn standardize(mut self, standardize: bool) -> Self {
        self.standardize = standardize;
        self
    }

    pub fn cache<C: ExtractionCache + 'static>(mut self, cache: C) -> Self {
        self.cache = Box::new(cache);
        self
    }

    pub fn build(self) -> SignalExtractor {
        let grid_shape = self.atlas.grid().shape;
        let mut regions: Vec<Vec<[usize; 3]>> = vec![Vec::new(); self.atlas.n_rois()];
        for ((x, y, z), &label) in self.atlas.labels().labels.indexed_iter() {
            if label > 0 {
                regions[label as usize - 1].push([x, y, z]);
            }
        }
        for (idx, voxels) in regions.iter().enumerate() {
            if voxels.is_empty() {
                warn!(
                    "Region {} ({}) has no voxels in the atlas image; its series will be zero.",
                    idx + 1,
                    self.atlas.names()[idx]
                );
            }
        }
        debug!(
            "Built extractor over {} regions on grid {:?} (standardize={})",
            regions.len(),
            grid_shape,
            self.standardize
        );
        SignalExtractor {
            regions,
            grid_shape,
            atlas_fingerprint: self.atlas.fingerprint().to_string(),
            standardize: self.standardize,
            cache: self.cache,
        }
    }
}

/// Maps a 4D volume on the atlas grid to a (timepoints × regions) matrix of mean signal.
///
/// Holds only atlas-derived state and can be reused for any number of subjects.
pub struct SignalExtractor {
    regions: Vec<Vec<[usize; 3]>>,
    grid_shape: [usize; 3],
    atlas_fingerprint: String,
    standardize: bool,
    cache: Box<dyn ExtractionCache>,
}

impl SignalExtractor {
    pub fn builder(atlas: &Atlas) -> ExtractorBuilder<'_> {
        ExtractorBuilder {
            atlas,
            standardize: true,
            cache: Box::new(NoCache),
        }
    }

    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn standardizes(&self) -> bool {
        self.standardize
    }

    pub fn extract(&self, data: &Array4<f32>) -> SubjectResult<Array2<f64>> {
        let shape = data.shape();
        if shape[..3] != self.grid_shape[..] {
            return Err(SubjectError::Processing(format!(
                "volume grid {:?} does not match the atlas grid {:?}",
                &shape[..3],
                self.grid_shape
            )));
        }

        let key = CacheKeyBuilder::new(FORMAT_VERSION)
            .field_str("atlas", &self.atlas_fingerprint)
            .field_bool("standardize", self.standardize)
            .field_shape("shape", shape)
            .field_f32s("data", data.iter())
            .finish();
        match self.cache.load(&key) {
            Ok(Some(series)) if series.dim() == (shape[3], self.regions.len()) => {
                return Ok(series);
            }
            Ok(Some(series)) => warn!(
                "Ignoring cache entry {} with unexpected shape {:?}",
                key,
                series.dim()
            ),
            Ok(None) => {}
            Err(e) => warn!("Cache lookup failed for {}: {:#}", key, e),
        }

        let series = self.compute(data);
        if let Err(e) = self.cache.store(&key, &series) {
            warn!("Failed to store cache entry {}: {:#}", key, e);
        }
        Ok(series)
    }

    fn compute(&self, data: &Array4<f32>) -> Array2<f64> {
        let timepoints = data.len_of(Axis(3));
        let mut series = Array2::<f64>::zeros((timepoints, self.regions.len()));
        for (r, voxels) in self.regions.iter().enumerate() {
            if voxels.is_empty() {
                continue;
            }
            let mut column = series.column_mut(r);
            for &[x, y, z] in voxels {
                let lane = data.slice(ndarray::s![x, y, z, ..]);
                column.zip_mut_with(&lane, |acc, &v| *acc += f64::from(v));
            }
            let count = voxels.len() as f64;
            column.mapv_inplace(|v| v / count);
        }
        if self.standardize {
            standardize_columns(&mut series);
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, ExtractionCache};
    use crate::volume::{Affine, LabelVolume};
    use anyhow::Result;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array3};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct MemoryCache {
        entries: Rc<RefCell<HashMap<CacheKey, Array2<f64>>>>,
        hits: Rc<RefCell<usize>>,
    }

    impl ExtractionCache for MemoryCache {
        fn load(&self, key: &CacheKey) -> Result<Option<Array2<f64>>> {
            let found = self.entries.borrow().get(key).cloned();
            if found.is_some() {
                *self.hits.borrow_mut() += 1;
            }
            Ok(found)
        }

        fn store(&self, key: &CacheKey, value: &Array2<f64>) -> Result<()> {
            self.entries.borrow_mut().insert(key.clone(), value.clone());
            Ok(())
        }
    }

    /// Labels along x: [1, 1, 2, 0].
    fn strip_atlas() -> Atlas {
        let mut labels = Array3::<u32>::zeros((4, 1, 1));
        labels[[0, 0, 0]] = 1;
        labels[[1, 0, 0]] = 1;
        labels[[2, 0, 0]] = 2;
        Atlas::new(
            LabelVolume {
                labels,
                affine: Affine::identity(),
            },
            vec!["left".into(), "right".into()],
        )
        .unwrap()
    }

    fn strip_volume() -> Array4<f32> {
        Array::from_shape_fn((4, 1, 1, 3), |(x, _, _, t)| (x * 10 + t) as f32)
    }

    #[test]
    fn averages_voxels_per_region() {
        let atlas = strip_atlas();
        let extractor = SignalExtractor::builder(&atlas).standardize(false).build();
        assert_eq!(extractor.n_regions(), 2);
        assert!(!extractor.standardizes());
        let series = extractor.extract(&strip_volume()).unwrap();
        assert_eq!(series.dim(), (3, 2));
        for t in 0..3 {
            assert_abs_diff_eq!(series[[t, 0]], 5.0 + t as f64, epsilon = 1e-12);
            assert_abs_diff_eq!(series[[t, 1]], 20.0 + t as f64, epsilon = 1e-12);
        }
    }

    #[test]
    fn standardized_extraction_is_zero_mean() {
        let atlas = strip_atlas();
        let extractor = SignalExtractor::builder(&atlas).build();
        let series = extractor.extract(&strip_volume()).unwrap();
        for column in series.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn empty_region_yields_zero_column() {
        let mut labels = Array3::<u32>::zeros((2, 1, 1));
        labels[[0, 0, 0]] = 1;
        let atlas = Atlas::new(
            LabelVolume {
                labels,
                affine: Affine::identity(),
            },
            vec!["a".into(), "b".into()],
        )
        .unwrap();
        let extractor = SignalExtractor::builder(&atlas).standardize(false).build();
        let data = Array::from_shape_fn((2, 1, 1, 4), |(_, _, _, t)| t as f32 + 1.0);
        let series = extractor.extract(&data).unwrap();
        assert!(series.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn grid_mismatch_is_rejected() {
        let atlas = strip_atlas();
        let extractor = SignalExtractor::builder(&atlas).build();
        let data = Array4::<f32>::zeros((3, 1, 1, 5));
        assert!(matches!(
            extractor.extract(&data),
            Err(SubjectError::Processing(_))
        ));
    }

    #[test]
    fn repeated_extraction_hits_cache() {
        let atlas = strip_atlas();
        let cache = MemoryCache::default();
        let extractor = SignalExtractor::builder(&atlas).cache(cache.clone()).build();
        let first = extractor.extract(&strip_volume()).unwrap();
        assert_eq!(*cache.hits.borrow(), 0);
        let second = extractor.extract(&strip_volume()).unwrap();
        assert_eq!(*cache.hits.borrow(), 1);
        assert_eq!(first, second);

        let raw = SignalExtractor::builder(&atlas)
            .standardize(false)
            .cache(cache.clone())
            .build();
        raw.extract(&strip_volume()).unwrap();
        assert_eq!(*cache.hits.borrow(), 1);
        assert_eq!(cache.entries.borrow().len(), 2);
    }
}
