//! Content-addressed cache for extracted region time series.
//!
//! Keys are SHA-256 digests over the normalized extraction inputs, so an entry is only ever
//! reused for byte-identical inputs and never needs invalidation. Entries are written to a
//! temporary file and renamed into place; readers either see a complete entry or none.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::debug;
use ndarray::{Array2, Ix2};
use sha2::{Digest, Sha256};

use crate::npy;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incrementally hashes the inputs of an extraction. Every field is length- or tag-prefixed
/// so that different field sequences cannot collide.
pub struct CacheKeyBuilder {
    hasher: Sha256,
}

impl CacheKeyBuilder {
    pub fn new(namespace: &str) -> Self {
        let mut builder = CacheKeyBuilder {
            hasher: Sha256::new(),
        };
        builder.field_str("namespace", namespace);
        builder
    }

    fn tag(&mut self, name: &str) {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
    }

    pub fn field_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.tag(name);
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn field_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.tag(name);
        self.hasher.update([value as u8]);
        self
    }

    pub fn field_shape(&mut self, name: &str, shape: &[usize]) -> &mut Self {
        self.tag(name);
        self.hasher.update((shape.len() as u64).to_le_bytes());
        for &d in shape {
            self.hasher.update((d as u64).to_le_bytes());
        }
        self
    }

    pub fn field_f32s<'a, I>(&mut self, name: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a f32>,
    {
        self.tag(name);
        let mut count = 0u64;
        for v in values {
            self.hasher.update(v.to_le_bytes());
            count += 1;
        }
        self.hasher.update(count.to_le_bytes());
        self
    }

    pub fn finish(&self) -> CacheKey {
        CacheKey(format!("{:x}", self.hasher.clone().finalize()))
    }
}

/// Storage for extracted (timepoints × regions) matrices.
pub trait ExtractionCache {
    fn load(&self, key: &CacheKey) -> Result<Option<Array2<f64>>>;
    fn store(&self, key: &CacheKey, value: &Array2<f64>) -> Result<()>;
}

/// Disables caching.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ExtractionCache for NoCache {
    fn load(&self, _key: &CacheKey) -> Result<Option<Array2<f64>>> {
        Ok(None)
    }

    fn store(&self, _key: &CacheKey, _value: &Array2<f64>) -> Result<()> {
        Ok(())
    }
}

/// One `.npy` file per key, sharded by the first two hex digits.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        DiskCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let shard = &key.as_str()[..2.min(key.as_str().len())];
        self.root.join(shard).join(format!("{}.npy", key))
    }
}

impl ExtractionCache for DiskCache {
    fn load(&self, key: &CacheKey) -> Result<Option<Array2<f64>>> {
        let path = self.entry_path(key);
        if !path.is_file() {
            debug!("Cache miss: {}", key);
            return Ok(None);
        }
        let array = npy::read_npy::<f64>(&path)?
            .into_dimensionality::<Ix2>()
            .map_err(|e| anyhow!("Cache entry {} is not 2D: {}", path.display(), e))?;
        debug!("Cache hit: {}", key);
        Ok(Some(array))
    }

    fn store(&self, key: &CacheKey, value: &Array2<f64>) -> Result<()> {
        let path = self.entry_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("Cache entry {} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;

        let tmp = parent.join(format!("{}.{}.tmp", key, std::process::id()));
        npy::write_npy(&tmp, value)?;
        fs::rename(&tmp, &path).with_context(|| {
            format!(
                "Failed to move cache entry {} into place at {}",
                tmp.display(),
                path.display()
            )
        })?;
        debug!("Cached {} at {}", key, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn key_depends_on_every_field() {
        let base = CacheKeyBuilder::new("test")
            .field_bool("standardize", true)
            .field_shape("shape", &[2, 3])
            .field_f32s("data", &[1.0, 2.0])
            .finish();
        let same = CacheKeyBuilder::new("test")
            .field_bool("standardize", true)
            .field_shape("shape", &[2, 3])
            .field_f32s("data", &[1.0, 2.0])
            .finish();
        let flag = CacheKeyBuilder::new("test")
            .field_bool("standardize", false)
            .field_shape("shape", &[2, 3])
            .field_f32s("data", &[1.0, 2.0])
            .finish();
        let shape = CacheKeyBuilder::new("test")
            .field_bool("standardize", true)
            .field_shape("shape", &[3, 2])
            .field_f32s("data", &[1.0, 2.0])
            .finish();
        let data = CacheKeyBuilder::new("test")
            .field_bool("standardize", true)
            .field_shape("shape", &[2, 3])
            .field_f32s("data", &[1.0, 2.5])
            .finish();
        assert_eq!(base, same);
        assert_ne!(base, flag);
        assert_ne!(base, shape);
        assert_ne!(base, data);
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn disk_cache_round_trip() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"));
        let key = CacheKeyBuilder::new("test").field_str("subject", "a").finish();
        assert!(cache.load(&key).unwrap().is_none());

        let value = array![[1.0, -2.0], [0.5, f64::NAN]];
        cache.store(&key, &value).unwrap();
        let loaded = cache.load(&key).unwrap().unwrap();
        assert_eq!(loaded[[0, 1]], -2.0);
        assert!(loaded[[1, 1]].is_nan());

        let shard = cache.root().join(&key.as_str()[..2]);
        let leftovers: Vec<_> = fs::read_dir(shard)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn no_cache_never_hits() {
        let key = CacheKeyBuilder::new("test").finish();
        NoCache.store(&key, &array![[1.0]]).unwrap();
        assert!(NoCache.load(&key).unwrap().is_none());
    }
}
