//! Parcellation atlases.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::AtlasError;
use crate::geometry::VoxelGrid;
use crate::volume::{self, Affine, LabelVolume, VolumeError};

/// Published location of the Schaefer 2018 MNI parcellations.
pub const SCHAEFER_BASE_URL: &str = "https://raw.githubusercontent.com/ThomasYeoLab/CBIG/v0.14.3-Update_Yeo2011_Schaefer2018_labelname/stable_projects/brain_parcellation/Schaefer2018_LocalGlobal/Parcellations/MNI/";

pub const SCHAEFER_ROI_COUNTS: [usize; 10] = [100, 200, 300, 400, 500, 600, 700, 800, 900, 1000];

/// An immutable parcellation: label image plus one name per region, in label order.
#[derive(Debug, Clone)]
pub struct Atlas {
    labels: LabelVolume,
    names: Vec<String>,
    fingerprint: String,
}

impl Atlas {
    /// Region `i` (0-based) is voxels labelled `i + 1`.
    pub fn new(labels: LabelVolume, names: Vec<String>) -> Result<Self, AtlasError> {
        let n_rois = names.len();
        if n_rois == 0 {
            return Err(AtlasError::Malformed {
                path: PathBuf::new(),
                reason: "atlas has no regions".to_string(),
            });
        }
        if let Some(&max) = labels.labels.iter().max() {
            if max as usize > n_rois {
                return Err(AtlasError::Malformed {
                    path: PathBuf::new(),
                    reason: format!(
                        "label image contains label {} but only {} region name(s) were given",
                        max, n_rois
                    ),
                });
            }
        }
        let fingerprint = fingerprint(&labels);
        Ok(Atlas {
            labels,
            names,
            fingerprint,
        })
    }

    pub fn n_rois(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn labels(&self) -> &LabelVolume {
        &self.labels
    }

    pub fn affine(&self) -> &Affine {
        &self.labels.affine
    }

    pub fn grid(&self) -> VoxelGrid {
        let s = self.labels.labels.shape();
        VoxelGrid {
            shape: [s[0], s[1], s[2]],
            affine: *self.affine(),
        }
    }

    /// Hex SHA-256 of the label image geometry and contents.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint(labels: &LabelVolume) -> String {
    let mut hasher = Sha256::new();
    for &d in labels.labels.shape() {
        hasher.update((d as u64).to_le_bytes());
    }
    for v in labels.affine.iter() {
        hasher.update(v.to_le_bytes());
    }
    for &label in labels.labels.iter() {
        hasher.update(label.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Resolves an atlas for a requested number of regions.
pub trait AtlasProvider {
    fn fetch(&self, n_rois: usize) -> Result<Atlas, AtlasError>;
}

/// Schaefer 2018 cortical parcellation in FSL MNI152 space.
#[derive(Debug, Clone)]
pub struct SchaeferAtlas {
    data_dir: PathBuf,
    yeo_networks: u8,
    resolution_mm: u8,
    allow_download: bool,
    base_url: String,
}

impl SchaeferAtlas {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        SchaeferAtlas {
            data_dir: data_dir.into(),
            yeo_networks: 7,
            resolution_mm: 1,
            allow_download: cfg!(feature = "download"),
            base_url: SCHAEFER_BASE_URL.to_string(),
        }
    }

    pub fn yeo_networks(mut self, yeo_networks: u8) -> Self {
        self.yeo_networks = yeo_networks;
        self
    }

    pub fn resolution_mm(mut self, resolution_mm: u8) -> Self {
        self.resolution_mm = resolution_mm;
        self
    }

    pub fn allow_download(mut self, allow: bool) -> Self {
        self.allow_download = allow;
        self
    }

    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub fn labels_file_name(&self, n_rois: usize) -> String {
        format!(
            "Schaefer2018_{}Parcels_{}Networks_order.txt",
            n_rois, self.yeo_networks
        )
    }

    pub fn image_file_name(&self, n_rois: usize) -> String {
        format!(
            "Schaefer2018_{}Parcels_{}Networks_order_FSLMNI152_{}mm.nii.gz",
            n_rois, self.yeo_networks, self.resolution_mm
        )
    }

    fn validate(&self, n_rois: usize) -> Result<(), AtlasError> {
        if !SCHAEFER_ROI_COUNTS.contains(&n_rois) {
            return Err(AtlasError::UnsupportedResolution(format!(
                "{} ROIs (expected one of {:?})",
                n_rois, SCHAEFER_ROI_COUNTS
            )));
        }
        if self.yeo_networks != 7 && self.yeo_networks != 17 {
            return Err(AtlasError::UnsupportedResolution(format!(
                "{} Yeo networks (expected 7 or 17)",
                self.yeo_networks
            )));
        }
        if self.resolution_mm != 1 && self.resolution_mm != 2 {
            return Err(AtlasError::UnsupportedResolution(format!(
                "{} mm voxels (expected 1 or 2)",
                self.resolution_mm
            )));
        }
        Ok(())
    }

    /// Local path of `file_name`, downloading it first when missing and allowed.
    fn resolve(&self, file_name: &str) -> Result<PathBuf, AtlasError> {
        let path = self.data_dir.join(file_name);
        if path.is_file() {
            debug!("Using cached atlas file {}", path.display());
            return Ok(path);
        }
        if !self.allow_download {
            return Err(AtlasError::Unavailable(path));
        }
        let url = Url::parse(&self.base_url)
            .and_then(|base| base.join(file_name))
            .map_err(|e| AtlasError::Download {
                url: format!("{}{}", self.base_url, file_name),
                reason: e.to_string(),
            })?;
        fs::create_dir_all(&self.data_dir)?;
        download(&url, &path)?;
        Ok(path)
    }
}

impl AtlasProvider for SchaeferAtlas {
    fn fetch(&self, n_rois: usize) -> Result<Atlas, AtlasError> {
        self.validate(n_rois)?;
        info!(
            "Fetching Schaefer atlas with {} ROIs ({} networks, {} mm)...",
            n_rois, self.yeo_networks, self.resolution_mm
        );
        let labels_path = self.resolve(&self.labels_file_name(n_rois))?;
        let image_path = self.resolve(&self.image_file_name(n_rois))?;

        let text = fs::read_to_string(&labels_path)?;
        let names = parse_label_table(&text, n_rois).map_err(|reason| AtlasError::Malformed {
            path: labels_path.clone(),
            reason,
        })?;
        let labels = volume::load_labels(&image_path).map_err(|e| AtlasError::Malformed {
            path: image_path.clone(),
            reason: match e {
                VolumeError::Read(m) | VolumeError::Geometry(m) => m,
            },
        })?;

        Atlas::new(labels, names).map_err(|e| match e {
            AtlasError::Malformed { reason, .. } => AtlasError::Malformed {
                path: image_path,
                reason,
            },
            other => other,
        })
    }
}

/// Parses a Schaefer colour table: `index<TAB>name<TAB>r<TAB>g<TAB>b<TAB>a` per region.
pub fn parse_label_table(text: &str, n_rois: usize) -> Result<Vec<String>, String> {
    let mut names = Vec::with_capacity(n_rois);
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let index: usize = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| format!("line {}: missing region index", line_no + 1))?;
        let name = fields
            .next()
            .ok_or_else(|| format!("line {}: missing region name", line_no + 1))?;
        if index != names.len() + 1 {
            return Err(format!(
                "line {}: expected region index {}, found {}",
                line_no + 1,
                names.len() + 1,
                index
            ));
        }
        names.push(name.to_string());
    }
    if names.len() != n_rois {
        return Err(format!(
            "expected {} regions, found {}",
            n_rois,
            names.len()
        ));
    }
    Ok(names)
}

#[cfg(feature = "download")]
fn download(url: &Url, dest: &Path) -> Result<(), AtlasError> {
    use std::io::Write;

    info!("Downloading {} -> {}", url, dest.display());
    let failed = |reason: String| AtlasError::Download {
        url: url.to_string(),
        reason,
    };
    let response = reqwest::blocking::get(url.as_str())
        .and_then(|r| r.error_for_status())
        .map_err(|e| failed(e.to_string()))?;
    let bytes = response.bytes().map_err(|e| failed(e.to_string()))?;

    let tmp = dest.with_extension(format!("part.{}", std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, dest)?;
    debug!("Downloaded {} bytes to {}", bytes.len(), dest.display());
    Ok(())
}

#[cfg(not(feature = "download"))]
fn download(_url: &Url, dest: &Path) -> Result<(), AtlasError> {
    Err(AtlasError::Unavailable(dest.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn table(n: usize) -> String {
        (1..=n)
            .map(|i| format!("{}\t7Networks_LH_Vis_{}\t120\t18\t134\t0\n", i, i))
            .collect()
    }

    #[test]
    fn parses_schaefer_colour_table() {
        let names = parse_label_table(&table(3), 3).unwrap();
        assert_eq!(names, vec!["7Networks_LH_Vis_1", "7Networks_LH_Vis_2", "7Networks_LH_Vis_3"]);
    }

    #[test]
    fn label_table_length_must_match() {
        assert!(parse_label_table(&table(3), 4).is_err());
        assert!(parse_label_table("1\tA\n3\tB\n", 2).is_err());
    }

    #[test]
    fn unsupported_roi_count_is_a_retrieval_error() {
        let dir = tempdir().unwrap();
        let provider = SchaeferAtlas::new(dir.path()).allow_download(false);
        assert!(matches!(
            provider.fetch(150),
            Err(AtlasError::UnsupportedResolution(_))
        ));
        let provider = SchaeferAtlas::new(dir.path()).yeo_networks(9);
        assert!(matches!(
            provider.fetch(100),
            Err(AtlasError::UnsupportedResolution(_))
        ));
    }

    #[test]
    fn offline_missing_files_are_unavailable() {
        let dir = tempdir().unwrap();
        let provider = SchaeferAtlas::new(dir.path()).allow_download(false);
        match provider.fetch(100) {
            Err(AtlasError::Unavailable(path)) => {
                assert!(path.ends_with("Schaefer2018_100Parcels_7Networks_order.txt"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn file_names_follow_published_layout() {
        let provider = SchaeferAtlas::new("/tmp").yeo_networks(17).resolution_mm(2);
        assert_eq!(
            provider.image_file_name(400),
            "Schaefer2018_400Parcels_17Networks_order_FSLMNI152_2mm.nii.gz"
        );
        assert_eq!(
            provider.labels_file_name(400),
            "Schaefer2018_400Parcels_17Networks_order.txt"
        );
    }

    #[test]
    fn atlas_rejects_labels_beyond_names() {
        let mut labels = Array3::<u32>::zeros((2, 2, 2));
        labels[[1, 1, 1]] = 3;
        let volume = LabelVolume {
            labels,
            affine: Affine::identity(),
        };
        assert!(Atlas::new(volume, vec!["a".into(), "b".into()]).is_err());
    }

    #[test]
    fn fingerprint_tracks_label_content() {
        let mut labels = Array3::<u32>::zeros((2, 2, 2));
        labels[[0, 0, 0]] = 1;
        let a = Atlas::new(
            LabelVolume {
                labels: labels.clone(),
                affine: Affine::identity(),
            },
            vec!["a".into()],
        )
        .unwrap();
        labels[[0, 0, 1]] = 1;
        let b = Atlas::new(
            LabelVolume {
                labels,
                affine: Affine::identity(),
            },
            vec!["a".into()],
        )
        .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.grid().shape, [2, 2, 2]);
        assert_eq!(a.grid().affine, *a.affine());
    }
}
