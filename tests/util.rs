#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array3, Array4};
use nifti::header::MAGIC_CODE_NIP1;
use nifti::writer::WriterOptions;
use nifti::{NiftiHeader, NiftiType};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use fc_matrices::atlas::{Atlas, AtlasProvider};
use fc_matrices::error::AtlasError;
use fc_matrices::volume::{Affine, LabelVolume};

pub const IDENTITY_ROWS: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

pub fn float_header(sform_rows: Option<[[f32; 4]; 3]>) -> NiftiHeader {
    let (sform_code, rows) = match sform_rows {
        Some(rows) => (1, rows),
        None => (0, [[0.0; 4]; 3]),
    };
    NiftiHeader {
        datatype: NiftiType::Float32 as i16,
        bitpix: 32,
        magic: *MAGIC_CODE_NIP1,
        scl_slope: 1.0,
        scl_inter: 0.0,
        sform_code,
        qform_code: 0,
        srow_x: rows[0],
        srow_y: rows[1],
        srow_z: rows[2],
        ..NiftiHeader::default()
    }
}

/// Writes `data` to exactly `path`.
///
/// The nifti writer normalizes a bare `.gz` name to `.nii.gz`, so the file is moved back to the
/// requested name afterwards.
pub fn write_signal(path: &Path, data: &Array4<f32>, sform_rows: Option<[[f32; 4]; 3]>) {
    WriterOptions::new(path)
        .reference_header(&float_header(sform_rows))
        .write_nifti(data)
        .unwrap();
    if !path.is_file() {
        let written = path.with_extension("nii.gz");
        assert!(written.is_file(), "nifti writer produced neither {:?} nor {:?}", path, written);
        fs::rename(&written, path).unwrap();
    }
}

pub fn write_labels(path: &Path, labels: &Array3<u32>, sform_rows: [[f32; 4]; 3]) {
    let data = labels.mapv(|l| l as f32);
    WriterOptions::new(path)
        .reference_header(&float_header(Some(sform_rows)))
        .write_nifti(&data)
        .unwrap();
}

/// Gaussian noise volume, reproducible per seed.
pub fn random_signal(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(100.0f32, 5.0).unwrap();
    Array4::from_shape_simple_fn(shape, || normal.sample(&mut rng))
}

/// Creates `<root>/<id>/<id>.gz` holding `data` with an identity sform.
pub fn write_subject(root: &Path, id: &str, data: &Array4<f32>) -> PathBuf {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.gz", id));
    write_signal(&path, data, Some(IDENTITY_ROWS));
    path
}

/// 2×2×2 grid, two voxels per region, identity affine.
pub fn cube_atlas() -> Atlas {
    let mut labels = Array3::<u32>::zeros((2, 2, 2));
    for ((x, y, _), label) in labels.indexed_iter_mut() {
        *label = (x * 2 + y) as u32 + 1;
    }
    Atlas::new(
        LabelVolume {
            labels,
            affine: Affine::identity(),
        },
        (1..=4).map(|i| format!("roi_{}", i)).collect(),
    )
    .unwrap()
}

/// Hands out a prebuilt atlas, or fails like an unreachable source.
pub struct FixedAtlas(pub Option<Atlas>);

impl AtlasProvider for FixedAtlas {
    fn fetch(&self, n_rois: usize) -> Result<Atlas, AtlasError> {
        match &self.0 {
            Some(atlas) if atlas.n_rois() == n_rois => Ok(atlas.clone()),
            Some(atlas) => Err(AtlasError::UnsupportedResolution(format!(
                "{} ROIs (only {} available)",
                n_rois,
                atlas.n_rois()
            ))),
            None => Err(AtlasError::Download {
                url: "https://atlas.invalid/".to_string(),
                reason: "unreachable".to_string(),
            }),
        }
    }
}
