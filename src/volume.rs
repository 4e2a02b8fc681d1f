//! NIfTI-1 volume loading.
//!
//! Volumes are read with the `nifti` crate and converted into `ndarray` arrays indexed as
//! `[x, y, z]` (labels) or `[x, y, z, t]` (signal), together with the voxel-to-world affine
//! recovered from the header.

use std::path::Path;

use log::debug;
use nalgebra::{Matrix3, Matrix4, Quaternion, UnitQuaternion};
use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

/// Voxel index to world (mm) transform.
pub type Affine = Matrix4<f64>;

const MIN_ABS_DETERMINANT: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("{0}")]
    Read(String),

    #[error("{0}")]
    Geometry(String),
}

/// A 4D signal volume (3 spatial axes + time).
#[derive(Debug, Clone)]
pub struct SignalVolume {
    pub data: Array4<f32>,
    pub affine: Affine,
}

impl SignalVolume {
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    pub fn timepoints(&self) -> usize {
        self.data.len_of(Axis(3))
    }
}

/// A 3D integer label volume. Label 0 is background.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    pub labels: Array3<u32>,
    pub affine: Affine,
}

fn read_object(path: &Path) -> Result<(NiftiHeader, ArrayD<f32>), VolumeError> {
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| VolumeError::Read(format!("{}: {}", path.display(), e)))?;
    let header = object.header().clone();
    let data = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| VolumeError::Read(format!("{}: {}", path.display(), e)))?;
    debug!(
        "Read {} with shape {:?} (sform_code={}, qform_code={})",
        path.display(),
        data.shape(),
        header.sform_code,
        header.qform_code
    );
    Ok((header, data))
}

/// Loads a 4D signal volume and its affine.
pub fn load_signal(path: &Path) -> Result<SignalVolume, VolumeError> {
    let (header, data) = read_object(path)?;
    let affine = header_affine(&header)?;
    if data.ndim() != 4 {
        return Err(VolumeError::Geometry(format!(
            "expected a 4D volume, {} has {} dimension(s) {:?}",
            path.display(),
            data.ndim(),
            data.shape()
        )));
    }
    let data = data
        .into_dimensionality::<Ix4>()
        .map_err(|e| VolumeError::Read(e.to_string()))?;
    Ok(SignalVolume { data, affine })
}

/// Loads a label volume. A 4D image with a single frame is accepted and squeezed.
pub fn load_labels(path: &Path) -> Result<LabelVolume, VolumeError> {
    let (header, data) = read_object(path)?;
    let affine = header_affine(&header)?;
    let data = match data.ndim() {
        3 => data,
        4 if data.len_of(Axis(3)) == 1 => data.index_axis_move(Axis(3), 0),
        n => {
            return Err(VolumeError::Geometry(format!(
                "expected a 3D label image, {} has {} dimension(s) {:?}",
                path.display(),
                n,
                data.shape()
            )))
        }
    };
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|e| VolumeError::Read(e.to_string()))?;

    let mut labels = Array3::<u32>::zeros(data.raw_dim());
    for (dst, &value) in labels.iter_mut().zip(data.iter()) {
        let rounded = value.round();
        if !rounded.is_finite() || rounded < 0.0 {
            return Err(VolumeError::Read(format!(
                "{} contains a non-label value {}",
                path.display(),
                value
            )));
        }
        *dst = rounded as u32;
    }
    Ok(LabelVolume { labels, affine })
}

/// Recovers the voxel-to-world affine, preferring sform over qform.
///
/// Fails when neither transform is declared, or when the result is non-finite or singular.
pub fn header_affine(header: &NiftiHeader) -> Result<Affine, VolumeError> {
    let affine = if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut m = Affine::identity();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                m[(r, c)] = f64::from(*value);
            }
        }
        m
    } else if header.qform_code > 0 {
        qform_affine(header)
    } else {
        return Err(VolumeError::Geometry(
            "no orientation information (sform_code and qform_code are both 0)".to_string(),
        ));
    };
    validate_affine(&affine)?;
    Ok(affine)
}

fn qform_affine(header: &NiftiHeader) -> Affine {
    let b = f64::from(header.quatern_b);
    let c = f64::from(header.quatern_c);
    let d = f64::from(header.quatern_d);
    let w = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let rotation: Matrix3<f64> = UnitQuaternion::from_quaternion(Quaternion::new(w, b, c, d))
        .to_rotation_matrix()
        .into_inner();

    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let zooms = [
        f64::from(header.pixdim[1]),
        f64::from(header.pixdim[2]),
        f64::from(header.pixdim[3]) * qfac,
    ];

    let mut m = Affine::identity();
    for r in 0..3 {
        for c in 0..3 {
            m[(r, c)] = rotation[(r, c)] * zooms[c];
        }
    }
    m[(0, 3)] = f64::from(header.quatern_x);
    m[(1, 3)] = f64::from(header.quatern_y);
    m[(2, 3)] = f64::from(header.quatern_z);
    m
}

pub fn validate_affine(affine: &Affine) -> Result<(), VolumeError> {
    if affine.iter().any(|v| !v.is_finite()) {
        return Err(VolumeError::Geometry(
            "affine contains non-finite values".to_string(),
        ));
    }
    let linear = affine.fixed_view::<3, 3>(0, 0).into_owned();
    if linear.determinant().abs() < MIN_ABS_DETERMINANT {
        return Err(VolumeError::Geometry(format!(
            "affine is singular: {}",
            affine
        )));
    }
    Ok(())
}
