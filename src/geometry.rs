//! Resampling of signal volumes onto a target voxel grid.

use std::fmt;
use std::str::FromStr;

use log::debug;
use nalgebra::Vector4;
use ndarray::{s, Array4};

use crate::volume::{validate_affine, Affine, SignalVolume, VolumeError};

/// Slack, in voxels, for points that land just outside the source field of view.
const EDGE_TOLERANCE: f64 = 1e-6;
const IDENTITY_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Trilinear interpolation, for continuous-valued signal.
    #[default]
    Continuous,
    Nearest,
}

impl FromStr for Interpolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" | "linear" | "trilinear" => Ok(Interpolation::Continuous),
            "nearest" => Ok(Interpolation::Nearest),
            other => Err(format!(
                "unknown interpolation '{}' (expected 'continuous' or 'nearest')",
                other
            )),
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpolation::Continuous => f.write_str("continuous"),
            Interpolation::Nearest => f.write_str("nearest"),
        }
    }
}

/// Spatial shape and affine of a voxel grid.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelGrid {
    pub shape: [usize; 3],
    pub affine: Affine,
}

/// Up to eight (source voxel, weight) pairs contributing to one target voxel.
struct Taps {
    entries: [([usize; 3], f64); 8],
    len: usize,
}

impl Taps {
    fn new() -> Self {
        Taps {
            entries: [([0; 3], 0.0); 8],
            len: 0,
        }
    }

    fn push(&mut self, index: [usize; 3], weight: f64) {
        if weight == 0.0 {
            return;
        }
        self.entries[self.len] = (index, weight);
        self.len += 1;
    }

    fn as_slice(&self) -> &[([usize; 3], f64)] {
        &self.entries[..self.len]
    }
}

/// Splits a continuous source coordinate into a lower index, upper index and the upper weight.
fn axis_bracket(x: f64, n: usize) -> Option<(usize, usize, f64)> {
    let max = (n - 1) as f64;
    if x < -EDGE_TOLERANCE || x > max + EDGE_TOLERANCE {
        return None;
    }
    let x = x.clamp(0.0, max);
    let lower = x.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    Some((lower, upper, x - lower as f64))
}

fn nearest_index(x: f64, n: usize) -> Option<usize> {
    let rounded = x.round();
    if rounded < 0.0 || rounded > (n - 1) as f64 {
        return None;
    }
    Some(rounded as usize)
}

fn taps_for(point: [f64; 3], shape: [usize; 3], interpolation: Interpolation) -> Option<Taps> {
    let mut taps = Taps::new();
    match interpolation {
        Interpolation::Nearest => {
            let i = nearest_index(point[0], shape[0])?;
            let j = nearest_index(point[1], shape[1])?;
            let k = nearest_index(point[2], shape[2])?;
            taps.push([i, j, k], 1.0);
        }
        Interpolation::Continuous => {
            let (x0, x1, fx) = axis_bracket(point[0], shape[0])?;
            let (y0, y1, fy) = axis_bracket(point[1], shape[1])?;
            let (z0, z1, fz) = axis_bracket(point[2], shape[2])?;
            for (xi, wx) in [(x0, 1.0 - fx), (x1, fx)] {
                for (yi, wy) in [(y0, 1.0 - fy), (y1, fy)] {
                    for (zi, wz) in [(z0, 1.0 - fz), (z1, fz)] {
                        taps.push([xi, yi, zi], wx * wy * wz);
                    }
                }
            }
        }
    }
    Some(taps)
}

fn is_identity(m: &Affine) -> bool {
    (m - Affine::identity())
        .iter()
        .all(|v| v.abs() < IDENTITY_TOLERANCE)
}

/// Resamples `source` onto `target`. Target voxels that fall outside the source are 0.
pub fn resample_to_grid(
    source: &SignalVolume,
    target: &VoxelGrid,
    interpolation: Interpolation,
) -> Result<Array4<f32>, VolumeError> {
    validate_affine(&source.affine)?;
    validate_affine(&target.affine)?;
    let source_inverse = source
        .affine
        .try_inverse()
        .ok_or_else(|| VolumeError::Geometry("source affine is not invertible".to_string()))?;
    let target_to_source = source_inverse * target.affine;

    let source_shape = source.spatial_shape();
    let timepoints = source.timepoints();
    if source_shape.iter().any(|&n| n == 0) || timepoints == 0 {
        return Err(VolumeError::Geometry(format!(
            "empty source volume with shape {:?}",
            source.data.shape()
        )));
    }

    if source_shape == target.shape && is_identity(&target_to_source) {
        debug!("Source already on the target grid; skipping resampling.");
        return Ok(source.data.clone());
    }

    let [nx, ny, nz] = target.shape;
    let mut out = Array4::<f32>::zeros((nx, ny, nz, timepoints));
    let mut outside = 0usize;

    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                let p = target_to_source * Vector4::new(i as f64, j as f64, k as f64, 1.0);
                let taps = match taps_for([p[0], p[1], p[2]], source_shape, interpolation) {
                    Some(taps) => taps,
                    None => {
                        outside += 1;
                        continue;
                    }
                };
                let mut lane = out.slice_mut(s![i, j, k, ..]);
                for &([si, sj, sk], weight) in taps.as_slice() {
                    let src = source.data.slice(s![si, sj, sk, ..]);
                    lane.zip_mut_with(&src, |dst, &v| {
                        *dst = (f64::from(*dst) + weight * f64::from(v)) as f32
                    });
                }
            }
        }
    }

    debug!(
        "Resampled {:?} -> {:?} ({} interpolation); {} target voxel(s) outside the source field of view.",
        source_shape, target.shape, interpolation, outside
    );
    Ok(out)
}
