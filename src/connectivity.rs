//! Standardization, Pearson correlation and the Fisher z transform.

use ndarray::{Array2, Axis};
use statrs::statistics::Statistics;

/// Columns whose population standard deviation falls below this are only centred.
const MIN_STD: f64 = f64::EPSILON;

/// Centres every column and scales it to unit (population) variance, in place.
pub fn standardize_columns(series: &mut Array2<f64>) {
    if series.nrows() == 0 {
        return;
    }
    for mut column in series.axis_iter_mut(Axis(1)) {
        let mean = column.iter().mean();
        let std = column.iter().population_std_dev();
        let scale = if std.is_finite() && std >= MIN_STD {
            std
        } else {
            1.0
        };
        column.mapv_inplace(|v| (v - mean) / scale);
    }
}

/// Pearson correlation between the columns of `series` (timepoints × regions).
///
/// The result is symmetric with a unit diagonal and values clamped to [-1, 1]. A column with
/// zero variance correlates 0 with every other column. A column holding any non-finite value
/// yields NaN in its whole row and column, diagonal included.
pub fn pearson_correlation(series: &Array2<f64>) -> Array2<f64> {
    let n = series.ncols();
    let finite: Vec<bool> = series
        .axis_iter(Axis(1))
        .map(|c| c.iter().all(|v| v.is_finite()))
        .collect();
    let mut centred = series.to_owned();
    for mut column in centred.axis_iter_mut(Axis(1)) {
        let mean = column.iter().mean();
        if mean.is_finite() {
            column.mapv_inplace(|v| v - mean);
        }
    }
    let norms: Vec<f64> = centred
        .axis_iter(Axis(1))
        .map(|c| c.dot(&c).sqrt())
        .collect();
    let cross = centred.t().dot(&centred);

    let mut corr = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        corr[[i, i]] = if finite[i] { 1.0 } else { f64::NAN };
        for j in (i + 1)..n {
            let denom = norms[i] * norms[j];
            let r = if !finite[i] || !finite[j] {
                f64::NAN
            } else if denom > 0.0 && denom.is_finite() {
                (cross[[i, j]] / denom).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            corr[[i, j]] = r;
            corr[[j, i]] = r;
        }
    }
    corr
}

/// Elementwise inverse hyperbolic tangent. A unit diagonal maps to `+inf`.
pub fn fisher_z(correlation: &Array2<f64>) -> Array2<f64> {
    correlation.mapv(f64::atanh)
}

/// Full per-subject transform: re-standardize, correlate, Fisher-transform.
pub fn connectivity_matrix(mut series: Array2<f64>) -> Array2<f64> {
    standardize_columns(&mut series);
    fisher_z(&pearson_correlation(&series))
}
