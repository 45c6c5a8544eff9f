//! Linear models on standardized features: OLS, ridge, lasso

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

const LASSO_MAX_ITER: usize = 10_000;
const LASSO_TOL: f64 = 1e-6;
const RANK_EPS: f64 = 1e-10;
const MIN_CONDITION: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    pub fn predict_one(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x)
                .map(|(b, v)| b * v)
                .sum::<f64>()
    }
}

fn design(x: &[Vec<f64>]) -> Result<(DMatrix<f64>, usize), String> {
    let n = x.len();
    let p = x.first().map(Vec::len).ok_or("no training rows")?;
    let flat: Vec<f64> = x.iter().flat_map(|r| r.iter().copied()).collect();
    Ok((DMatrix::from_row_slice(n, p, &flat), p))
}

fn mean(y: &[f64]) -> f64 {
    y.iter().sum::<f64>() / y.len().max(1) as f64
}

/// Solve `(XᵀX + αI) b = Xᵀ(y - ȳ)` on centered features.
///
/// With `alpha == 0` this is ordinary least squares and a rank-deficient
/// design is an error.
pub fn fit_ridge(x: &[Vec<f64>], y: &[f64], alpha: f64) -> Result<LinearModel, String> {
    let (xm, p) = design(x)?;
    let y_mean = mean(y);
    let yc = DVector::from_iterator(y.len(), y.iter().map(|v| v - y_mean));

    let mut gram = xm.transpose() * &xm;
    for j in 0..p {
        gram[(j, j)] += alpha;
    }
    let rhs = xm.transpose() * yc;

    if alpha <= 0.0 {
        let singular = gram.clone().svd(false, false).singular_values;
        let largest = singular.iter().fold(0.0_f64, |m, s| m.max(*s));
        let smallest = singular.iter().fold(f64::INFINITY, |m, s| m.min(*s));
        if largest <= 0.0 || smallest / largest < MIN_CONDITION {
            return Err("singular design matrix".into());
        }
    }

    let beta = match gram.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        None => gram.svd(true, true).solve(&rhs, RANK_EPS)?,
    };

    let coefficients: Vec<f64> = beta.iter().copied().collect();
    if coefficients.iter().any(|b| !b.is_finite()) {
        return Err("non-finite coefficients".into());
    }
    Ok(LinearModel {
        intercept: y_mean,
        coefficients,
    })
}

pub fn fit_ols(x: &[Vec<f64>], y: &[f64]) -> Result<LinearModel, String> {
    fit_ridge(x, y, 0.0)
}

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

/// Cyclic coordinate descent on `(1/2n)‖y - ȳ - Xb‖² + α‖b‖₁`.
pub fn fit_lasso(x: &[Vec<f64>], y: &[f64], alpha: f64) -> Result<LinearModel, String> {
    let n = x.len();
    let p = x.first().map(Vec::len).ok_or("no training rows")?;
    let nf = n as f64;
    let y_mean = mean(y);

    let col_sq: Vec<f64> = (0..p)
        .map(|j| x.iter().map(|r| r[j] * r[j]).sum::<f64>())
        .collect();
    let mut beta = vec![0.0; p];
    let mut residual: Vec<f64> = y.iter().map(|v| v - y_mean).collect();

    for _ in 0..LASSO_MAX_ITER {
        let mut max_delta: f64 = 0.0;
        for j in 0..p {
            if col_sq[j] <= 0.0 {
                continue;
            }
            let rho = x
                .iter()
                .zip(&residual)
                .map(|(r, e)| r[j] * e)
                .sum::<f64>()
                + col_sq[j] * beta[j];
            let updated = soft_threshold(rho / nf, alpha) / (col_sq[j] / nf);
            let delta = updated - beta[j];
            if delta != 0.0 {
                for (r, e) in x.iter().zip(residual.iter_mut()) {
                    *e -= delta * r[j];
                }
                beta[j] = updated;
            }
            max_delta = max_delta.max(delta.abs());
        }

        if !max_delta.is_finite() {
            return Err("coordinate descent diverged".into());
        }
        let scale = beta.iter().fold(1.0_f64, |m, b| m.max(b.abs()));
        if max_delta <= LASSO_TOL * scale {
            return Ok(LinearModel {
                intercept: y_mean,
                coefficients: beta,
            });
        }
    }

    Err(format!(
        "coordinate descent did not converge in {} iterations",
        LASSO_MAX_ITER
    ))
}
