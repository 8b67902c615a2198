//! Linear dimensionality reduction onto principal components.
//!
//! The projection basis depends on the variance of the whole corpus, so
//! [`DimensionalityReducer::fit`] takes the full feature matrix in one call.
//! Fitting per batch would give each batch its own basis and make the
//! resulting embeddings incomparable.
//!
//! When the input width does not exceed the target dimension the fitted
//! reducer is a passthrough: projecting onto more axes than the input has
//! would only pad with zeros.

use crate::{EmbedRecError, Result};
use nalgebra::{DMatrix, SymmetricEigen};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Reducer hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerConfig {
    /// Embedding dimension `D`.
    pub n_components: usize,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self { n_components: 64 }
    }
}

/// Unfitted principal-component reducer.
#[derive(Debug, Clone, Default)]
pub struct DimensionalityReducer {
    config: ReducerConfig,
}

impl DimensionalityReducer {
    pub fn new(config: ReducerConfig) -> Self {
        Self { config }
    }

    /// Fit the projection on every row of the corpus.
    ///
    /// Accumulation is sequential in row order, so the result does not depend
    /// on scheduling. Each component's sign is fixed so that its largest
    /// magnitude entry is positive.
    ///
    /// # Errors
    ///
    /// - [`EmbedRecError::EmptyCorpus`] if `rows` is empty.
    /// - [`EmbedRecError::DimensionMismatch`] if rows differ in width.
    /// - [`EmbedRecError::InvalidConfig`] if `n_components` is zero.
    pub fn fit(&self, rows: &[Vec<f32>]) -> Result<FittedReducer> {
        let n_components = self.config.n_components;
        if n_components == 0 {
            return Err(EmbedRecError::InvalidConfig(
                "`n_components` must be >= 1".into(),
            ));
        }
        let Some(first) = rows.first() else {
            return Err(EmbedRecError::EmptyCorpus(
                "cannot fit the reducer on zero rows".into(),
            ));
        };
        let width = first.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(EmbedRecError::DimensionMismatch {
                expected: width,
                actual: bad.len(),
            });
        }

        if width <= n_components {
            tracing::warn!(
                width,
                n_components,
                "feature width does not exceed embedding dimension; reducer is a passthrough"
            );
            return Ok(FittedReducer::Passthrough { width });
        }

        let n = rows.len();
        let mut mean = vec![0.0f64; width];
        for row in rows {
            for (m, &x) in mean.iter_mut().zip(row) {
                *m += f64::from(x);
            }
        }
        mean.iter_mut().for_each(|m| *m /= n as f64);

        // Σ = Xᶜᵀ Xᶜ / (n - 1)
        let centered = DMatrix::<f64>::from_fn(n, width, |i, j| f64::from(rows[i][j]) - mean[j]);
        let denom = (n.max(2) - 1) as f64;
        let covariance = (centered.transpose() * &centered) / denom;

        let eigen = SymmetricEigen::new(covariance);
        let mut order: Vec<usize> = (0..width).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .total_cmp(&eigen.eigenvalues[a])
                .then(a.cmp(&b))
        });

        let mut components = Vec::with_capacity(n_components);
        let mut explained_variance = Vec::with_capacity(n_components);
        for &idx in order.iter().take(n_components) {
            let mut axis: Vec<f64> = eigen.eigenvectors.column(idx).iter().copied().collect();
            let pivot = axis
                .iter()
                .copied()
                .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
            if pivot < 0.0 {
                axis.iter_mut().for_each(|x| *x = -*x);
            }
            components.push(axis.into_iter().map(|x| x as f32).collect());
            explained_variance.push(eigen.eigenvalues[idx].max(0.0) as f32);
        }

        let total: f64 = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();
        let kept: f64 = explained_variance.iter().map(|&v| f64::from(v)).sum();
        tracing::info!(
            rows = n,
            width,
            n_components,
            explained_ratio = if total > 0.0 { kept / total } else { 0.0 },
            "fitted principal-component reducer"
        );

        Ok(FittedReducer::Projection {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            components,
            explained_variance,
        })
    }
}

/// Fitted reduction. Immutable once returned from [`DimensionalityReducer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedReducer {
    /// Input is returned unchanged.
    Passthrough { width: usize },
    /// `y = C (x - mean)`, one row of `C` per component.
    Projection {
        mean: Vec<f32>,
        components: Vec<Vec<f32>>,
        explained_variance: Vec<f32>,
    },
}

impl FittedReducer {
    /// Width of the raw feature vectors this reducer accepts.
    pub fn input_width(&self) -> usize {
        match self {
            FittedReducer::Passthrough { width } => *width,
            FittedReducer::Projection { mean, .. } => mean.len(),
        }
    }

    /// Embedding dimension `D` of the output.
    pub fn output_dim(&self) -> usize {
        match self {
            FittedReducer::Passthrough { width } => *width,
            FittedReducer::Projection { components, .. } => components.len(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FittedReducer::Passthrough { .. })
    }

    /// Project one raw feature vector. The result is not normalised.
    pub fn transform(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != self.input_width() {
            return Err(EmbedRecError::DimensionMismatch {
                expected: self.input_width(),
                actual: features.len(),
            });
        }
        match self {
            FittedReducer::Passthrough { .. } => Ok(features.to_vec()),
            FittedReducer::Projection {
                mean, components, ..
            } => Ok(components
                .iter()
                .map(|axis| {
                    features
                        .iter()
                        .zip(mean)
                        .zip(axis)
                        .map(|((&x, &m), &c)| f64::from(x - m) * f64::from(c))
                        .sum::<f64>() as f32
                })
                .collect()),
        }
    }

    /// Project many rows, preserving input order.
    pub fn transform_all(&self, rows: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let out: Vec<Result<Vec<f32>>> = rows.par_iter().map(|r| self.transform(r)).collect();
        out.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
