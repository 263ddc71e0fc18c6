//! Linear margin classifier and cross-validation used by the unmasking
//! rounds.
//!
//! The classifier is a deterministic, full-batch subgradient fit of an
//! L2-regularised hinge loss. No randomness anywhere: the same sample
//! matrix always yields the same coefficients, the same fold accuracies
//! and therefore the same curve.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, UnmaskingError};

const FIT_ITERATIONS: usize = 200;
const LEARNING_RATE: f64 = 0.05;
const L2_LAMBDA: f64 = 0.01;

/// Labelled sample matrix for one unmasking round. Rows are chunk
/// feature vectors, labels are 0 for the first text and 1 for the
/// second.
#[derive(Debug, Clone)]
pub struct SampleMatrix {
    pub x: DMatrix<f64>,
    pub y: Vec<u8>,
}

impl SampleMatrix {
    pub fn num_samples(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }

    /// Drop the given feature columns (ascending, deduplicated indices).
    pub fn without_columns(&self, cols: &[usize]) -> SampleMatrix {
        let keep: Vec<usize> = (0..self.x.ncols()).filter(|c| !cols.contains(c)).collect();
        let mut x = DMatrix::zeros(self.x.nrows(), keep.len());
        for (new_c, &old_c) in keep.iter().enumerate() {
            x.set_column(new_c, &self.x.column(old_c));
        }
        SampleMatrix {
            x,
            y: self.y.clone(),
        }
    }
}

/// Interleave the chunk vectors of both texts into a labelled matrix.
///
/// Rows alternate between the two texts for as long as both have chunks
/// left, then the longer text's remainder follows. Alternation keeps
/// contiguous cross-validation folds label-balanced.
pub fn build_sample_matrix(a: &[Vec<f64>], b: &[Vec<f64>]) -> Result<SampleMatrix> {
    if a.is_empty() || b.is_empty() {
        return Err(UnmaskingError::Classifier(
            "both texts need at least one chunk".to_string(),
        ));
    }
    let dim = a[0].len();
    if a.iter().chain(b.iter()).any(|v| v.len() != dim) {
        return Err(UnmaskingError::Classifier(
            "inconsistent feature vector lengths".to_string(),
        ));
    }
    if dim == 0 {
        return Err(UnmaskingError::Classifier(
            "empty feature vectors".to_string(),
        ));
    }

    let mut rows: Vec<&Vec<f64>> = Vec::with_capacity(a.len() + b.len());
    let mut y = Vec::with_capacity(a.len() + b.len());
    let common = a.len().min(b.len());
    for i in 0..common {
        rows.push(&a[i]);
        y.push(0);
        rows.push(&b[i]);
        y.push(1);
    }
    for v in &a[common..] {
        rows.push(v);
        y.push(0);
    }
    for v in &b[common..] {
        rows.push(v);
        y.push(1);
    }

    let x = DMatrix::from_fn(rows.len(), dim, |r, c| rows[r][c]);
    Ok(SampleMatrix { x, y })
}

/// A fitted linear decision function `sign(x . weights + bias)`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    pub weights: DVector<f64>,
    pub bias: f64,
}

impl LinearModel {
    pub fn predict(&self, x: &DMatrix<f64>) -> Vec<u8> {
        (x * &self.weights)
            .iter()
            .map(|v| u8::from(v + self.bias >= 0.0))
            .collect()
    }

    pub fn accuracy(&self, x: &DMatrix<f64>, y: &[u8]) -> f64 {
        let predicted = self.predict(x);
        let hits = predicted.iter().zip(y).filter(|(p, t)| p == t).count();
        hits as f64 / y.len() as f64
    }
}

/// Fit the margin classifier on the full matrix.
///
/// Returns a degenerate-fit error when only one label is present; the
/// caller skips such rounds rather than aborting the curve.
pub fn fit_linear(x: &DMatrix<f64>, y: &[u8]) -> Result<LinearModel> {
    if y.is_empty() || x.nrows() != y.len() {
        return Err(UnmaskingError::Classifier(
            "label and sample counts disagree".to_string(),
        ));
    }
    if y.iter().all(|&l| l == y[0]) {
        return Err(UnmaskingError::Classifier(
            "degenerate fit: training data contains a single class".to_string(),
        ));
    }

    let n = x.nrows();
    let targets: Vec<f64> = y.iter().map(|&l| if l == 0 { -1.0 } else { 1.0 }).collect();
    let mut weights = DVector::zeros(x.ncols());
    let mut bias = 0.0f64;

    for _ in 0..FIT_ITERATIONS {
        let margins = x * &weights;
        let mut grad_w = DVector::zeros(x.ncols());
        let mut grad_b = 0.0f64;
        for (i, t) in targets.iter().enumerate() {
            if t * (margins[i] + bias) < 1.0 {
                grad_w.axpy(-t, &x.row(i).transpose(), 1.0);
                grad_b -= t;
            }
        }
        grad_w /= n as f64;
        grad_b /= n as f64;
        grad_w.axpy(L2_LAMBDA, &weights, 1.0);
        weights.axpy(-LEARNING_RATE, &grad_w, 1.0);
        bias -= LEARNING_RATE * grad_b;
    }

    Ok(LinearModel { weights, bias })
}

/// Contiguous k-fold cross-validation accuracies.
///
/// Fold boundaries partition the rows in order; with label-alternating
/// matrices from [`build_sample_matrix`] every fold stays roughly
/// balanced. Degenerate training splits propagate as classifier errors.
pub fn cross_val_score(samples: &SampleMatrix, folds: usize) -> Result<Vec<f64>> {
    let n = samples.num_samples();
    if folds < 2 {
        return Err(UnmaskingError::Classifier(
            "cross-validation needs at least two folds".to_string(),
        ));
    }
    if n < folds {
        return Err(UnmaskingError::Classifier(format!(
            "{} samples cannot fill {} folds",
            n, folds
        )));
    }

    let mut scores = Vec::with_capacity(folds);
    for fold in 0..folds {
        let start = fold * n / folds;
        let end = (fold + 1) * n / folds;

        let train_idx: Vec<usize> = (0..n).filter(|i| *i < start || *i >= end).collect();
        let train_x = samples.x.select_rows(&train_idx);
        let train_y: Vec<u8> = train_idx.iter().map(|&i| samples.y[i]).collect();

        let model = fit_linear(&train_x, &train_y)?;

        let test_idx: Vec<usize> = (start..end).collect();
        let test_x = samples.x.select_rows(&test_idx);
        let test_y: Vec<u8> = test_idx.iter().map(|&i| samples.y[i]).collect();
        scores.push(model.accuracy(&test_x, &test_y));
    }
    Ok(scores)
}

/// Map mean fold accuracy to a curve point in `[0, 1]`.
///
/// Chance-level accuracy (0.5) and anything below collapse to zero;
/// perfect accuracy maps to one.
pub fn curve_score(accuracies: &[f64]) -> f64 {
    if accuracies.is_empty() {
        return 0.0;
    }
    let mean = accuracies.iter().sum::<f64>() / accuracies.len() as f64;
    ((mean - 0.5) * 2.0).max(0.0)
}

/// Pick the feature columns to eliminate after a round.
///
/// The first half of the budget (rounded up) takes the most positive
/// coefficients, the rest the most negative, each by first occurrence.
/// Returns ascending column indices; never more than the matrix holds.
pub fn eliminate_columns(weights: &DVector<f64>, num_eliminate: usize) -> Vec<usize> {
    let budget = num_eliminate.min(weights.len());
    let mut removed = vec![false; weights.len()];
    let mut picked = Vec::with_capacity(budget);

    for i in 0..budget {
        let positive_side = (i as f64) < num_eliminate as f64 / 2.0;
        let mut best: Option<usize> = None;
        for (c, &w) in weights.iter().enumerate() {
            if removed[c] {
                continue;
            }
            best = match best {
                None => Some(c),
                Some(b) => {
                    let better = if positive_side { w > weights[b] } else { w < weights[b] };
                    if better {
                        Some(c)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        if let Some(c) = best {
            removed[c] = true;
            picked.push(c);
        }
    }

    picked.sort_unstable();
    picked
}
