//! L2-regularised logistic regression.
//!
//! Training runs iteratively reweighted least squares: Newton steps on the
//! penalised log-likelihood, each solved with a dense Cholesky
//! factorisation. Feature counts here are small (tens of columns), so the
//! d×d solve is cheap and exact. The bias term is never penalised.
//!
//! Everything is deterministic: same data and same `alpha` give the same
//! weights, and cross-validation folds come from a seeded generator.

use serde::{Deserialize, Serialize};

use super::sampling::LcgRng;

/// Candidate regularisation strengths for the grid search.
pub const ALPHA_GRID: [f64; 6] = [0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0];

const MAX_ITER: usize = 100;
const TOLERANCE: f64 = 1e-10;

/// A trained linear model: one weight per feature column plus a bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f32>,
    pub bias: f32,
}

impl LogisticModel {
    /// Match probability for one feature vector.
    pub fn score(&self, features: &[f32]) -> f32 {
        debug_assert_eq!(features.len(), self.weights.len());
        let z: f64 = self.bias as f64
            + features
                .iter()
                .zip(&self.weights)
                .map(|(&x, &w)| x as f64 * w as f64)
                .sum::<f64>();
        sigmoid(z) as f32
    }
}

/// Overflow-safe sigmoid: both branches only ever exponentiate `-|x|`.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Fit weights and bias on a row-major feature matrix.
///
/// `x` has `rows · cols` entries; `y[i]` is true for match pairs. `alpha`
/// is the L2 penalty on the weights.
pub fn fit(rows: usize, cols: usize, x: &[f32], y: &[bool], alpha: f64) -> LogisticModel {
    debug_assert_eq!(x.len(), rows * cols);
    let d = cols + 1; // augmented with the bias column

    let mut w = vec![0.0f64; d];

    for _ in 0..MAX_ITER {
        // Gradient of the penalised negative log-likelihood and the
        // weighted Gram matrix for the Newton step.
        let mut grad = vec![0.0f64; d];
        let mut hess = vec![vec![0.0f64; d]; d];

        for i in 0..rows {
            let row = &x[i * cols..(i + 1) * cols];
            let mut z = w[cols];
            for (j, &v) in row.iter().enumerate() {
                z += w[j] * v as f64;
            }
            let p = sigmoid(z);
            let residual = p - if y[i] { 1.0 } else { 0.0 };
            // Weight floor keeps the Hessian positive definite when
            // predictions saturate.
            let s = (p * (1.0 - p)).max(1e-9);

            for j in 0..cols {
                grad[j] += residual * row[j] as f64;
            }
            grad[cols] += residual;

            for j in 0..cols {
                let xj = row[j] as f64 * s;
                for k in j..cols {
                    hess[j][k] += xj * row[k] as f64;
                }
                hess[j][cols] += xj;
            }
            hess[cols][cols] += s;
        }

        for j in 0..cols {
            grad[j] += alpha * w[j];
            hess[j][j] += alpha;
        }
        // Mirror the upper triangle.
        for j in 0..d {
            for k in 0..j {
                hess[j][k] = hess[k][j];
            }
        }

        let Some(delta) = cholesky_solve(&mut hess, &grad) else {
            break;
        };

        let mut max_step = 0.0f64;
        for j in 0..d {
            w[j] -= delta[j];
            max_step = max_step.max(delta[j].abs());
        }
        if max_step < TOLERANCE {
            break;
        }
    }

    LogisticModel {
        weights: w[..cols].iter().map(|&v| v as f32).collect(),
        bias: w[cols] as f32,
    }
}

/// Mean log-loss of predicted probabilities against labels.
pub fn log_loss(probabilities: &[f64], labels: &[bool]) -> f64 {
    debug_assert_eq!(probabilities.len(), labels.len());
    if probabilities.is_empty() {
        return 0.0;
    }
    let total: f64 = probabilities
        .iter()
        .zip(labels)
        .map(|(&p, &y)| {
            let p = p.clamp(1e-12, 1.0 - 1e-12);
            if y {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / probabilities.len() as f64
}

/// Pick the `ALPHA_GRID` entry with the lowest k-fold cross-validated
/// log-loss. Folds are assigned deterministically; folds whose training
/// side lacks either label class are skipped.
pub fn grid_search_alpha(rows: usize, cols: usize, x: &[f32], y: &[bool], k: usize) -> f64 {
    let folds = fold_assignment(rows, k, 0x5eed);

    let mut best_alpha = ALPHA_GRID[ALPHA_GRID.len() / 2];
    let mut best_loss = f64::INFINITY;

    for &alpha in &ALPHA_GRID {
        let mut losses = Vec::with_capacity(k);
        for fold in 0..k {
            let mut train_x = Vec::new();
            let mut train_y = Vec::new();
            let mut test_rows = Vec::new();
            for i in 0..rows {
                if folds[i] == fold {
                    test_rows.push(i);
                } else {
                    train_x.extend_from_slice(&x[i * cols..(i + 1) * cols]);
                    train_y.push(y[i]);
                }
            }
            if test_rows.is_empty()
                || !train_y.iter().any(|&l| l)
                || !train_y.iter().any(|&l| !l)
            {
                continue;
            }

            let model = fit(train_y.len(), cols, &train_x, &train_y, alpha);
            let probs: Vec<f64> = test_rows
                .iter()
                .map(|&i| model.score(&x[i * cols..(i + 1) * cols]) as f64)
                .collect();
            let labels: Vec<bool> = test_rows.iter().map(|&i| y[i]).collect();
            losses.push(log_loss(&probs, &labels));
        }

        if losses.is_empty() {
            continue;
        }
        let mean = losses.iter().sum::<f64>() / losses.len() as f64;
        if mean < best_loss {
            best_loss = mean;
            best_alpha = alpha;
        }
    }

    best_alpha
}

/// Deterministic fold labels: shuffled indices dealt round-robin.
fn fold_assignment(rows: usize, k: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rows).collect();
    let mut rng = LcgRng::new(seed);
    for i in (1..rows).rev() {
        let j = rng.next() as usize % (i + 1);
        order.swap(i, j);
    }
    let mut folds = vec![0usize; rows];
    for (position, &row) in order.iter().enumerate() {
        folds[row] = position % k.max(1);
    }
    folds
}

/// Solve `A·x = b` for symmetric positive definite `A` in place.
/// Returns `None` when the factorisation breaks down.
fn cholesky_solve(a: &mut [Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();

    // Lower-triangular factor, stored over A.
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= a[i][k] * a[j][k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                a[i][j] = sum.sqrt();
            } else {
                a[i][j] = sum / a[j][j];
            }
        }
    }

    // Forward substitution: L·z = b.
    let mut z = vec![0.0f64; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= a[i][k] * z[k];
        }
        z[i] = sum / a[i][i];
    }

    // Back substitution: Lᵀ·x = z.
    let mut x = vec![0.0f64; n];
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in (i + 1)..n {
            sum -= a[k][i] * x[k];
        }
        x[i] = sum / a[i][i];
    }

    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Distances near 0 labelled match, near 1 labelled distinct.
    fn separable_data() -> (usize, usize, Vec<f32>, Vec<bool>) {
        let x = vec![
            0.05, 0.1, //
            0.0, 0.2, //
            0.1, 0.05, //
            0.15, 0.0, //
            0.9, 0.8, //
            1.0, 0.85, //
            0.8, 0.95, //
            0.85, 1.0, //
        ];
        let y = vec![true, true, true, true, false, false, false, false];
        (8, 2, x, y)
    }

    #[test]
    fn sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn sigmoid_extremes_do_not_overflow() {
        assert!(sigmoid(1000.0) > 0.999999);
        assert!(sigmoid(-1000.0) < 0.000001);
        assert!(sigmoid(f64::MAX).is_finite());
        assert!(sigmoid(-f64::MAX).is_finite());
    }

    #[test]
    fn sigmoid_monotone() {
        assert!(sigmoid(-1.0) < sigmoid(0.0));
        assert!(sigmoid(0.0) < sigmoid(1.0));
    }

    #[test]
    fn fit_separates_classes() {
        let (rows, cols, x, y) = separable_data();
        let model = fit(rows, cols, &x, &y, 0.01);
        for i in 0..rows {
            let p = model.score(&x[i * cols..(i + 1) * cols]);
            if y[i] {
                assert!(p > 0.5, "match row {i} scored {p}");
            } else {
                assert!(p < 0.5, "distinct row {i} scored {p}");
            }
        }
    }

    #[test]
    fn fit_learns_negative_distance_weights() {
        // Larger distances mean less likely to match, so weights go negative.
        let (rows, cols, x, y) = separable_data();
        let model = fit(rows, cols, &x, &y, 0.01);
        assert!(model.weights.iter().all(|&w| w < 0.0), "{:?}", model.weights);
    }

    #[test]
    fn fit_deterministic() {
        let (rows, cols, x, y) = separable_data();
        let a = fit(rows, cols, &x, &y, 0.01);
        let b = fit(rows, cols, &x, &y, 0.01);
        assert_eq!(a, b);
    }

    #[test]
    fn stronger_regularisation_shrinks_weights() {
        let (rows, cols, x, y) = separable_data();
        let loose = fit(rows, cols, &x, &y, 0.0001);
        let tight = fit(rows, cols, &x, &y, 10.0);
        let norm = |m: &LogisticModel| m.weights.iter().map(|w| (w * w) as f64).sum::<f64>();
        assert!(norm(&tight) < norm(&loose));
    }

    #[test]
    fn log_loss_perfect_predictions_near_zero() {
        let loss = log_loss(&[0.999, 0.001], &[true, false]);
        assert!(loss < 0.01);
    }

    #[test]
    fn log_loss_wrong_predictions_large() {
        let loss = log_loss(&[0.001, 0.999], &[true, false]);
        assert!(loss > 2.0);
    }

    #[test]
    fn log_loss_empty_is_zero() {
        assert_eq!(log_loss(&[], &[]), 0.0);
    }

    #[test]
    fn grid_search_returns_candidate() {
        let (rows, cols, x, y) = separable_data();
        let alpha = grid_search_alpha(rows, cols, &x, &y, 2);
        assert!(ALPHA_GRID.contains(&alpha));
    }

    #[test]
    fn fold_assignment_covers_all_folds() {
        let folds = fold_assignment(20, 4, 1);
        assert_eq!(folds.len(), 20);
        for fold in 0..4 {
            assert!(folds.iter().any(|&f| f == fold));
        }
        assert!(folds.iter().all(|&f| f < 4));
    }

    #[test]
    fn fold_assignment_deterministic() {
        assert_eq!(fold_assignment(15, 3, 7), fold_assignment(15, 3, 7));
    }

    #[test]
    fn cholesky_solves_identity() {
        let mut a = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let x = cholesky_solve(&mut a, &[3.0, -2.0]).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-12);
        assert!((x[1] + 2.0).abs() < 1e-12);
    }

    #[test]
    fn cholesky_solves_spd_system() {
        // A = [[4,2],[2,3]], b = [10, 8] -> x = [1.75, 1.5]
        let mut a = vec![vec![4.0, 2.0], vec![2.0, 3.0]];
        let x = cholesky_solve(&mut a, &[10.0, 8.0]).unwrap();
        assert!((x[0] - 1.75).abs() < 1e-10);
        assert!((x[1] - 1.5).abs() < 1e-10);
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let mut a = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        assert!(cholesky_solve(&mut a, &[1.0, 1.0]).is_none());
    }
}
