//! Dense normal equations for Jacobians with parameters along rows.
//!
//! With `J` of shape `(nparams, npixels)`:
//! - `JTJ = J·Jᵗ`
//! - `grad = J·r`
//! - the damped step solves `(JTJ + damp·diag(JTJ))·delta = -grad`
//!
//! Solves never fail on singular input. Singular values below `min_eigval · σ_max` are treated as
//! zero, which keeps flat directions out of the step.

use crate::linalg::{LinAlgError, LinAlgResult, LinearSolverType};
use faer::Mat;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

const MAX_DECOMPOSITION_ITERATIONS: usize = 10_000;

/// Normal matrix `J·Jᵗ`.
pub fn jtj(j: &Mat<f64>) -> DMatrix<f64> {
    let product = j.as_ref() * j.as_ref().transpose();
    DMatrix::from_fn(product.nrows(), product.ncols(), |r, c| product[(r, c)])
}

/// Gradient `J·r` at the sampled pixels.
pub fn gradient(j: &Mat<f64>, residuals: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
    if j.ncols() != residuals.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "J has {} columns but {} residuals were given",
            j.ncols(),
            residuals.len()
        ))
        .log());
    }
    let r = Mat::from_fn(residuals.len(), 1, |i, _| residuals[i]);
    let g = j.as_ref() * r.as_ref();
    Ok(DVector::from_fn(g.nrows(), |i, _| g[(i, 0)]))
}

/// Damped matrix `JTJ + damp·diag(JTJ)`.
pub fn damped(jtj: &DMatrix<f64>, damp: f64) -> DMatrix<f64> {
    let mut a = jtj.clone();
    for i in 0..a.nrows() {
        a[(i, i)] += damp * jtj[(i, i)];
    }
    a
}

/// Solution of a damped system together with the effective rank used.
#[derive(Debug, Clone, PartialEq)]
pub struct LmStep {
    pub delta: DVector<f64>,
    pub rank: usize,
}

impl LmStep {
    fn zeros(n: usize) -> Self {
        Self {
            delta: DVector::zeros(n),
            rank: 0,
        }
    }
}

/// Least-squares solution of `a·x = b`, discarding singular values below `rcond · σ_max`.
pub fn lstsq(a: &DMatrix<f64>, b: &DVector<f64>, rcond: f64) -> LinAlgResult<LmStep> {
    let n = a.ncols();
    if a.nrows() == 0 || n == 0 {
        return Ok(LmStep::zeros(n));
    }
    if a.nrows() != b.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "matrix has {} rows but right-hand side has {} entries",
            a.nrows(),
            b.len()
        ))
        .log());
    }
    let svd = a
        .clone()
        .try_svd(true, true, f64::EPSILON, MAX_DECOMPOSITION_ITERATIONS)
        .ok_or_else(|| {
            LinAlgError::FactorizationFailed("SVD did not converge".to_string()).log()
        })?;
    let sigma_max = svd.singular_values.max();
    if !(sigma_max > 0.0) {
        return Ok(LmStep::zeros(n));
    }
    let cutoff = rcond * sigma_max;
    let rank = svd.singular_values.iter().filter(|&&s| s > cutoff).count();
    let delta = svd.solve(b, cutoff).map_err(|e| {
        LinAlgError::FactorizationFailed("SVD solve failed".to_string()).log_with_source(e)
    })?;
    Ok(LmStep { delta, rank })
}

/// Solver for `(JTJ + damp·diag(JTJ))·delta = -grad`.
#[derive(Debug, Clone)]
pub struct NormalEquationsSolver {
    pub solver_type: LinearSolverType,
    /// Relative singular-value cutoff
    pub min_eigval: f64,
}

impl Default for NormalEquationsSolver {
    fn default() -> Self {
        Self {
            solver_type: LinearSolverType::default(),
            min_eigval: 1e-12,
        }
    }
}

impl NormalEquationsSolver {
    pub fn new(solver_type: LinearSolverType, min_eigval: f64) -> Self {
        Self {
            solver_type,
            min_eigval,
        }
    }

    /// Damped Levenberg-Marquardt step.
    pub fn solve(
        &self,
        jtj: &DMatrix<f64>,
        grad: &DVector<f64>,
        damp: f64,
    ) -> LinAlgResult<LmStep> {
        let a = damped(jtj, damp);
        let rhs = -grad;
        match self.solver_type {
            LinearSolverType::SvdLeastSquares => lstsq(&a, &rhs, self.min_eigval),
            LinearSolverType::Cholesky => {
                if a.nrows() == 0 {
                    return Ok(LmStep::zeros(0));
                }
                match a.clone().cholesky() {
                    Some(chol) => Ok(LmStep {
                        delta: chol.solve(&rhs),
                        rank: a.nrows(),
                    }),
                    None => {
                        debug!("Damped matrix not positive definite, falling back to SVD");
                        lstsq(&a, &rhs, self.min_eigval)
                    }
                }
            }
        }
    }
}

/// Symmetric eigendecomposition with eigenvalues in ascending order.
#[derive(Debug, Clone)]
pub struct SortedEigen {
    pub eigenvalues: DVector<f64>,
    /// Eigenvectors as columns, matching `eigenvalues`
    pub eigenvectors: DMatrix<f64>,
}

impl SortedEigen {
    pub fn new(m: &DMatrix<f64>) -> LinAlgResult<Self> {
        let n = m.nrows();
        let eig = nalgebra::SymmetricEigen::try_new(
            m.clone(),
            f64::EPSILON,
            MAX_DECOMPOSITION_ITERATIONS,
        )
        .ok_or_else(|| {
            LinAlgError::FactorizationFailed("eigendecomposition did not converge".to_string())
                .log()
        })?;
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
        Ok(Self {
            eigenvalues: DVector::from_fn(n, |i, _| eig.eigenvalues[order[i]]),
            eigenvectors: DMatrix::from_fn(n, n, |r, c| eig.eigenvectors[(r, order[c])]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn line_fit_jacobian() -> (Mat<f64>, DVector<f64>) {
        // Residuals r = y - (a·x + b) at x = 0..5, y = 2x + 1, starting from a = b = 0.
        // d r / d a = -x, d r / d b = -1.
        let xs: Vec<f64> = (0..6).map(|x| x as f64).collect();
        let j = Mat::from_fn(2, xs.len(), |r, c| if r == 0 { -xs[c] } else { -1.0 });
        let r = DVector::from_iterator(xs.len(), xs.iter().map(|x| 2.0 * x + 1.0));
        (j, r)
    }

    #[test]
    fn test_zero_damping_is_ordinary_least_squares() -> TestResult {
        let (j, r) = line_fit_jacobian();
        let step = NormalEquationsSolver::default().solve(&jtj(&j), &gradient(&j, &r)?, 0.0)?;
        assert_eq!(step.rank, 2);
        assert!((step.delta[0] - 2.0).abs() < 1e-10);
        assert!((step.delta[1] - 1.0).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_cholesky_matches_svd() -> TestResult {
        let (j, r) = line_fit_jacobian();
        let (a, g) = (jtj(&j), gradient(&j, &r)?);
        let svd = NormalEquationsSolver::default().solve(&a, &g, 0.3)?;
        let chol = NormalEquationsSolver::new(LinearSolverType::Cholesky, 1e-12).solve(&a, &g, 0.3)?;
        assert!((svd.delta - chol.delta).amax() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_damping_shrinks_step() -> TestResult {
        // Equal diagonal, so diag scaling is isotropic and the step norm falls monotonically.
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 4.0]);
        let g = DVector::from_vec(vec![1.0, -2.0]);
        let solver = NormalEquationsSolver::default();
        let mut last = f64::INFINITY;
        for damp in [0.0, 0.1, 1.0, 10.0, 100.0] {
            let norm = solver.solve(&a, &g, damp)?.delta.norm();
            assert!(norm < last, "damping {damp} did not shrink the step");
            last = norm;
        }
        Ok(())
    }

    #[test]
    fn test_singular_matrix_is_cut_off() -> TestResult {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DVector::from_vec(vec![2.0, 2.0]);
        let step = lstsq(&a, &b, 1e-12)?;
        assert_eq!(step.rank, 1);
        // Minimum-norm solution.
        assert!((step.delta[0] - 1.0).abs() < 1e-10);
        assert!((step.delta[1] - 1.0).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_empty_system() -> TestResult {
        let j = Mat::<f64>::zeros(0, 10);
        let step =
            NormalEquationsSolver::default().solve(&jtj(&j), &DVector::zeros(0), 1.0)?;
        assert_eq!(step.delta.len(), 0);
        assert_eq!(step.rank, 0);
        Ok(())
    }

    #[test]
    fn test_sorted_eigen_ascending() -> TestResult {
        let m = DMatrix::from_row_slice(3, 3, &[5.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 3.0]);
        let eig = SortedEigen::new(&m)?;
        assert_eq!(eig.eigenvalues.as_slice().len(), 3);
        assert!((eig.eigenvalues[0] - 1.0).abs() < 1e-12);
        assert!((eig.eigenvalues[2] - 5.0).abs() < 1e-12);
        assert!((eig.eigenvectors[(0, 2)].abs() - 1.0).abs() < 1e-12);
        Ok(())
    }
}
