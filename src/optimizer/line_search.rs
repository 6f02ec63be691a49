//! One-dimensional minimization along a parameter-space direction.
//!
//! [`line_minimize`] brackets a minimum of `f(x)` starting from `x ∈ {-2, 0, 2}` and refines it
//! with Brent's method. [`do_line_min`] applies it to a state along `p0 + x·direction`.

use crate::core::{ImageState, ParameterBlock};
use crate::error::VoxfitResult;
use crate::optimizer::OptimizerError;
use nalgebra::DVector;
use tracing::{debug, warn};

/// Relative tolerance of Brent's method.
pub const BRENT_TOL: f64 = 1.48e-8;

/// Bracket growth factor on the falling side.
const EXPANSION_FACTOR: f64 = 3.0;

/// Growth steps allowed before giving up on a falling profile.
pub const MAX_EXPANSIONS: usize = 30;

const GOLDEN: f64 = 0.381_966_0;
const MIN_TOL: f64 = 1.0e-11;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentResult {
    /// Abscissa of the minimum
    pub x: f64,
    /// Function value at `x`
    pub fx: f64,
    /// Brent iterations used
    pub iterations: usize,
    /// Function evaluations, including bracketing
    pub evaluations: usize,
}

/// Brent's method on a bracket `(a, b, c)` with `a < b < c` (or reversed) and
/// `f(b) < min(f(a), f(c))`.
///
/// `fb` is `f(b)`. Stops after `maxiter` iterations or when the bracket is within `tol` of `x`.
pub fn brent<F, E>(
    mut f: F,
    bracket: (f64, f64, f64),
    fb: f64,
    maxiter: usize,
    tol: f64,
) -> Result<BrentResult, E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let (xa, xb, xc) = bracket;
    let (mut a, mut b) = if xa < xc { (xa, xc) } else { (xc, xa) };
    let (mut x, mut w, mut v) = (xb, xb, xb);
    let (mut fx, mut fw, mut fv) = (fb, fb, fb);
    let mut deltax: f64 = 0.0;
    let mut rat: f64 = 0.0;
    let mut iterations = 0;
    let mut evaluations = 0;

    while iterations < maxiter {
        let tol1 = tol * x.abs() + MIN_TOL;
        let tol2 = 2.0 * tol1;
        let xmid = 0.5 * (a + b);
        if (x - xmid).abs() < tol2 - 0.5 * (b - a) {
            break;
        }

        let golden = |x: f64, a: f64, b: f64| {
            let d = if x >= xmid { a - x } else { b - x };
            (d, GOLDEN * d)
        };
        if deltax.abs() <= tol1 {
            (deltax, rat) = golden(x, a, b);
        } else {
            // Parabola through (x, fx), (w, fw), (v, fv).
            let tmp1 = (x - w) * (fx - fv);
            let mut tmp2 = (x - v) * (fx - fw);
            let mut p = (x - v) * tmp2 - (x - w) * tmp1;
            tmp2 = 2.0 * (tmp2 - tmp1);
            if tmp2 > 0.0 {
                p = -p;
            }
            tmp2 = tmp2.abs();
            let dx_temp = deltax;
            deltax = rat;
            if p > tmp2 * (a - x) && p < tmp2 * (b - x) && p.abs() < (0.5 * tmp2 * dx_temp).abs()
            {
                rat = p / tmp2;
                let u = x + rat;
                if (u - a) < tol2 || (b - u) < tol2 {
                    rat = if xmid - x >= 0.0 { tol1 } else { -tol1 };
                }
            } else {
                (deltax, rat) = golden(x, a, b);
            }
        }

        let u = if rat.abs() < tol1 {
            if rat >= 0.0 { x + tol1 } else { x - tol1 }
        } else {
            x + rat
        };
        let fu = f(u)?;
        evaluations += 1;

        if fu > fx {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                (v, fv) = (w, fw);
                (w, fw) = (u, fu);
            } else if fu <= fv || v == x || v == w {
                (v, fv) = (u, fu);
            }
        } else {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            (v, fv) = (w, fw);
            (w, fw) = (x, fx);
            (x, fx) = (u, fu);
        }
        iterations += 1;
    }

    Ok(BrentResult {
        x,
        fx,
        iterations,
        evaluations,
    })
}

/// Minimize `f` along the real line starting from the points `-2, 2, 0`.
///
/// If the center is not below both ends, the bracket grows by a factor of 3 on the lower side
/// while each new point keeps falling (at most [`MAX_EXPANSIONS`] times), and the last three
/// points form the bracket. Brent's method then refines it with at most `maxiter` iterations.
/// When no strict bracket was found the best point is returned as is.
pub fn line_minimize<F, E>(mut f: F, maxiter: usize) -> Result<BrentResult, E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let f_lo = f(-2.0)?;
    let f_hi = f(2.0)?;
    let f_center = f(0.0)?;
    let mut evaluations = 3;
    let mut points = vec![(-2.0, f_lo), (2.0, f_hi), (0.0, f_center)];

    // (x, f(x)) of the outer, middle and inner bracket points.
    let (outer, mid, inner) = if f_center > f_lo.min(f_hi) {
        let mut inner = (0.0, f_center);
        let mut mid = if f_lo < f_hi { (-2.0, f_lo) } else { (2.0, f_hi) };
        let mut expansions = 0;
        let outer = loop {
            let far = mid.0 * EXPANSION_FACTOR;
            let f_far = f(far)?;
            evaluations += 1;
            expansions += 1;
            points.push((far, f_far));
            if !(f_far < mid.1) {
                break (far, f_far);
            }
            if expansions >= MAX_EXPANSIONS {
                warn!(
                    "Line search still falling at x = {:.3e} after {} expansions",
                    far, expansions
                );
                break (far, f_far);
            }
            inner = mid;
            mid = (far, f_far);
        };
        debug!("Expanded line search bracket to x = {:.3e}", outer.0);
        (outer, mid, inner)
    } else {
        ((-2.0, f_lo), (0.0, f_center), (2.0, f_hi))
    };

    if !(mid.1 < outer.1 && mid.1 < inner.1) {
        let (x, fx) = points
            .iter()
            .copied()
            .fold((0.0, f_center), |best, p| if p.1 < best.1 { p } else { best });
        debug!("No strict bracket, taking best point x = {:.3e}", x);
        return Ok(BrentResult {
            x,
            fx,
            iterations: 0,
            evaluations,
        });
    }

    let mut result = brent(f, (outer.0, mid.0, inner.0), mid.1, maxiter, BRENT_TOL)?;
    result.evaluations += evaluations;
    Ok(result)
}

/// Line-minimize the global error along `p0 + x·direction` over `block`.
///
/// Leaves the state at the minimum. Fails with [`OptimizerError::LineSearchFailure`] (after
/// restoring the starting state) when the minimum is worse than the error before the search.
pub fn do_line_min<S: ImageState + ?Sized>(
    state: &mut S,
    block: &ParameterBlock,
    direction: &DVector<f64>,
    maxiter: usize,
) -> VoxfitResult<BrentResult> {
    let start_err = state.error();
    let snapshot = state.snapshot();
    let p0 = state.block_values(block);

    let result = line_minimize(
        |x| -> VoxfitResult<f64> {
            state.set_parameters(block, &(&p0 + direction * x))?;
            Ok(state.error())
        },
        maxiter,
    )?;

    if result.fx <= start_err {
        state.set_parameters(block, &(&p0 + direction * result.x))?;
        debug!(
            "Line search: x = {:.4e}, error {:.6e} -> {:.6e} in {} evaluations",
            result.x, start_err, result.fx, result.evaluations
        );
        Ok(result)
    } else {
        state.restore(&snapshot)?;
        Err(OptimizerError::LineSearchFailure {
            start: start_err,
            best: result.fx,
        }
        .log()
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ParamCategory;
    use crate::synthetic::{SyntheticModel, SyntheticState};
    use std::convert::Infallible;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_brent_finds_convex_minimum() -> TestResult {
        let f = |x: f64| -> Result<f64, Infallible> { Ok((x - 1.3).powi(2) + 0.5) };
        let result = line_minimize(f, 10)?;
        assert!((result.x - 1.3).abs() < 1e-4, "x = {}", result.x);
        assert!((result.fx - 0.5).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_brent_on_explicit_bracket() -> TestResult {
        let f = |x: f64| -> Result<f64, Infallible> { Ok((x - 0.4).powi(2)) };
        let result = brent(f, (-1.0, 0.0, 2.0), 0.16, 50, BRENT_TOL)?;
        assert!((result.x - 0.4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_bracket_expands_toward_far_minimum() -> TestResult {
        let f = |x: f64| -> Result<f64, Infallible> { Ok((x + 10.0).powi(2)) };
        let result = line_minimize(f, 30)?;
        assert!((result.x + 10.0).abs() < 1e-3, "x = {}", result.x);
        Ok(())
    }

    #[test]
    fn test_flat_profile_returns_center() -> TestResult {
        let f = |_: f64| -> Result<f64, Infallible> { Ok(1.0) };
        let result = line_minimize(f, 10)?;
        assert_eq!(result.x, 0.0);
        Ok(())
    }

    #[test]
    fn test_line_min_moves_state_to_minimum() -> TestResult {
        let truth = SyntheticModel::new([10, 10, 10]).with_offset(0.5);
        let mut state = SyntheticState::new(truth.render(), truth.clone().with_offset(0.0))?;
        let block = state.layout().block(ParamCategory::Off)?;
        // Minimum at x = 1.3 along a direction of 0.5 / 1.3.
        let direction = DVector::from_element(1, 0.5 / 1.3);
        let result = do_line_min(&mut state, &block, &direction, 10)?;
        assert!((result.x - 1.3).abs() < 1e-4);
        assert!((state.block_values(&block)[0] - 0.5).abs() < 1e-4);
        assert!(state.error() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_zero_direction_keeps_state() -> TestResult {
        let truth = SyntheticModel::new([8, 8, 8]);
        let mut state = SyntheticState::new(truth.render(), truth)?;
        let block = state.layout().block(ParamCategory::Off)?;
        let flat = do_line_min(&mut state, &block, &DVector::zeros(1), 5)?;
        assert_eq!(flat.x, 0.0);
        assert!(state.error() < 1e-20);
        Ok(())
    }
}
