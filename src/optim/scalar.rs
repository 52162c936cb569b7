//! Bounded scalar minimization (Brent's method)
//!
//! Golden-section search accelerated by parabolic interpolation, restricted
//! to a closed interval. Terminates once the bracket is within `xatol` of
//! the incumbent or after `maxiter` function evaluations.

use anyhow::Result;

/// Default absolute tolerance on `x`
pub const DEFAULT_XATOL: f64 = 1e-5;

/// Outcome of [`minimize_scalar_bounded`]
#[derive(Debug, Clone)]
pub struct ScalarResult {
    pub x: f64,
    pub fun: f64,
    /// Number of function evaluations
    pub nfev: usize,
    /// False when the evaluation budget ran out or a NaN was produced
    pub success: bool,
    pub message: String,
}

/// Minimize `f` on `[a, b]`
pub fn minimize_scalar_bounded<F>(
    mut f: F,
    bounds: (f64, f64),
    maxiter: usize,
    xatol: f64,
) -> Result<ScalarResult>
where
    F: FnMut(f64) -> Result<f64>,
{
    let (mut a, mut b) = bounds;
    anyhow::ensure!(
        a.is_finite() && b.is_finite(),
        "bounds must be finite, got [{a}, {b}]"
    );
    anyhow::ensure!(a <= b, "lower bound {a} exceeds upper bound {b}");
    anyhow::ensure!(maxiter > 0, "maxiter must be positive");

    let sqrt_eps = f64::EPSILON.sqrt();
    let golden_mean = 0.5 * (3.0 - 5f64.sqrt());

    let mut fulc = a + golden_mean * (b - a);
    let mut nfc = fulc;
    let mut xf = fulc;
    let mut rat: f64 = 0.0;
    let mut e: f64 = 0.0;
    let mut fx = f(xf)?;
    let mut num = 1;
    let mut fu = f64::INFINITY;
    let mut ffulc = fx;
    let mut fnfc = fx;
    let mut xm = 0.5 * (a + b);
    let mut tol1 = sqrt_eps * xf.abs() + xatol / 3.0;
    let mut tol2 = 2.0 * tol1;
    let mut exhausted = false;

    while (xf - xm).abs() > tol2 - 0.5 * (b - a) {
        let mut golden = true;

        if e.abs() > tol1 {
            golden = false;
            let mut r = (xf - nfc) * (fx - ffulc);
            let mut q = (xf - fulc) * (fx - fnfc);
            let mut p = (xf - fulc) * q - (xf - nfc) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            r = e;
            e = rat;

            if p.abs() < (0.5 * q * r).abs() && p > q * (a - xf) && p < q * (b - xf) {
                // parabolic step
                rat = p / q;
                let x = xf + rat;
                if (x - a) < tol2 || (b - x) < tol2 {
                    rat = tol1 * sign_or_one(xm - xf);
                }
            } else {
                golden = true;
            }
        }

        if golden {
            e = if xf >= xm { a - xf } else { b - xf };
            rat = golden_mean * e;
        }

        let x = xf + sign_or_one(rat) * rat.abs().max(tol1);
        fu = f(x)?;
        num += 1;

        if fu <= fx {
            if x >= xf {
                a = xf;
            } else {
                b = xf;
            }
            fulc = nfc;
            ffulc = fnfc;
            nfc = xf;
            fnfc = fx;
            xf = x;
            fx = fu;
        } else {
            if x < xf {
                a = x;
            } else {
                b = x;
            }
            if fu <= fnfc || nfc == xf {
                fulc = nfc;
                ffulc = fnfc;
                nfc = x;
                fnfc = fu;
            } else if fu <= ffulc || fulc == xf || fulc == nfc {
                fulc = x;
                ffulc = fu;
            }
        }

        xm = 0.5 * (a + b);
        tol1 = sqrt_eps * xf.abs() + xatol / 3.0;
        tol2 = 2.0 * tol1;

        if num >= maxiter {
            exhausted = true;
            break;
        }
    }

    let (success, message) = if xf.is_nan() || fx.is_nan() || fu.is_nan() {
        (false, "NaN result encountered.".to_string())
    } else if exhausted {
        (false, "Maximum number of function calls reached.".to_string())
    } else {
        (true, "Solution found.".to_string())
    };

    Ok(ScalarResult {
        x: xf,
        fun: fx,
        nfev: num,
        success,
        message,
    })
}

/// `sign(v)`, with 0 mapped to 1
fn sign_or_one(v: f64) -> f64 {
    if v < 0.0 {
        -1.0
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_minimum() {
        let res = minimize_scalar_bounded(|x| Ok((x - 0.3).powi(2)), (0.0, 1.0), 100, DEFAULT_XATOL).unwrap();
        assert!(res.success, "{}", res.message);
        assert!((res.x - 0.3).abs() < 1e-4);
        assert!(res.fun < 1e-8);
    }

    #[test]
    fn test_minimum_at_bound() {
        let res = minimize_scalar_bounded(|x| Ok(x), (2.0, 5.0), 200, DEFAULT_XATOL).unwrap();
        assert!(res.success);
        assert!(res.x - 2.0 < 1e-3);
        assert!(res.x >= 2.0);
    }

    #[test]
    fn test_budget_exhaustion_reports_failure() {
        let res = minimize_scalar_bounded(|x| Ok((x - 0.7).powi(2)), (0.0, 1.0), 3, DEFAULT_XATOL).unwrap();
        assert!(!res.success);
        assert_eq!(res.nfev, 3);
    }

    #[test]
    fn test_step_function_terminates() {
        let res = minimize_scalar_bounded(
            |x| Ok(if x > 0.42 { -1.0 } else { 0.0 }),
            (0.0, 1.0),
            100,
            DEFAULT_XATOL,
        )
        .unwrap();
        assert!(res.nfev <= 100);
        assert!(res.x >= 0.0 && res.x <= 1.0);
    }

    #[test]
    fn test_errors_propagate() {
        let res = minimize_scalar_bounded(|_| anyhow::bail!("boom"), (0.0, 1.0), 10, DEFAULT_XATOL);
        assert!(res.is_err());
        assert!(minimize_scalar_bounded(|x| Ok(x), (1.0, 0.0), 10, DEFAULT_XATOL).is_err());
    }
}
