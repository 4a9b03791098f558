//! Realized return of a trade from its cashflows and trade price.
//!
//! Two measures are supported:
//!
//! - **Holding return**: `sum(amounts) / price - 1` over the trade's life.
//! - **Annualized return**: the continuously compounded rate `r` minimizing
//!   `0.5 * (Σ amounts[i]·exp(-r·t[i]) − price)²`, found with a bounded Brent
//!   minimizer on `[lower, upper]` (default `[-1, 5]`).
//!
//! The annualized measure reports `None` when the minimizer does not converge
//! or the best rate inside the bracket leaves a residual above tolerance
//! (no root in the bracket, or a flat loss surface). `None` is distinct from a
//! legitimate return of zero.

use crate::error::{BacktestError, Result};
use serde::{Deserialize, Serialize};

/// Return solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Lower end of the rate search bracket.
    #[serde(default = "default_lower")]
    pub lower: f64,
    /// Upper end of the rate search bracket.
    #[serde(default = "default_upper")]
    pub upper: f64,
    /// Absolute tolerance on the rate.
    #[serde(default = "default_x_tolerance")]
    pub x_tolerance: f64,
    /// Accepted `|pv - price|`, relative to `max(|price|, 1)`.
    #[serde(default = "default_residual_tolerance")]
    pub residual_tolerance: f64,
    /// Maximum minimizer iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_lower() -> f64 { -1.0 }
fn default_upper() -> f64 { 5.0 }
fn default_x_tolerance() -> f64 { 1e-10 }
fn default_residual_tolerance() -> f64 { 1e-6 }
fn default_max_iterations() -> usize { 500 }

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            lower: default_lower(),
            upper: default_upper(),
            x_tolerance: default_x_tolerance(),
            residual_tolerance: default_residual_tolerance(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl SolverConfig {
    /// Check the bracket and tolerances.
    pub fn validate(&self) -> Result<()> {
        if !(self.lower.is_finite() && self.upper.is_finite() && self.lower < self.upper) {
            return Err(BacktestError::ConfigError(format!(
                "Solver bracket [{}, {}] is invalid",
                self.lower, self.upper
            )));
        }
        if self.x_tolerance <= 0.0 || self.residual_tolerance <= 0.0 || self.max_iterations == 0 {
            return Err(BacktestError::ConfigError(
                "Solver tolerances and iteration limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a scalar minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Minimum {
    pub x: f64,
    pub fun: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Bounded Brent minimization (golden section with parabolic interpolation)
/// of `f` on `[lower, upper]`.
pub fn minimize_bounded<F>(
    mut f: F,
    lower: f64,
    upper: f64,
    x_tolerance: f64,
    max_iterations: usize,
) -> Minimum
where
    F: FnMut(f64) -> f64,
{
    let golden_mean = 0.5 * (3.0 - 5.0_f64.sqrt());
    let sqrt_eps = f64::EPSILON.sqrt();

    let (mut a, mut b) = (lower, upper);
    let mut fulc = a + golden_mean * (b - a);
    let (mut nfc, mut xf) = (fulc, fulc);
    let (mut rat, mut e) = (0.0_f64, 0.0_f64);
    let mut fx = f(xf);
    let (mut ffulc, mut fnfc) = (fx, fx);
    let mut xm = 0.5 * (a + b);
    let mut tol1 = sqrt_eps * xf.abs() + x_tolerance / 3.0;
    let mut tol2 = 2.0 * tol1;

    let mut iterations = 0;
    let mut converged = true;

    while (xf - xm).abs() > tol2 - 0.5 * (b - a) {
        if iterations >= max_iterations {
            converged = false;
            break;
        }
        iterations += 1;

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
                // Parabolic step
                rat = p / q;
                let x = xf + rat;
                if (x - a) < tol2 || (b - x) < tol2 {
                    rat = if xm - xf >= 0.0 { tol1 } else { -tol1 };
                }
            } else {
                golden = true;
            }
        }

        if golden {
            e = if xf >= xm { a - xf } else { b - xf };
            rat = golden_mean * e;
        }

        let sign = if rat >= 0.0 { 1.0 } else { -1.0 };
        let x = xf + sign * rat.abs().max(tol1);
        let fu = f(x);

        if fu <= fx {
            if x >= xf {
                a = xf;
            } else {
                b = xf;
            }
            (fulc, ffulc) = (nfc, fnfc);
            (nfc, fnfc) = (xf, fx);
            (xf, fx) = (x, fu);
        } else {
            if x < xf {
                a = x;
            } else {
                b = x;
            }
            if fu <= fnfc || nfc == xf {
                (fulc, ffulc) = (nfc, fnfc);
                (nfc, fnfc) = (x, fu);
            } else if fu <= ffulc || fulc == xf || fulc == nfc {
                (fulc, ffulc) = (x, fu);
            }
        }

        xm = 0.5 * (a + b);
        tol1 = sqrt_eps * xf.abs() + x_tolerance / 3.0;
        tol2 = 2.0 * tol1;
    }

    Minimum {
        x: xf,
        fun: fx,
        iterations,
        converged: converged && fx.is_finite(),
    }
}

/// Present value of `amounts` at times `year_fractions` under continuous
/// compounding at `rate`.
pub fn present_value(rate: f64, amounts: &[f64], year_fractions: &[f64]) -> f64 {
    amounts
        .iter()
        .zip(year_fractions)
        .map(|(a, t)| a * (-rate * t).exp())
        .sum()
}

/// Least-squares pricing error of `rate`.
#[inline]
pub fn irr_loss(rate: f64, amounts: &[f64], year_fractions: &[f64], price: f64) -> f64 {
    let err = present_value(rate, amounts, year_fractions) - price;
    0.5 * err * err
}

/// Holding return `sum(amounts) / price - 1`.
pub fn holding_return(amounts: &[f64], price: f64) -> Result<f64> {
    if price == 0.0 {
        return Err(BacktestError::DivisionByZero);
    }
    Ok(amounts.iter().sum::<f64>() / price - 1.0)
}

/// Continuously compounded rate equating discounted cashflows with `price`.
pub fn annualized_return(
    amounts: &[f64],
    year_fractions: &[f64],
    price: f64,
    config: &SolverConfig,
) -> Result<Option<f64>> {
    check_lengths(amounts, year_fractions)?;
    if price == 0.0 {
        return Err(BacktestError::DivisionByZero);
    }
    if amounts.is_empty() {
        return Ok(None);
    }

    let min = minimize_bounded(
        |r| irr_loss(r, amounts, year_fractions, price),
        config.lower,
        config.upper,
        config.x_tolerance,
        config.max_iterations,
    );

    let residual = (present_value(min.x, amounts, year_fractions) - price).abs();
    if min.converged && residual <= config.residual_tolerance * price.abs().max(1.0) {
        Ok(Some(min.x))
    } else {
        Ok(None)
    }
}

/// Realized return: holding return when `annualized` is false, otherwise the
/// annualized rate (`None` on non-convergence).
pub fn compute_return(
    amounts: &[f64],
    year_fractions: &[f64],
    price: f64,
    annualized: bool,
    config: &SolverConfig,
) -> Result<Option<f64>> {
    check_lengths(amounts, year_fractions)?;
    if annualized {
        annualized_return(amounts, year_fractions, price, config)
    } else {
        holding_return(amounts, price).map(Some)
    }
}

fn check_lengths(amounts: &[f64], year_fractions: &[f64]) -> Result<()> {
    if amounts.len() != year_fractions.len() {
        return Err(BacktestError::InvalidInput(format!(
            "{} amounts but {} year fractions",
            amounts.len(),
            year_fractions.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holding_return() {
        let r = compute_return(&[50.0, 1050.0], &[0.5, 1.0], 1000.0, false, &SolverConfig::default())
            .unwrap()
            .unwrap();
        assert!((r - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_holding_return_zero_price() {
        let err = compute_return(&[1.0], &[1.0], 0.0, false, &SolverConfig::default()).unwrap_err();
        assert!(matches!(err, BacktestError::DivisionByZero));
    }

    #[test]
    fn test_annualized_single_cashflow() {
        let r = compute_return(&[1100.0], &[1.0], 1000.0, true, &SolverConfig::default())
            .unwrap()
            .unwrap();
        assert!((r - 1.1_f64.ln()).abs() < 1e-6, "got {}", r);
    }

    #[test]
    fn test_annualized_multiple_cashflows() {
        // Price a two-cashflow bond at 4% and recover the rate
        let amounts = [4.0, 104.0];
        let times = [1.0, 2.0];
        let price = present_value(0.04, &amounts, &times);

        let r = annualized_return(&amounts, &times, price, &SolverConfig::default())
            .unwrap()
            .unwrap();
        assert!((r - 0.04).abs() < 1e-6);
    }

    #[test]
    fn test_annualized_negative_rate() {
        let r = annualized_return(&[90.0], &[1.0], 100.0, &SolverConfig::default())
            .unwrap()
            .unwrap();
        assert!((r - 0.9_f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_annualized_zero_return_is_some() {
        let r = annualized_return(&[100.0], &[0.5], 100.0, &SolverConfig::default())
            .unwrap();
        assert!(matches!(r, Some(v) if v.abs() < 1e-6));
    }

    #[test]
    fn test_annualized_no_root_in_bracket() {
        // Zero cashflows can never match a positive price
        let r = annualized_return(&[0.0, 0.0], &[0.5, 1.0], 100.0, &SolverConfig::default())
            .unwrap();
        assert!(r.is_none());

        // Required rate far outside [-1, 5]
        let r = annualized_return(&[1e-9], &[1.0], 100.0, &SolverConfig::default()).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn test_annualized_empty_cashflows() {
        let r = annualized_return(&[], &[], 100.0, &SolverConfig::default()).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn test_length_mismatch() {
        let err = compute_return(&[1.0, 2.0], &[1.0], 1.0, false, &SolverConfig::default()).unwrap_err();
        assert!(matches!(err, BacktestError::InvalidInput(_)));
    }

    #[test]
    fn test_minimize_bounded_quadratic() {
        let min = minimize_bounded(|x| (x - 1.5).powi(2), -1.0, 5.0, 1e-10, 500);
        assert!(min.converged);
        assert!((min.x - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_minimize_bounded_iteration_limit() {
        let min = minimize_bounded(|x| (x - 1.5).powi(2), -1.0, 5.0, 1e-12, 2);
        assert!(!min.converged);
        assert_eq!(min.iterations, 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(SolverConfig::default().validate().is_ok());
        let bad = SolverConfig {
            lower: 1.0,
            upper: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
