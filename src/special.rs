//! Numerically stable scalar primitives for log-space dynamic programming.
//!
//! All recursions in this crate run in the log semiring, where
//! \(a \oplus b = \log(e^a + e^b)\) and \(a \otimes b = a + b\).
//! The additive identity is \(-\infty\).

/// Finite stand-in for \(\log 0\) used by [`safe_log`].
pub const LOG_ZERO_FLOOR: f64 = -1e5;

/// Stable \(\log \sum_i e^{x_i}\).
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let mut m = f64::NEG_INFINITY;
    for &x in xs {
        if x > m {
            m = x;
        }
    }
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if m == f64::INFINITY {
        return f64::INFINITY;
    }
    let mut s = 0.0;
    for &x in xs {
        s += (x - m).exp();
    }
    m + s.ln()
}

/// `ln(x)` for positive `x`, [`LOG_ZERO_FLOOR`] otherwise.
///
/// Keeps `0 * safe_log(0)` at zero instead of NaN.
pub fn safe_log(x: f64) -> f64 {
    if x > 0.0 {
        x.ln().max(LOG_ZERO_FLOOR)
    } else {
        LOG_ZERO_FLOOR
    }
}

/// `p * theta`, treating `p == 0` as an exact zero even when `theta` is infinite.
pub fn mul_finite(p: f64, theta: f64) -> f64 {
    if p == 0.0 {
        0.0
    } else {
        p * theta
    }
}
