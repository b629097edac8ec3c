//! Maximum-weight perfect bipartite matching (the linear assignment problem).
//!
//! Given a square weight matrix \(W\), find a permutation \(\sigma\) maximizing
//! \(\sum_i W_{i,\sigma(i)}\). Extreme weights carry meaning:
//!
//! - `+inf` forces the pair `(i, j)` into the matching;
//! - `-inf` forbids it.
//!
//! Forced pairs are fixed up front. The remaining free block is solved with the
//! shortest-augmenting-path Hungarian algorithm (Kuhn–Munkres with potentials,
//! \(O(n^3)\)) on finite costs, where forbidden cells are priced above any matching
//! that avoids them.

use ndarray::ArrayView2;

/// Errors for the assignment solver.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Perfect matching needs a square matrix.
    #[error("weight matrix must be square, got {rows}x{cols}")]
    NotSquare {
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },
    /// NaN weights have no ordering.
    #[error("weight at ({row}, {col}) is NaN")]
    NanWeight {
        /// Row of the offending entry.
        row: usize,
        /// Column of the offending entry.
        col: usize,
    },
    /// Two `+inf` entries share a row or a column.
    #[error("forced pair ({row}, {col}) conflicts with another forced pair")]
    ConflictingForcedPairs {
        /// Row of the second forced entry.
        row: usize,
        /// Column of the second forced entry.
        col: usize,
    },
    /// Every perfect matching uses a forbidden (`-inf`) pair.
    #[error("no perfect matching avoids the forbidden pairs")]
    Infeasible,
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// A perfect matching: row `rows[t]` is matched to column `cols[t]`.
///
/// `rows` is always `0..n` in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Row indices, ascending.
    pub rows: Vec<usize>,
    /// Matched column for each entry of `rows`.
    pub cols: Vec<usize>,
}

impl Assignment {
    /// Number of matched pairs.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True for the empty matching of a `0 × 0` problem.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total weight of the matching under `weights`.
    pub fn total_weight(&self, weights: ArrayView2<f64>) -> f64 {
        self.rows
            .iter()
            .zip(&self.cols)
            .map(|(&i, &j)| weights[[i, j]])
            .sum()
    }
}

/// Solve the maximum-weight perfect matching problem on a square matrix.
///
/// Deterministic: ties are broken by the lowest column index reached first.
pub fn max_weight_matching(weights: ArrayView2<f64>) -> Result<Assignment> {
    let (rows, cols) = weights.dim();
    if rows != cols {
        return Err(Error::NotSquare { rows, cols });
    }
    let n = rows;

    let mut row_match: Vec<Option<usize>> = vec![None; n];
    let mut col_taken = vec![false; n];
    for ((i, j), &w) in weights.indexed_iter() {
        if w.is_nan() {
            return Err(Error::NanWeight { row: i, col: j });
        }
        if w == f64::INFINITY {
            if row_match[i].is_some() || col_taken[j] {
                return Err(Error::ConflictingForcedPairs { row: i, col: j });
            }
            row_match[i] = Some(j);
            col_taken[j] = true;
        }
    }

    let free_rows: Vec<usize> = (0..n).filter(|&i| row_match[i].is_none()).collect();
    let free_cols: Vec<usize> = (0..n).filter(|&j| !col_taken[j]).collect();
    let m = free_rows.len();

    if m > 0 {
        // Minimize cost = -weight / scale. Dividing by a power of two is exact and keeps
        // finite costs within [-2, 2], so the penalty and the potentials stay finite.
        let mut max_abs = 0.0f64;
        for &i in &free_rows {
            for &j in &free_cols {
                let w = weights[[i, j]];
                if w.is_finite() {
                    max_abs = max_abs.max(w.abs());
                }
            }
        }
        let scale = if max_abs > 1.0 {
            2f64.powi((max_abs.log2().ceil() as i32).min(f64::MAX_EXP - 1))
        } else {
            1.0
        };

        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        let mut cost = vec![f64::NAN; m * m];
        for (a, &i) in free_rows.iter().enumerate() {
            for (b, &j) in free_cols.iter().enumerate() {
                let w = weights[[i, j]];
                if w.is_finite() {
                    let c = -w / scale;
                    lo = lo.min(c);
                    hi = hi.max(c);
                    cost[a * m + b] = c;
                }
            }
        }
        if hi < lo {
            lo = 0.0;
            hi = 0.0;
        }
        // Forbidden cells cost more than any matching that avoids them.
        let penalty = hi + (hi - lo + 1.0) * (m as f64 + 1.0);
        for c in cost.iter_mut().filter(|c| c.is_nan()) {
            *c = penalty;
        }

        let assigned = hungarian(&cost, m);
        for (a, &b) in assigned.iter().enumerate() {
            let (i, j) = (free_rows[a], free_cols[b]);
            if weights[[i, j]] == f64::NEG_INFINITY {
                return Err(Error::Infeasible);
            }
            row_match[i] = Some(j);
        }
    }

    let cols = row_match
        .into_iter()
        .collect::<Option<Vec<usize>>>()
        .ok_or(Error::Infeasible)?;
    Ok(Assignment {
        rows: (0..n).collect(),
        cols,
    })
}

/// Minimum-cost assignment on a finite `m × m` row-major cost matrix.
///
/// Returns the column assigned to each row.
fn hungarian(cost: &[f64], m: usize) -> Vec<usize> {
    // 1-based potentials; index 0 is the virtual root column.
    let mut u = vec![0.0; m + 1];
    let mut v = vec![0.0; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=m {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[(i0 - 1) * m + (j - 1)] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![0usize; m];
    for j in 1..=m {
        if p[j] > 0 {
            row_to_col[p[j] - 1] = j - 1;
        }
    }
    row_to_col
}
