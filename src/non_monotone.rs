//! MAP inference for non-monotone one-to-one alignments.
//!
//! The feasible set is every permutation matrix on the valid `len × len` block, so
//! the argmax is a linear assignment problem per batch element. The solve happens on
//! the host, outside any differentiable computation: [`NonMonotoneArgmax`] is an
//! opaque operation whose backward rule is identically zero. Gradients through the
//! argmax have to come from a perturbation technique layered on top.

use ndarray::{Array2, ArrayD, ArrayView2, Axis};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::matching::{self, max_weight_matching};
use crate::tensor::{self, from_flat, Layout};

/// Errors for the non-monotone argmax.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Layout or reshape problem.
    #[error(transparent)]
    Tensor(#[from] tensor::Error),
    /// One-to-one alignment is only defined on square tables.
    #[error("non-monotone alignment requires a square matrix, got {rows}x{cols}")]
    NotSquare {
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },
    /// A length exceeds the matrix size.
    #[error("length {length} at batch index {index} exceeds matrix size {max}")]
    LengthOutOfRange {
        /// Flat batch index.
        index: usize,
        /// The offending length.
        length: usize,
        /// Matrix size.
        max: usize,
    },
    /// The assignment solver rejected one batch element.
    #[error("assignment failed for batch index {index}: {source}")]
    Matching {
        /// Flat batch index.
        index: usize,
        /// Solver error.
        #[source]
        source: matching::Error,
    },
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// The argmax as an opaque, non-differentiable operation.
///
/// `forward` computes the hard 0/1 alignment; `backward` is the declared
/// vector-Jacobian product, which is zero for the log-potentials. Lengths are
/// integers and receive no gradient.
#[derive(Debug, Clone)]
pub struct NonMonotoneArgmax<'a> {
    log_potentials: &'a ArrayD<f64>,
    layout: Layout,
    lengths: Vec<usize>,
}

impl<'a> NonMonotoneArgmax<'a> {
    /// Validate inputs: `log_potentials` is `[...batch, n, n]`, `lengths` is `[...batch]`
    /// with every entry in `0..=n`.
    pub fn new(log_potentials: &'a ArrayD<f64>, lengths: &ArrayD<usize>) -> Result<Self> {
        let layout = Layout::of(log_potentials.shape())?;
        if layout.rows != layout.cols {
            return Err(Error::NotSquare {
                rows: layout.rows,
                cols: layout.cols,
            });
        }
        let lengths = layout.flatten_lengths(lengths)?;
        for (index, &length) in lengths.iter().enumerate() {
            if length > layout.rows {
                return Err(Error::LengthOutOfRange {
                    index,
                    length,
                    max: layout.rows,
                });
            }
        }
        Ok(Self {
            log_potentials,
            layout,
            lengths,
        })
    }

    /// Hard alignment: a permutation matrix on each valid block, zeros elsewhere.
    pub fn forward(&self) -> Result<ArrayD<f64>> {
        let flat = self.layout.flatten(self.log_potentials)?;
        debug!(
            batch = self.lengths.len(),
            n = self.layout.rows,
            "solving non-monotone assignments"
        );
        let blocks = (0..self.lengths.len())
            .into_par_iter()
            .map(|b| solve_block(flat.index_axis(Axis(0), b), self.lengths[b], b))
            .collect::<Result<Vec<_>>>()?;
        Ok(from_flat(self.layout.full_shape(), blocks.concat())?)
    }

    /// Pull back an output cotangent: always zero with the log-potentials' shape.
    pub fn backward(&self, cotangent: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        self.layout.check(cotangent)?;
        Ok(ArrayD::zeros(self.log_potentials.raw_dim()))
    }
}

fn solve_block(lp: ArrayView2<f64>, len: usize, index: usize) -> Result<Vec<f64>> {
    let n = lp.nrows();
    // Cells outside the valid block are forbidden, except the padding diagonal, which
    // is forced so the solver always sees a feasible square problem.
    let padded = Array2::from_shape_fn((n, n), |(i, j)| {
        if i < len && j < len {
            lp[[i, j]]
        } else if i == j {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    });
    let assignment = max_weight_matching(padded.view())
        .map_err(|source| Error::Matching { index, source })?;
    trace!(index, len, "assignment solved");

    let mut out = vec![0.0; n * n];
    for (&i, &j) in assignment.rows.iter().zip(&assignment.cols) {
        if i < len && j < len {
            out[i * n + j] = 1.0;
        }
    }
    Ok(out)
}

/// Convenience wrapper: validate and run [`NonMonotoneArgmax::forward`].
pub fn non_monotone_align(
    log_potentials: &ArrayD<f64>,
    lengths: &ArrayD<usize>,
) -> Result<ArrayD<f64>> {
    NonMonotoneArgmax::new(log_potentials, lengths)?.forward()
}
