//! Batched layout helpers.
//!
//! Tensors handled by this crate have shape `[...batch, rows, cols]`. Internally every
//! operator flattens the batch dimensions into one axis and works on a contiguous
//! `(B, rows, cols)` array, then restores the caller's shape on the way out.

use ndarray::{Array3, ArrayD, IxDyn};

/// Errors for batched layout handling.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Alignment tensors need at least a row and a column axis.
    #[error("expected a tensor of rank >= 2 ([...batch, rows, cols]), got rank {0}")]
    RankTooLow(usize),
    /// Two tensors that must agree in shape do not.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape required by the operator.
        expected: Vec<usize>,
        /// Shape that was provided.
        got: Vec<usize>,
    },
    /// Reshape failed inside ndarray.
    #[error(transparent)]
    Reshape(#[from] ndarray::ShapeError),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Decomposition of a `[...batch, rows, cols]` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Leading batch dimensions (possibly empty).
    pub batch_shape: Vec<usize>,
    /// Row count.
    pub rows: usize,
    /// Column count.
    pub cols: usize,
}

impl Layout {
    /// Split a full shape into batch dims and the trailing `(rows, cols)` event dims.
    pub fn of(shape: &[usize]) -> Result<Self> {
        if shape.len() < 2 {
            return Err(Error::RankTooLow(shape.len()));
        }
        let k = shape.len() - 2;
        Ok(Self {
            batch_shape: shape[..k].to_vec(),
            rows: shape[k],
            cols: shape[k + 1],
        })
    }

    /// Number of batch elements (1 for an unbatched tensor, 0 for an empty batch).
    pub fn batch_size(&self) -> usize {
        self.batch_shape.iter().product()
    }

    /// `[rows, cols]`.
    pub fn event_shape(&self) -> Vec<usize> {
        vec![self.rows, self.cols]
    }

    /// `[...batch, rows, cols]`.
    pub fn full_shape(&self) -> Vec<usize> {
        let mut s = self.batch_shape.clone();
        s.push(self.rows);
        s.push(self.cols);
        s
    }

    /// `[...prefix, ...batch, rows, cols]`.
    pub fn prefixed_shape(&self, prefix: &[usize]) -> Vec<usize> {
        let mut s = prefix.to_vec();
        s.extend(self.full_shape());
        s
    }

    /// `[...prefix, ...batch]`.
    pub fn prefixed_batch_shape(&self, prefix: &[usize]) -> Vec<usize> {
        let mut s = prefix.to_vec();
        s.extend_from_slice(&self.batch_shape);
        s
    }

    /// Check that `arr` has exactly this layout's full shape.
    pub fn check(&self, arr: &ArrayD<f64>) -> Result<()> {
        let expected = self.full_shape();
        if arr.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                expected,
                got: arr.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Copy `arr` into a contiguous `(B, rows, cols)` array.
    pub fn flatten(&self, arr: &ArrayD<f64>) -> Result<Array3<f64>> {
        self.check(arr)?;
        let flat = arr.to_shape((self.batch_size(), self.rows, self.cols))?;
        Ok(flat.into_owned())
    }

    /// Flatten per-batch lengths (shape must equal the batch shape) in row-major order.
    pub fn flatten_lengths(&self, lengths: &ArrayD<usize>) -> Result<Vec<usize>> {
        if lengths.shape() != self.batch_shape.as_slice() {
            return Err(Error::ShapeMismatch {
                expected: self.batch_shape.clone(),
                got: lengths.shape().to_vec(),
            });
        }
        Ok(lengths.iter().copied().collect())
    }
}

/// Build an `ArrayD` from row-major data.
pub fn from_flat(shape: Vec<usize>, data: Vec<f64>) -> Result<ArrayD<f64>> {
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}
