//! `AlignmentCrf`: a distribution over alignments whose scores are defined per cell.
//!
//! The score of an alignment depends only on the cells it selects, not on the
//! direction a path takes through the table. Three regimes are supported:
//!
//! - `monotone_one_to_many`: every column is aligned to exactly one row, rows may take
//!   several consecutive columns, links never cross;
//! - `monotone_many_to_many`: a monotone path that may advance a row, a column, or both;
//! - `non_monotone_one_to_one`: any permutation of a square table.
//!
//! The monotone regimes are views of [`GeneralMonotoneAlignmentCrf`] with every move
//! scored by the same cell potential, so the full distributional interface is
//! available. The non-monotone regime has \(n!\) alignments and no tractable
//! partition function; it offers scoring and MAP inference only.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use tracing::debug;

use crate::monotone::{self, GeneralMonotoneAlignmentCrf, TemplateMarginals};
use crate::non_monotone::{self, non_monotone_align, NonMonotoneArgmax};
use crate::special::mul_finite;
use crate::tensor::{self, from_flat, Layout};

/// Errors for [`AlignmentCrf`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// One-to-many over a table with `rows >= cols` has at most one alignment.
    #[error(
        "degenerate distribution: monotone one-to-many over {rows}x{cols} admits fewer than \
         two alignments"
    )]
    DegenerateDistribution {
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },
    /// The alignment-type tag is not one of the known regimes.
    #[error("unknown alignment type: {0}")]
    UnknownAlignmentType(String),
    /// Column lengths were given for the non-monotone regime.
    #[error("non-monotone alignment requires only row lengths")]
    ColumnLengthsNotAllowed,
    /// Non-monotone alignment needs a square table.
    #[error("non-monotone alignment requires a square matrix, got {rows}x{cols}")]
    NotSquare {
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },
    /// Malformed log-potentials or lengths.
    #[error("invalid log-potentials or lengths: {0}")]
    InvalidInput(#[source] tensor::Error),
    /// The monotone engine rejected the construction arguments.
    #[error("invalid monotone configuration: {0}")]
    InvalidMonotone(#[source] monotone::Error),
    /// The non-monotone oracle rejected the construction arguments.
    #[error("invalid non-monotone configuration: {0}")]
    InvalidNonMonotone(#[source] non_monotone::Error),
    /// The operation has no definition for this regime.
    #[error("{alignment_type} alignment doesn't support {operation}{}", hint_suffix(.hint))]
    Unsupported {
        /// Name of the capability.
        operation: &'static str,
        /// Regime of the receiver.
        alignment_type: AlignmentType,
        /// Suggested alternative, if any.
        hint: Option<&'static str>,
    },
    /// Divergences need two distributions of the same regime family.
    #[error("cannot compare {0} alignment with {1} alignment")]
    MixedRegimes(AlignmentType, AlignmentType),
    /// Call-time error from the monotone engine.
    #[error(transparent)]
    Monotone(#[from] monotone::Error),
    /// Call-time error from the non-monotone oracle.
    #[error(transparent)]
    NonMonotone(#[from] non_monotone::Error),
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    match hint {
        Some(h) => format!("; {h}"),
        None => String::new(),
    }
}

impl Error {
    /// Construction-time misuse: bad shapes, lengths, or regime choice.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DegenerateDistribution { .. }
                | Error::UnknownAlignmentType(_)
                | Error::ColumnLengthsNotAllowed
                | Error::NotSquare { .. }
                | Error::InvalidInput(_)
                | Error::InvalidMonotone(_)
                | Error::InvalidNonMonotone(_)
        )
    }

    /// A query the receiver's regime does not define.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Which family of alignments the distribution ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignmentType {
    /// Monotone; each column aligned to one row.
    MonotoneOneToMany,
    /// Monotone; rows and columns may both repeat.
    MonotoneManyToMany,
    /// Any bijection between rows and columns.
    NonMonotoneOneToOne,
}

impl AlignmentType {
    /// The string tag, e.g. `"monotone_one_to_many"`.
    pub fn as_str(self) -> &'static str {
        match self {
            AlignmentType::MonotoneOneToMany => "monotone_one_to_many",
            AlignmentType::MonotoneManyToMany => "monotone_many_to_many",
            AlignmentType::NonMonotoneOneToOne => "non_monotone_one_to_one",
        }
    }

    /// True for both monotone regimes.
    pub fn is_monotone(self) -> bool {
        !matches!(self, AlignmentType::NonMonotoneOneToOne)
    }
}

impl fmt::Display for AlignmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlignmentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "monotone_one_to_many" => Ok(AlignmentType::MonotoneOneToMany),
            "monotone_many_to_many" => Ok(AlignmentType::MonotoneManyToMany),
            "non_monotone_one_to_one" => Ok(AlignmentType::NonMonotoneOneToOne),
            other => Err(Error::UnknownAlignmentType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Regime {
    Monotone(GeneralMonotoneAlignmentCrf),
    NonMonotone { lengths: ArrayD<usize> },
}

/// Distribution over alignments between two sequences with per-cell log-potentials.
///
/// Immutable after construction; every operation is a pure function of the fields.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentCrf {
    log_potentials: ArrayD<f64>,
    layout: Layout,
    alignment_type: AlignmentType,
    regime: Regime,
}

impl AlignmentCrf {
    /// Build the distribution.
    ///
    /// - `log_potentials`: `[...batch, rows, cols]`.
    /// - `lengths_rows` / `lengths_cols`: `[...batch]`; default to the full table.
    ///   The non-monotone regime reads `lengths_rows` only (the table is square) and
    ///   defaults it to the column count.
    pub fn new(
        log_potentials: ArrayD<f64>,
        lengths_rows: Option<ArrayD<usize>>,
        lengths_cols: Option<ArrayD<usize>>,
        alignment_type: AlignmentType,
    ) -> Result<Self> {
        let layout = Layout::of(log_potentials.shape()).map_err(Error::InvalidInput)?;
        let (rows, cols) = (layout.rows, layout.cols);

        if lengths_rows.is_none()
            && lengths_cols.is_none()
            && alignment_type == AlignmentType::MonotoneOneToMany
            && rows >= cols
        {
            return Err(Error::DegenerateDistribution { rows, cols });
        }

        let regime = match alignment_type {
            AlignmentType::MonotoneOneToMany => Regime::Monotone(
                GeneralMonotoneAlignmentCrf::new(
                    vec![log_potentials.clone(), log_potentials.clone()],
                    None,
                    lengths_rows,
                    lengths_cols,
                )
                .map_err(Error::InvalidMonotone)?,
            ),
            AlignmentType::MonotoneManyToMany => Regime::Monotone(
                GeneralMonotoneAlignmentCrf::new(
                    vec![log_potentials.clone(), log_potentials.clone()],
                    Some(log_potentials.clone()),
                    lengths_rows,
                    lengths_cols,
                )
                .map_err(Error::InvalidMonotone)?,
            ),
            AlignmentType::NonMonotoneOneToOne => {
                if lengths_cols.is_some() {
                    return Err(Error::ColumnLengthsNotAllowed);
                }
                if rows != cols {
                    return Err(Error::NotSquare { rows, cols });
                }
                let lengths = lengths_rows
                    .unwrap_or_else(|| ArrayD::from_elem(IxDyn(&layout.batch_shape), cols));
                NonMonotoneArgmax::new(&log_potentials, &lengths)
                    .map_err(Error::InvalidNonMonotone)?;
                Regime::NonMonotone { lengths }
            }
        };

        debug!(
            alignment_type = %alignment_type,
            shape = ?log_potentials.shape(),
            "constructed alignment CRF"
        );
        Ok(Self {
            log_potentials,
            layout,
            alignment_type,
            regime,
        })
    }

    /// Like [`AlignmentCrf::new`], with the regime given as a string tag.
    pub fn from_tag(
        log_potentials: ArrayD<f64>,
        lengths_rows: Option<ArrayD<usize>>,
        lengths_cols: Option<ArrayD<usize>>,
        alignment_type: &str,
    ) -> Result<Self> {
        Self::new(
            log_potentials,
            lengths_rows,
            lengths_cols,
            alignment_type.parse()?,
        )
    }

    /// The regime fixed at construction.
    pub fn alignment_type(&self) -> AlignmentType {
        self.alignment_type
    }

    /// The cell log-potentials as given.
    pub fn log_potentials(&self) -> &ArrayD<f64> {
        &self.log_potentials
    }

    /// The monotone engine backing this distribution, if the regime is monotone.
    pub fn delegate(&self) -> Option<&GeneralMonotoneAlignmentCrf> {
        match &self.regime {
            Regime::Monotone(d) => Some(d),
            Regime::NonMonotone { .. } => None,
        }
    }

    /// `[rows, cols]`.
    pub fn event_shape(&self) -> Vec<usize> {
        self.layout.event_shape()
    }

    /// Leading batch dimensions.
    pub fn batch_shape(&self) -> Vec<usize> {
        self.layout.batch_shape.clone()
    }

    fn unsupported(&self, operation: &'static str, hint: Option<&'static str>) -> Error {
        Error::Unsupported {
            operation,
            alignment_type: self.alignment_type,
            hint,
        }
    }

    /// Draw alignments, shaped `[...sample_shape, ...batch, rows, cols]`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        sample_shape: &[usize],
    ) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.sample(rng, sample_shape)?),
            Regime::NonMonotone { .. } => Err(self.unsupported(
                "sampling",
                Some("try perturb-and-map by injecting noise into the log-potentials"),
            )),
        }
    }

    /// Subtract the log-partition from scores whose trailing dims are the batch shape.
    pub fn normalize_log_probs(&self, scores: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.normalize_log_probs(scores)?),
            Regime::NonMonotone { .. } => Err(self.unsupported("normalization", None)),
        }
    }

    /// Normalized log-probability of `event`.
    pub fn log_prob(&self, event: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.log_prob(event)?),
            Regime::NonMonotone { .. } => Err(self.unsupported("normalized log-probs", None)),
        }
    }

    /// Unnormalized score of `event`.
    ///
    /// A 0/1 event in a monotone regime is scored as the path through its cells (`-inf`
    /// if those cells are not a legal path). Fractional events, such as
    /// [`AlignmentCrf::marginals`], and every event in the non-monotone regime are
    /// scored as \(\sum_{ij} e_{ij}\,\theta_{ij}\) over the original (unmasked)
    /// log-potentials; zero entries of `event` contribute nothing.
    pub fn unnormalized_log_prob(&self, event: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => {
                if event.iter().all(|&v| v == 0.0 || v == 1.0) {
                    Ok(d.unnormalized_log_prob(event)?)
                } else {
                    Ok(self.cell_scores(event).map_err(monotone::Error::from)?)
                }
            }
            Regime::NonMonotone { .. } => {
                Ok(self.cell_scores(event).map_err(non_monotone::Error::from)?)
            }
        }
    }

    fn cell_scores(&self, event: &ArrayD<f64>) -> tensor::Result<ArrayD<f64>> {
        let e = self.layout.flatten(event)?;
        let lp = self.layout.flatten(&self.log_potentials)?;
        let scores = e
            .outer_iter()
            .zip(lp.outer_iter())
            .map(|(e, lp)| {
                e.iter()
                    .zip(lp.iter())
                    .map(|(&x, &t)| mul_finite(x, t))
                    .sum::<f64>()
            })
            .collect();
        from_flat(self.layout.batch_shape.clone(), scores)
    }

    /// \(\log Z\) per batch element.
    pub fn log_partition(&self) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.log_partition()?),
            Regime::NonMonotone { .. } => Err(self.unsupported("log-partition", None)),
        }
    }

    /// Marginals of the underlying monotone template variables.
    pub fn marginals_for_template_variables(&self) -> Result<TemplateMarginals> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.marginals_for_template_variables()?),
            Regime::NonMonotone { .. } => Err(self.unsupported("marginals", None)),
        }
    }

    /// Per-cell alignment probabilities.
    pub fn marginals(&self) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.marginals()?),
            Regime::NonMonotone { .. } => Err(self.unsupported("marginals", None)),
        }
    }

    /// Highest-scoring alignment, as a 0/1 matrix per batch element.
    pub fn argmax(&self) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.argmax()?),
            Regime::NonMonotone { lengths } => {
                Ok(non_monotone_align(&self.log_potentials, lengths)?)
            }
        }
    }

    /// `(argmax(), unnormalized_log_prob(argmax()))`.
    pub fn argmax_and_max(&self) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let event = self.argmax()?;
        let score = self.unnormalized_log_prob(&event)?;
        Ok((event, score))
    }

    /// Vector-Jacobian product of [`AlignmentCrf::argmax`] with respect to the
    /// log-potentials.
    ///
    /// The argmax is piecewise constant in the potentials, so this is zero in both
    /// regimes; for the non-monotone regime it is the oracle's declared backward rule.
    pub fn argmax_gradient(&self, cotangent: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(_) => {
                self.layout
                    .check(cotangent)
                    .map_err(monotone::Error::from)?;
                Ok(ArrayD::zeros(self.log_potentials.raw_dim()))
            }
            Regime::NonMonotone { lengths } => {
                Ok(NonMonotoneArgmax::new(&self.log_potentials, lengths)?.backward(cotangent)?)
            }
        }
    }

    /// The `k` best alignments and their scores, stacked on a new leading axis.
    pub fn top_k(&self, k: usize) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.top_k(k)?),
            Regime::NonMonotone { .. } => Err(self.unsupported("top-k", None)),
        }
    }

    /// Entropy per batch element.
    pub fn entropy(&self) -> Result<ArrayD<f64>> {
        match &self.regime {
            Regime::Monotone(d) => Ok(d.entropy()?),
            Regime::NonMonotone { .. } => Err(self.unsupported("entropy", None)),
        }
    }

    fn delegates<'s>(
        &'s self,
        other: &'s Self,
        operation: &'static str,
    ) -> Result<(&'s GeneralMonotoneAlignmentCrf, &'s GeneralMonotoneAlignmentCrf)> {
        match (&self.regime, &other.regime) {
            (Regime::Monotone(p), Regime::Monotone(q)) => Ok((p, q)),
            (Regime::NonMonotone { .. }, _) => Err(self.unsupported(operation, None)),
            (Regime::Monotone(_), Regime::NonMonotone { .. }) => Err(Error::MixedRegimes(
                self.alignment_type,
                other.alignment_type,
            )),
        }
    }

    /// Cross-entropy \(H(p, q)\) with `self` as \(p\).
    pub fn cross_entropy(&self, other: &Self) -> Result<ArrayD<f64>> {
        let (p, q) = self.delegates(other, "cross-entropy")?;
        Ok(p.cross_entropy(q)?)
    }

    /// \(\mathrm{KL}(p \,\|\, q)\) with `self` as \(p\).
    pub fn kl_divergence(&self, other: &Self) -> Result<ArrayD<f64>> {
        let (p, q) = self.delegates(other, "KL divergence")?;
        Ok(p.kl_divergence(q)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Axis, Dimension};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn table(shape: &[usize], vals: &[f64]) -> ArrayD<f64> {
        ArrayD::from_shape_vec(IxDyn(shape), vals.to_vec()).unwrap()
    }

    fn lengths(v: &[usize]) -> ArrayD<usize> {
        ArrayD::from_shape_vec(IxDyn(&[v.len()]), v.to_vec()).unwrap()
    }

    fn dot(event: &ArrayD<f64>, lp: &ArrayD<f64>) -> f64 {
        event.iter().zip(lp.iter()).map(|(&e, &t)| mul_finite(e, t)).sum()
    }

    fn wavy(shape: &[usize]) -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(shape), |ix| {
            let s: usize = ix.slice().iter().enumerate().map(|(k, &v)| (k + 2) * v).sum();
            ((s * 37) % 13) as f64 / 4.0 - 1.5
        })
    }

    #[test]
    fn tags_round_trip_and_unknown_tags_fail() {
        for t in [
            AlignmentType::MonotoneOneToMany,
            AlignmentType::MonotoneManyToMany,
            AlignmentType::NonMonotoneOneToOne,
        ] {
            assert_eq!(t.as_str().parse::<AlignmentType>().unwrap(), t);
        }
        let err = AlignmentCrf::from_tag(wavy(&[2, 3]), None, None, "diagonal").unwrap_err();
        assert_eq!(err, Error::UnknownAlignmentType("diagonal".into()));
        assert!(err.is_configuration());
    }

    #[test]
    fn one_to_many_needs_more_columns_than_rows() {
        for shape in [[3, 3], [4, 2]] {
            let err = AlignmentCrf::new(wavy(&shape), None, None, AlignmentType::MonotoneOneToMany)
                .unwrap_err();
            assert_eq!(
                err,
                Error::DegenerateDistribution {
                    rows: shape[0],
                    cols: shape[1]
                }
            );
            assert!(err.is_configuration());
        }
        assert!(
            AlignmentCrf::new(wavy(&[2, 4]), None, None, AlignmentType::MonotoneOneToMany).is_ok()
        );
        // Explicit lengths skip the check.
        assert!(AlignmentCrf::new(
            wavy(&[1, 3, 3]),
            Some(lengths(&[2])),
            None,
            AlignmentType::MonotoneOneToMany
        )
        .is_ok());
    }

    #[test]
    fn non_monotone_construction_errors() {
        let err = AlignmentCrf::new(wavy(&[2, 3]), None, None, AlignmentType::NonMonotoneOneToOne)
            .unwrap_err();
        assert_eq!(err, Error::NotSquare { rows: 2, cols: 3 });
        assert!(err.is_configuration());

        let err = AlignmentCrf::new(
            wavy(&[2, 3, 3]),
            None,
            Some(lengths(&[3, 3])),
            AlignmentType::NonMonotoneOneToOne,
        )
        .unwrap_err();
        assert_eq!(err, Error::ColumnLengthsNotAllowed);
        assert!(err.is_configuration());

        let err = AlignmentCrf::new(
            wavy(&[2, 3, 3]),
            Some(lengths(&[1, 4])),
            None,
            AlignmentType::NonMonotoneOneToOne,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNonMonotone(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn delegate_exists_iff_monotone() {
        for t in [
            AlignmentType::MonotoneOneToMany,
            AlignmentType::MonotoneManyToMany,
            AlignmentType::NonMonotoneOneToOne,
        ] {
            let crf = AlignmentCrf::new(wavy(&[2, 3, 3]), Some(lengths(&[2, 3])), None, t).unwrap();
            assert_eq!(crf.delegate().is_some(), t.is_monotone());
            assert_eq!(crf.event_shape(), vec![3, 3]);
            assert_eq!(crf.batch_shape(), vec![2]);
        }
    }

    #[test]
    fn non_monotone_score_is_a_dot_product() {
        let lp = table(&[2, 2], &[1.0, 0.0, 0.0, 1.0]);
        let crf = AlignmentCrf::new(lp, None, None, AlignmentType::NonMonotoneOneToOne).unwrap();
        let event = table(&[2, 2], &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(crf.unnormalized_log_prob(&event).unwrap()[IxDyn(&[])], 2.0);
    }

    #[test]
    fn non_monotone_score_ignores_the_length_mask() {
        let lp = table(&[1, 2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let crf = AlignmentCrf::new(
            lp,
            Some(lengths(&[1])),
            None,
            AlignmentType::NonMonotoneOneToOne,
        )
        .unwrap();
        let event = ArrayD::ones(IxDyn(&[1, 2, 2]));
        assert_eq!(crf.unnormalized_log_prob(&event).unwrap()[[0]], 10.0);
    }

    #[test]
    fn non_monotone_argmax_is_a_masked_permutation() {
        let lp = wavy(&[3, 4, 4]);
        let crf = AlignmentCrf::new(
            lp,
            Some(lengths(&[4, 2, 0])),
            None,
            AlignmentType::NonMonotoneOneToOne,
        )
        .unwrap();
        let am = crf.argmax().unwrap();
        for (b, len) in [4usize, 2, 0].into_iter().enumerate() {
            let m = am.index_axis(Axis(0), b);
            for i in 0..4 {
                let row: f64 = (0..4).map(|j| m[[i, j]]).sum();
                let col: f64 = (0..4).map(|j| m[[j, i]]).sum();
                let want = if i < len { 1.0 } else { 0.0 };
                assert_eq!((row, col), (want, want), "batch {} index {}", b, i);
            }
        }
    }

    #[test]
    fn non_monotone_default_length_covers_the_table() {
        let crf =
            AlignmentCrf::new(wavy(&[5, 5]), None, None, AlignmentType::NonMonotoneOneToOne)
                .unwrap();
        assert_eq!(crf.argmax().unwrap().sum(), 5.0);
    }

    #[test]
    fn argmax_and_max_is_argmax_then_score() {
        let cases = [
            (AlignmentType::MonotoneOneToMany, vec![2, 3, 5]),
            (AlignmentType::MonotoneManyToMany, vec![2, 4, 3]),
            (AlignmentType::NonMonotoneOneToOne, vec![2, 4, 4]),
        ];
        for (t, shape) in cases {
            let lp = wavy(&shape);
            let crf = AlignmentCrf::new(lp.clone(), None, None, t).unwrap();
            let (event, score) = crf.argmax_and_max().unwrap();
            let am = crf.argmax().unwrap();
            assert_eq!(event, am);
            assert_eq!(score, crf.unnormalized_log_prob(&am).unwrap());
            // Every regime scores cells with the same potential, so the score is a dot product.
            for b in 0..2 {
                let e = event.index_axis(Axis(0), b).to_owned();
                let l = lp.index_axis(Axis(0), b).to_owned();
                assert!((score[[b]] - dot(&e, &l)).abs() < 1e-12, "{}", t);
            }
        }
    }

    #[test]
    fn one_to_many_argmax_aligns_every_column_once() {
        let crf = AlignmentCrf::new(
            wavy(&[3, 6]),
            None,
            None,
            AlignmentType::MonotoneOneToMany,
        )
        .unwrap();
        let am = crf.argmax().unwrap();
        for j in 0..6 {
            let col: f64 = (0..3).map(|i| am[[i, j]]).sum();
            assert_eq!(col, 1.0);
        }
        for i in 0..3 {
            let row: f64 = (0..6).map(|j| am[[i, j]]).sum();
            assert!(row >= 1.0);
        }
    }

    #[test]
    fn argmax_gradient_is_zero() {
        for (t, shape) in [
            (AlignmentType::NonMonotoneOneToOne, [2, 3, 3]),
            (AlignmentType::MonotoneManyToMany, [2, 3, 4]),
        ] {
            let crf = AlignmentCrf::new(wavy(&shape), None, None, t).unwrap();
            let g = crf.argmax_gradient(&ArrayD::ones(IxDyn(&shape))).unwrap();
            assert_eq!(g.shape(), &shape);
            assert!(g.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn non_monotone_rejects_distributional_queries() {
        let crf =
            AlignmentCrf::new(wavy(&[3, 3]), None, None, AlignmentType::NonMonotoneOneToOne)
                .unwrap();
        let event = crf.argmax().unwrap();
        let scores = ArrayD::zeros(IxDyn(&[]));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let errors = [
            crf.sample(&mut rng, &[2]).unwrap_err(),
            crf.normalize_log_probs(&scores).unwrap_err(),
            crf.log_prob(&event).unwrap_err(),
            crf.log_partition().unwrap_err(),
            crf.marginals().unwrap_err(),
            crf.marginals_for_template_variables().unwrap_err(),
            crf.top_k(2).unwrap_err(),
            crf.entropy().unwrap_err(),
            crf.cross_entropy(&crf).unwrap_err(),
            crf.kl_divergence(&crf).unwrap_err(),
        ];
        for e in &errors {
            assert!(e.is_unsupported(), "{e}");
            assert!(!e.is_configuration());
        }
        assert!(errors[0].to_string().contains("perturb-and-map"));
    }

    #[test]
    fn divergence_across_regimes_is_rejected() {
        let mono = AlignmentCrf::new(wavy(&[3, 3]), None, None, AlignmentType::MonotoneManyToMany)
            .unwrap();
        let perm =
            AlignmentCrf::new(wavy(&[3, 3]), None, None, AlignmentType::NonMonotoneOneToOne)
                .unwrap();
        assert_eq!(
            mono.kl_divergence(&perm),
            Err(Error::MixedRegimes(
                AlignmentType::MonotoneManyToMany,
                AlignmentType::NonMonotoneOneToOne
            ))
        );
    }

    #[test]
    fn monotone_operations_forward_to_the_engine() {
        let lp = wavy(&[2, 3, 5]);
        let rows = lengths(&[2, 3]);
        let cols = lengths(&[4, 5]);
        for (alignment_type, vertical) in [
            (AlignmentType::MonotoneOneToMany, None),
            (AlignmentType::MonotoneManyToMany, Some(lp.clone())),
        ] {
            let crf = AlignmentCrf::new(
                lp.clone(),
                Some(rows.clone()),
                Some(cols.clone()),
                alignment_type,
            )
            .unwrap();
            let engine = GeneralMonotoneAlignmentCrf::new(
                vec![lp.clone(), lp.clone()],
                vertical,
                Some(rows.clone()),
                Some(cols.clone()),
            )
            .unwrap();
            assert_eq!(crf.delegate(), Some(&engine), "{}", alignment_type);

            let other = AlignmentCrf::new(
                lp.mapv(|x| -0.5 * x),
                Some(rows.clone()),
                Some(cols.clone()),
                alignment_type,
            )
            .unwrap();
            let other_engine = other.delegate().unwrap();

            let am = engine.argmax().unwrap();
            assert_eq!(crf.argmax().unwrap(), am);
            assert_eq!(crf.log_partition().unwrap(), engine.log_partition().unwrap());
            assert_eq!(crf.marginals().unwrap(), engine.marginals().unwrap());
            assert_eq!(
                crf.marginals_for_template_variables().unwrap(),
                engine.marginals_for_template_variables().unwrap()
            );
            assert_eq!(crf.log_prob(&am).unwrap(), engine.log_prob(&am).unwrap());
            assert_eq!(
                crf.unnormalized_log_prob(&am).unwrap(),
                engine.unnormalized_log_prob(&am).unwrap()
            );
            assert_eq!(crf.top_k(3).unwrap(), engine.top_k(3).unwrap());
            assert_eq!(crf.entropy().unwrap(), engine.entropy().unwrap());
            assert_eq!(
                crf.cross_entropy(&other).unwrap(),
                engine.cross_entropy(other_engine).unwrap()
            );
            assert_eq!(
                crf.kl_divergence(&other).unwrap(),
                engine.kl_divergence(other_engine).unwrap()
            );
            let mut r1 = ChaCha8Rng::seed_from_u64(3);
            let mut r2 = ChaCha8Rng::seed_from_u64(3);
            assert_eq!(
                crf.sample(&mut r1, &[4]).unwrap(),
                engine.sample(&mut r2, &[4]).unwrap()
            );
        }
    }

    #[test]
    fn monotone_scores_fractional_events_by_cell_product_sum() {
        let lp = wavy(&[2, 3, 5]);
        for alignment_type in [
            AlignmentType::MonotoneOneToMany,
            AlignmentType::MonotoneManyToMany,
        ] {
            let crf = AlignmentCrf::new(
                lp.clone(),
                Some(lengths(&[2, 3])),
                Some(lengths(&[4, 5])),
                alignment_type,
            )
            .unwrap();
            let mu = crf.marginals().unwrap();
            assert!(mu.iter().any(|&v| v > 0.0 && v < 1.0));
            let got = crf.unnormalized_log_prob(&mu).unwrap();
            assert_eq!(got.shape(), &[2]);
            for b in 0..2 {
                let want = dot(
                    &mu.index_axis(Axis(0), b).to_owned(),
                    &lp.index_axis(Axis(0), b).to_owned(),
                );
                assert!(
                    (got[[b]] - want).abs() < 1e-9,
                    "{} batch {}: got={} want={}",
                    alignment_type,
                    b,
                    got[[b]],
                    want
                );
            }

            // A 0/1 event is still scored as a path: the best path matches its dot product.
            let am = crf.argmax().unwrap();
            let path = crf.unnormalized_log_prob(&am).unwrap();
            for b in 0..2 {
                let want = dot(
                    &am.index_axis(Axis(0), b).to_owned(),
                    &lp.index_axis(Axis(0), b).to_owned(),
                );
                assert!((path[[b]] - want).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn many_to_many_marginals_sum_to_one_at_the_corners() {
        let crf = AlignmentCrf::new(wavy(&[4, 3]), None, None, AlignmentType::MonotoneManyToMany)
            .unwrap();
        let mu = crf.marginals().unwrap();
        assert!((mu[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((mu[[3, 2]] - 1.0).abs() < 1e-12);
        let lp = crf.log_prob(&crf.argmax().unwrap()).unwrap()[IxDyn(&[])];
        assert!(lp <= 0.0 && lp.is_finite());
    }

    proptest! {
        #[test]
        fn non_monotone_argmax_beats_identity(
            vals in prop::collection::vec(-4.0f64..4.0, 16),
        ) {
            let lp = table(&[4, 4], &vals);
            let crf = AlignmentCrf::new(lp.clone(), None, None, AlignmentType::NonMonotoneOneToOne)
                .unwrap();
            let (_, best) = crf.argmax_and_max().unwrap();
            let identity: f64 = (0..4).map(|i| lp[[i, i]]).sum();
            prop_assert!(best[IxDyn(&[])] >= identity - 1e-12);
        }
    }
}
