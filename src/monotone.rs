//! General monotone alignment CRF: a Gibbs distribution over monotone paths through
//! a `rows × cols` table.
//!
//! A path starts at cell \((0,0)\) and ends at \((R-1, C-1)\), where \(R, C\) are the
//! per-batch lengths. Each step enters a new cell through one of the *moves*:
//!
//! - `Horizontal(k)`: \((i-k, j-1) \to (i, j)\), scored by `horizontal[k][i, j]`
//!   (`k = 0` stays in the row, `k = 1` is the diagonal, larger `k` skip rows);
//! - `Vertical`: \((i-1, j) \to (i, j)\), scored by `vertical[i, j]`.
//!
//! The start cell contributes `horizontal[0][0, 0]`. With \(\theta\) the template
//! potentials and \(s(\pi)\) the sum of scores along \(\pi\):
//! \[
//! p(\pi) = \frac{\exp s(\pi)}{Z},\qquad \log Z = \log\sum_\pi \exp s(\pi).
//! \]
//! `log Z` is computed by a forward recursion in the log semiring; marginals come from
//! a forward-backward pass and are exactly \(\partial \log Z / \partial \theta\).
//!
//! Events are binary `rows × cols` matrices marking the visited cells.

use ndarray::{Array3, ArrayD};
use rand::Rng;

use crate::special::{log_sum_exp, mul_finite};
use crate::tensor::{self, from_flat, Layout};

/// Errors for the monotone alignment CRF.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// At least one horizontal move must exist.
    #[error("at least one horizontal log-potential tensor is required")]
    NoHorizontal,
    /// Layout or reshape problem.
    #[error(transparent)]
    Tensor(#[from] tensor::Error),
    /// A row/column length lies outside `1..=max`.
    #[error("{axis} length {length} at batch index {index} is outside 1..={max}")]
    LengthOutOfRange {
        /// `"row"` or `"column"`.
        axis: &'static str,
        /// Flat batch index.
        index: usize,
        /// The offending length.
        length: usize,
        /// Size of that axis.
        max: usize,
    },
    /// Events passed to scoring must be 0/1 matrices.
    #[error("event entries must be 0 or 1, found {0}")]
    NonBinaryEvent(f64),
    /// `top_k` needs `k >= 1`.
    #[error("top-k requires k >= 1")]
    ZeroK,
    /// The operands of a divergence do not describe the same lattice.
    #[error("distributions are not comparable: {0}")]
    Incompatible(&'static str),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// One way of entering a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    /// Advance one column and `k` rows.
    Horizontal(usize),
    /// Advance one row, stay in the column.
    Vertical,
}

impl Move {
    /// `(row_step, col_step)`.
    pub fn offset(self) -> (usize, usize) {
        match self {
            Move::Horizontal(k) => (k, 1),
            Move::Vertical => (1, 0),
        }
    }
}

/// Marginals of the template variables, structured like the constructor inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMarginals {
    /// One tensor per horizontal move.
    pub horizontal: Vec<ArrayD<f64>>,
    /// Present iff the distribution has a vertical move.
    pub vertical: Option<ArrayD<f64>>,
}

/// Distribution over monotone alignments with per-move, per-cell scores.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralMonotoneAlignmentCrf {
    layout: Layout,
    horizontal: Vec<Array3<f64>>,
    vertical: Option<Array3<f64>>,
    moves: Vec<Move>,
    lengths_rows: Vec<usize>,
    lengths_cols: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Hyp {
    score: f64,
    // Move used to enter the cell and the rank of the predecessor hypothesis.
    back: Option<(Move, usize)>,
}

/// One batch element's valid sub-lattice.
struct Lattice<'a> {
    crf: &'a GeneralMonotoneAlignmentCrf,
    b: usize,
    rows: usize,
    cols: usize,
}

impl<'a> Lattice<'a> {
    fn idx(&self, i: usize, j: usize) -> usize {
        i * self.cols + j
    }

    fn last(&self) -> usize {
        self.rows * self.cols - 1
    }

    fn theta(&self, m: Move, i: usize, j: usize) -> f64 {
        self.crf.potential(m, self.b, i, j)
    }

    fn start(&self) -> f64 {
        self.crf.horizontal[0][[self.b, 0, 0]]
    }

    fn pred(m: Move, i: usize, j: usize) -> Option<(usize, usize)> {
        let (di, dj) = m.offset();
        if i >= di && j >= dj {
            Some((i - di, j - dj))
        } else {
            None
        }
    }

    fn forward(&self) -> Vec<f64> {
        let mut alpha = vec![f64::NEG_INFINITY; self.rows * self.cols];
        let mut cands = Vec::with_capacity(self.crf.moves.len());
        alpha[0] = self.start();
        for i in 0..self.rows {
            for j in 0..self.cols {
                if i == 0 && j == 0 {
                    continue;
                }
                cands.clear();
                for &m in &self.crf.moves {
                    if let Some((pi, pj)) = Self::pred(m, i, j) {
                        let a = alpha[self.idx(pi, pj)];
                        if a > f64::NEG_INFINITY {
                            cands.push(a + self.theta(m, i, j));
                        }
                    }
                }
                alpha[self.idx(i, j)] = log_sum_exp(&cands);
            }
        }
        alpha
    }

    // beta[i, j] excludes the score of entering (i, j) itself.
    fn backward(&self) -> Vec<f64> {
        let mut beta = vec![f64::NEG_INFINITY; self.rows * self.cols];
        let mut cands = Vec::with_capacity(self.crf.moves.len());
        let last = self.last();
        beta[last] = 0.0;
        for i in (0..self.rows).rev() {
            for j in (0..self.cols).rev() {
                let here = self.idx(i, j);
                if here == last {
                    continue;
                }
                cands.clear();
                for &m in &self.crf.moves {
                    let (di, dj) = m.offset();
                    let (ni, nj) = (i + di, j + dj);
                    if ni < self.rows && nj < self.cols {
                        let b = beta[self.idx(ni, nj)];
                        if b > f64::NEG_INFINITY {
                            cands.push(self.theta(m, ni, nj) + b);
                        }
                    }
                }
                beta[here] = log_sum_exp(&cands);
            }
        }
        beta
    }

    /// Per-move marginals over the full (padded) grid, indexed like `crf.moves`.
    fn template_marginals(&self) -> (f64, Vec<Vec<f64>>) {
        let full_cols = self.crf.layout.cols;
        let size = self.crf.layout.rows * full_cols;
        let mut out = vec![vec![0.0; size]; self.crf.moves.len()];
        let alpha = self.forward();
        let log_z = alpha[self.last()];
        if log_z == f64::NEG_INFINITY {
            return (log_z, out);
        }
        let beta = self.backward();
        out[0][0] = (alpha[0] + beta[0] - log_z).exp();
        for (mi, &m) in self.crf.moves.iter().enumerate() {
            for i in 0..self.rows {
                for j in 0..self.cols {
                    let Some((pi, pj)) = Self::pred(m, i, j) else {
                        continue;
                    };
                    let a = alpha[self.idx(pi, pj)];
                    let b = beta[self.idx(i, j)];
                    if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
                        continue;
                    }
                    let z = a + self.theta(m, i, j) + b - log_z;
                    out[mi][i * full_cols + j] = if z < -745.0 { 0.0 } else { z.exp() };
                }
            }
        }
        (log_z, out)
    }

    /// k best hypotheses per cell, sorted by descending score.
    fn k_best(&self, k: usize) -> Vec<Vec<Hyp>> {
        let mut table: Vec<Vec<Hyp>> = vec![Vec::new(); self.rows * self.cols];
        let start = self.start();
        if start > f64::NEG_INFINITY {
            table[0].push(Hyp { score: start, back: None });
        }
        let mut cands = Vec::new();
        for i in 0..self.rows {
            for j in 0..self.cols {
                if i == 0 && j == 0 {
                    continue;
                }
                cands.clear();
                for &m in &self.crf.moves {
                    let Some((pi, pj)) = Self::pred(m, i, j) else {
                        continue;
                    };
                    let t = self.theta(m, i, j);
                    for (rank, h) in table[self.idx(pi, pj)].iter().enumerate() {
                        let score = h.score + t;
                        if score > f64::NEG_INFINITY {
                            cands.push(Hyp {
                                score,
                                back: Some((m, rank)),
                            });
                        }
                    }
                }
                // Stable sort keeps move order as the tie-breaker.
                cands.sort_by(|a, b| b.score.total_cmp(&a.score));
                cands.truncate(k);
                table[self.idx(i, j)] = cands.clone();
            }
        }
        table
    }

    fn backtrack(&self, table: &[Vec<Hyp>], rank: usize) -> Vec<(usize, usize)> {
        let (mut i, mut j, mut r) = (self.rows - 1, self.cols - 1, rank);
        let mut cells = Vec::with_capacity(self.rows + self.cols);
        loop {
            cells.push((i, j));
            match table[self.idx(i, j)][r].back {
                Some((m, prev)) => {
                    let (di, dj) = m.offset();
                    i -= di;
                    j -= dj;
                    r = prev;
                }
                None => break,
            }
        }
        cells.reverse();
        cells
    }

    fn sample_path<R: Rng + ?Sized>(&self, alpha: &[f64], rng: &mut R) -> Vec<(usize, usize)> {
        let (mut i, mut j) = (self.rows - 1, self.cols - 1);
        let mut cells = vec![(i, j)];
        let mut options: Vec<(Move, f64)> = Vec::with_capacity(self.crf.moves.len());
        while i > 0 || j > 0 {
            let here = alpha[self.idx(i, j)];
            options.clear();
            for &m in &self.crf.moves {
                if let Some((pi, pj)) = Self::pred(m, i, j) {
                    let a = alpha[self.idx(pi, pj)];
                    if a > f64::NEG_INFINITY {
                        options.push((m, (a + self.theta(m, i, j) - here).exp()));
                    }
                }
            }
            let Some(&(fallback, _)) = options.last() else {
                break;
            };
            let mut u: f64 = rng.gen();
            let mut chosen = fallback;
            for &(m, p) in &options {
                if u < p {
                    chosen = m;
                    break;
                }
                u -= p;
            }
            let (di, dj) = chosen.offset();
            i -= di;
            j -= dj;
            cells.push((i, j));
        }
        cells.reverse();
        cells
    }

    /// Score of the path visiting exactly `cells` (in lexicographic order), or `-inf`.
    fn path_score(&self, cells: &[(usize, usize)]) -> f64 {
        let (Some(&first), Some(&last)) = (cells.first(), cells.last()) else {
            return f64::NEG_INFINITY;
        };
        if first != (0, 0) || last != (self.rows - 1, self.cols - 1) {
            return f64::NEG_INFINITY;
        }
        let mut score = self.start();
        for w in cells.windows(2) {
            let ((pi, pj), (i, j)) = (w[0], w[1]);
            if i < pi || j < pj {
                return f64::NEG_INFINITY;
            }
            let step = (i - pi, j - pj);
            match self.crf.moves.iter().find(|m| m.offset() == step) {
                Some(&m) => score += self.theta(m, i, j),
                None => return f64::NEG_INFINITY,
            }
        }
        score
    }
}

fn write_path(buf: &mut [f64], cols: usize, cells: &[(usize, usize)]) {
    for &(i, j) in cells {
        buf[i * cols + j] = 1.0;
    }
}

fn resolve_lengths(
    layout: &Layout,
    lengths: Option<&ArrayD<usize>>,
    max: usize,
    axis: &'static str,
) -> Result<Vec<usize>> {
    let lengths = match lengths {
        Some(l) => layout.flatten_lengths(l)?,
        None => vec![max; layout.batch_size()],
    };
    for (index, &length) in lengths.iter().enumerate() {
        if length == 0 || length > max {
            return Err(Error::LengthOutOfRange {
                axis,
                index,
                length,
                max,
            });
        }
    }
    Ok(lengths)
}

impl GeneralMonotoneAlignmentCrf {
    /// Build the distribution.
    ///
    /// All tensors must share the shape `[...batch, rows, cols]`; lengths have the batch
    /// shape and default to the full axis sizes.
    pub fn new(
        horizontal: Vec<ArrayD<f64>>,
        vertical: Option<ArrayD<f64>>,
        lengths_rows: Option<ArrayD<usize>>,
        lengths_cols: Option<ArrayD<usize>>,
    ) -> Result<Self> {
        let first = horizontal.first().ok_or(Error::NoHorizontal)?;
        let layout = Layout::of(first.shape())?;

        let horizontal = horizontal
            .iter()
            .map(|h| layout.flatten(h))
            .collect::<tensor::Result<Vec<_>>>()?;
        let vertical = vertical.as_ref().map(|v| layout.flatten(v)).transpose()?;

        let mut moves: Vec<Move> = (0..horizontal.len()).map(Move::Horizontal).collect();
        if vertical.is_some() {
            moves.push(Move::Vertical);
        }

        let lengths_rows = resolve_lengths(&layout, lengths_rows.as_ref(), layout.rows, "row")?;
        let lengths_cols =
            resolve_lengths(&layout, lengths_cols.as_ref(), layout.cols, "column")?;

        Ok(Self {
            layout,
            horizontal,
            vertical,
            moves,
            lengths_rows,
            lengths_cols,
        })
    }

    /// `[rows, cols]`.
    pub fn event_shape(&self) -> Vec<usize> {
        self.layout.event_shape()
    }

    /// Leading batch dimensions.
    pub fn batch_shape(&self) -> Vec<usize> {
        self.layout.batch_shape.clone()
    }

    /// Moves available to a path, in tie-breaking order.
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    fn potential(&self, m: Move, b: usize, i: usize, j: usize) -> f64 {
        match m {
            Move::Horizontal(k) => self.horizontal[k][[b, i, j]],
            Move::Vertical => self
                .vertical
                .as_ref()
                .map_or(f64::NEG_INFINITY, |v| v[[b, i, j]]),
        }
    }

    fn lattice(&self, b: usize) -> Lattice<'_> {
        Lattice {
            crf: self,
            b,
            rows: self.lengths_rows[b],
            cols: self.lengths_cols[b],
        }
    }

    fn event_size(&self) -> usize {
        self.layout.rows * self.layout.cols
    }

    fn log_partition_flat(&self) -> Vec<f64> {
        (0..self.layout.batch_size())
            .map(|b| {
                let lat = self.lattice(b);
                lat.forward()[lat.last()]
            })
            .collect()
    }

    /// \(\log Z\) per batch element; `-inf` when no path fits the lengths.
    pub fn log_partition(&self) -> Result<ArrayD<f64>> {
        Ok(from_flat(
            self.layout.batch_shape.clone(),
            self.log_partition_flat(),
        )?)
    }

    /// Subtract \(\log Z\) from scores whose trailing dims equal the batch shape.
    pub fn normalize_log_probs(&self, scores: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        let shape = scores.shape();
        let nb = self.layout.batch_shape.len();
        if shape.len() < nb || shape[shape.len() - nb..] != self.layout.batch_shape[..] {
            return Err(tensor::Error::ShapeMismatch {
                expected: self.layout.batch_shape.clone(),
                got: shape.to_vec(),
            }
            .into());
        }
        let log_z = self.log_partition_flat();
        let bsz = log_z.len();
        let data = scores
            .iter()
            .enumerate()
            .map(|(n, &s)| s - log_z[n % bsz])
            .collect();
        Ok(from_flat(shape.to_vec(), data)?)
    }

    /// Score of the path whose visited cells are the non-zero entries of `event`.
    ///
    /// Returns `-inf` for events that are not a legal path under the lengths.
    pub fn unnormalized_log_prob(&self, event: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        let flat = self.layout.flatten(event)?;
        let mut out = Vec::with_capacity(self.layout.batch_size());
        for (b, slab) in flat.outer_iter().enumerate() {
            let lat = self.lattice(b);
            let mut cells = Vec::new();
            let mut inside = true;
            for ((i, j), &v) in slab.indexed_iter() {
                if v == 0.0 {
                    continue;
                }
                if v != 1.0 {
                    return Err(Error::NonBinaryEvent(v));
                }
                if i >= lat.rows || j >= lat.cols {
                    inside = false;
                }
                cells.push((i, j));
            }
            out.push(if inside {
                lat.path_score(&cells)
            } else {
                f64::NEG_INFINITY
            });
        }
        Ok(from_flat(self.layout.batch_shape.clone(), out)?)
    }

    /// Normalized log-probability of `event`.
    pub fn log_prob(&self, event: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        let scores = self.unnormalized_log_prob(event)?;
        self.normalize_log_probs(&scores)
    }

    /// Probability that each cell is visited.
    pub fn marginals(&self) -> Result<ArrayD<f64>> {
        let size = self.event_size();
        let mut data = vec![0.0; self.layout.batch_size() * size];
        for (b, chunk) in data.chunks_mut(size.max(1)).enumerate() {
            let (_, per_move) = self.lattice(b).template_marginals();
            for mu in &per_move {
                for (c, &p) in chunk.iter_mut().zip(mu) {
                    *c += p;
                }
            }
        }
        Ok(from_flat(self.layout.full_shape(), data)?)
    }

    /// Probability of entering each cell through each move.
    pub fn marginals_for_template_variables(&self) -> Result<TemplateMarginals> {
        let size = self.event_size();
        let bsz = self.layout.batch_size();
        let mut per_move = vec![vec![0.0; bsz * size]; self.moves.len()];
        for b in 0..bsz {
            let (_, mus) = self.lattice(b).template_marginals();
            for (dst, mu) in per_move.iter_mut().zip(mus) {
                dst[b * size..(b + 1) * size].copy_from_slice(&mu);
            }
        }
        let mut tensors = per_move
            .into_iter()
            .map(|d| from_flat(self.layout.full_shape(), d))
            .collect::<tensor::Result<Vec<_>>>()?;
        let vertical = if self.vertical.is_some() {
            tensors.pop()
        } else {
            None
        };
        Ok(TemplateMarginals {
            horizontal: tensors,
            vertical,
        })
    }

    /// Highest-scoring path per batch element (all zeros when no path exists).
    pub fn argmax(&self) -> Result<ArrayD<f64>> {
        let (events, _) = self.k_best_flat(1)?;
        Ok(from_flat(self.layout.full_shape(), events)?)
    }

    /// The `k` best paths: events `[k, ...batch, rows, cols]`, scores `[k, ...batch]`.
    ///
    /// Scores are sorted descending; slots beyond the number of existing paths hold
    /// `-inf` and an all-zero event.
    pub fn top_k(&self, k: usize) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (events, scores) = self.k_best_flat(k)?;
        Ok((
            from_flat(self.layout.prefixed_shape(&[k]), events)?,
            from_flat(self.layout.prefixed_batch_shape(&[k]), scores)?,
        ))
    }

    fn k_best_flat(&self, k: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        if k == 0 {
            return Err(Error::ZeroK);
        }
        let size = self.event_size();
        let bsz = self.layout.batch_size();
        let mut events = vec![0.0; k * bsz * size];
        let mut scores = vec![f64::NEG_INFINITY; k * bsz];
        for b in 0..bsz {
            let lat = self.lattice(b);
            let table = lat.k_best(k);
            for (r, h) in table[lat.last()].iter().enumerate() {
                let off = (r * bsz + b) * size;
                write_path(
                    &mut events[off..off + size],
                    self.layout.cols,
                    &lat.backtrack(&table, r),
                );
                scores[r * bsz + b] = h.score;
            }
        }
        Ok((events, scores))
    }

    /// Draw paths by forward-filtering backward-sampling.
    ///
    /// Output shape is `[...sample_shape, ...batch, rows, cols]`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        sample_shape: &[usize],
    ) -> Result<ArrayD<f64>> {
        let n_samples: usize = sample_shape.iter().product();
        let size = self.event_size();
        let bsz = self.layout.batch_size();
        let mut data = vec![0.0; n_samples * bsz * size];
        for b in 0..bsz {
            let lat = self.lattice(b);
            let alpha = lat.forward();
            if alpha[lat.last()] == f64::NEG_INFINITY {
                continue;
            }
            for s in 0..n_samples {
                let off = (s * bsz + b) * size;
                let cells = lat.sample_path(&alpha, rng);
                write_path(&mut data[off..off + size], self.layout.cols, &cells);
            }
        }
        Ok(from_flat(self.layout.prefixed_shape(sample_shape), data)?)
    }

    /// \(\sum_\theta \mu_\theta \cdot \theta'\) for batch element `b`, with `theta_src`
    /// supplying \(\theta'\).
    fn expected_score(&self, b: usize, mus: &[Vec<f64>], theta_src: &Self) -> f64 {
        let cols = self.layout.cols;
        let mut total = 0.0;
        for (mi, &m) in self.moves.iter().enumerate() {
            for (n, &p) in mus[mi].iter().enumerate() {
                total += mul_finite(p, theta_src.potential(m, b, n / cols, n % cols));
            }
        }
        total
    }

    /// Entropy per batch element (zero when no path exists).
    pub fn entropy(&self) -> Result<ArrayD<f64>> {
        let out = (0..self.layout.batch_size())
            .map(|b| {
                let (log_z, mus) = self.lattice(b).template_marginals();
                if log_z == f64::NEG_INFINITY {
                    0.0
                } else {
                    log_z - self.expected_score(b, &mus, self)
                }
            })
            .collect();
        Ok(from_flat(self.layout.batch_shape.clone(), out)?)
    }

    fn check_comparable(&self, other: &Self) -> Result<()> {
        if self.layout != other.layout {
            return Err(Error::Incompatible("shapes differ"));
        }
        if self.moves != other.moves {
            return Err(Error::Incompatible("move sets differ"));
        }
        if self.lengths_rows != other.lengths_rows || self.lengths_cols != other.lengths_cols {
            return Err(Error::Incompatible("lengths differ"));
        }
        Ok(())
    }

    /// \(H(p, q) = -\mathbb{E}_p[\log q]\) with `self` as \(p\).
    pub fn cross_entropy(&self, other: &Self) -> Result<ArrayD<f64>> {
        self.check_comparable(other)?;
        let q_log_z = other.log_partition_flat();
        let out = (0..self.layout.batch_size())
            .map(|b| {
                let (p_log_z, mus) = self.lattice(b).template_marginals();
                if p_log_z == f64::NEG_INFINITY {
                    0.0
                } else if q_log_z[b] == f64::NEG_INFINITY {
                    f64::INFINITY
                } else {
                    q_log_z[b] - self.expected_score(b, &mus, other)
                }
            })
            .collect();
        Ok(from_flat(self.layout.batch_shape.clone(), out)?)
    }

    /// \(\mathrm{KL}(p \,\|\, q) = H(p, q) - H(p)\) with `self` as \(p\).
    pub fn kl_divergence(&self, other: &Self) -> Result<ArrayD<f64>> {
        let ce = self.cross_entropy(other)?;
        let h = self.entropy()?;
        Ok(ce - h)
    }
}
