//! Distributions over alignments between two sequences.
//!
//! An alignment is a binary `rows × cols` matrix linking positions of two sequences.
//! This crate computes, for batches of per-cell log-potentials, the quantities needed
//! by gradient-based learning: partition functions, marginals (which are the
//! gradients of the log-partition), MAP alignments, k-best lists, samples, entropies
//! and divergences.
//!
//! - [`alignment`]: [`AlignmentCrf`], the entry point, with monotone one-to-many,
//!   monotone many-to-many, and non-monotone one-to-one regimes.
//! - [`monotone`]: the general monotone alignment CRF (forward-backward in the log
//!   semiring, k-best Viterbi, backward sampling).
//! - [`non_monotone`]: MAP inference over permutations as an opaque,
//!   zero-gradient operation.
//! - [`matching`]: maximum-weight perfect matching with forced/forbidden pairs.
//!
//! Public invariants (must not change):
//! - Tensors are `ndarray::ArrayD<f64>` shaped `[...batch, rows, cols]`; lengths are
//!   `ArrayD<usize>` shaped `[...batch]`.
//! - Numeric code is deterministic. Only `sample` consumes randomness, from a
//!   caller-supplied RNG.
//! - Construction arguments are validated up front; operations never mutate.

pub mod alignment;
pub mod matching;
pub mod monotone;
pub mod non_monotone;
pub mod special;
pub mod tensor;

/// Re-export the commonly-used types at crate root for demos.
pub use alignment::{AlignmentCrf, AlignmentType};
pub use monotone::{GeneralMonotoneAlignmentCrf, TemplateMarginals};
