//! Recover a shuffled ordering with the non-monotone one-to-one CRF.
//!
//! Two lists describe the same items in different orders. The argmax of the
//! non-monotone regime is the best bijection between them. A second batch element
//! declares a shorter length, so only its leading block is matched.

use alignop::{AlignmentCrf, AlignmentType};
use ndarray::{ArrayD, Axis, IxDyn};

fn overlap(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let common = a.windows(2).filter(|w| b.windows(2).any(|v| v == *w)).count();
    common as f64 / a.len().max(b.len()).max(1) as f64
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let left = ["carrot", "banana", "apple", "durian"];
    let right = ["apples", "durians", "carrots", "bananas"];
    let n = left.len();

    let lp = ArrayD::from_shape_fn(IxDyn(&[2, n, n]), |ix| overlap(left[ix[1]], right[ix[2]]));
    let lengths = ArrayD::from_shape_vec(IxDyn(&[2]), vec![n, 2])?;
    let crf = AlignmentCrf::new(lp, Some(lengths), None, AlignmentType::NonMonotoneOneToOne)?;

    let (best, scores) = crf.argmax_and_max()?;
    for (b, m) in best.axis_iter(Axis(0)).enumerate() {
        println!("batch {b} (score {:.3}):", scores[[b]]);
        for (i, word) in left.iter().enumerate() {
            if let Some(j) = (0..n).find(|&j| m[[i, j]] == 1.0) {
                println!("  {word:>8} <-> {}", right[j]);
            }
        }
    }

    // Sampling has no tractable form for permutations.
    let mut rng = rand::thread_rng();
    if let Err(e) = crf.sample(&mut rng, &[1]) {
        println!();
        println!("sample: {e}");
    }
    Ok(())
}
