//! Sentence alignment demo (monotone one-to-many CRF).
//!
//! A clean reference text has fewer sentences than a noisy scrape of it. Every noisy
//! sentence belongs to exactly one reference sentence, in order, so the alignment is
//! monotone one-to-many: rows are reference sentences, columns are noisy sentences.
//!
//! This example uses:
//! - char trigram hashing to embed sentences
//! - scaled cosine similarity as per-cell log-potentials
//! - `AlignmentCrf` for the MAP alignment, cell marginals and entropy

use alignop::{AlignmentCrf, AlignmentType};
use ndarray::{Array1, ArrayD, IxDyn};

fn embed(text: &str, dim: usize) -> Array1<f64> {
    let mut v = Array1::<f64>::zeros(dim);
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    for w in chars.windows(3) {
        let h = (w[0] as usize * 31 * 31 + w[1] as usize * 31 + w[2] as usize) % dim;
        v[h] += 1.0;
    }
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v /= norm;
    }
    v
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split_inclusive(['.', '!', '?'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ref_text = "Quarterly earnings showed steady growth. Revenue was up 12% year-over-year. Guidance remains unchanged.";
    let noisy_text = "Qarterly earnigns showd stdy grwth. Growth was broad. Revnue +12 percent YoY. Up from last year. Guidance remains unchngd.";

    let rows = split_sentences(ref_text);
    let cols = split_sentences(noisy_text);
    let dim = 256;
    let rv: Vec<_> = rows.iter().map(|s| embed(s, dim)).collect();
    let cv: Vec<_> = cols.iter().map(|s| embed(s, dim)).collect();

    let temperature = 0.1;
    let lp = ArrayD::from_shape_fn(IxDyn(&[rows.len(), cols.len()]), |ix| {
        rv[ix[0]].dot(&cv[ix[1]]) / temperature
    });

    let crf = AlignmentCrf::new(lp, None, None, AlignmentType::MonotoneOneToMany)?;
    let (best, score) = crf.argmax_and_max()?;
    let marginals = crf.marginals()?;
    let entropy = crf.entropy()?;

    println!("MAP alignment (score {:.3}):", score[IxDyn(&[])]);
    for (j, noisy) in cols.iter().enumerate() {
        let i = (0..rows.len()).find(|&i| best[[i, j]] == 1.0).unwrap_or(0);
        println!("  noisy[{j}] -> ref[{i}]  p={:.3}", marginals[[i, j]]);
        println!("    ref  : {}", rows[i]);
        println!("    noisy: {noisy}");
    }
    println!();
    println!("entropy = {:.4}", entropy[IxDyn(&[])]);
    Ok(())
}
