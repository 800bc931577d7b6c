//! Shannon-entropy detector over Unicode scalar values.
//!
//! At the default `entropy_threshold` of 7.0 bits per character only values
//! drawing on a wide alphabet (raw binary, mixed-script text) are flagged.
//! Base64 cannot exceed 6 bits and hex 4, so catching those encodings needs a
//! lower threshold.

use std::collections::HashMap;

use crate::models::context::{FlattenLimits, SecurityContext};
use crate::models::detection::{DetectionResult, DetectorKind, Evidence};

/// Upper bound of per-character entropy used to normalise the score.
const MAX_BITS_PER_CHAR: f64 = 8.0;

/// Shannon entropy in bits per character.
pub fn shannon_entropy(value: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in value.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Score the highest-entropy string field. Fields under `threshold` bits/char
/// score zero.
pub fn analyze(
    context: &SecurityContext,
    limits: FlattenLimits,
    threshold: f64,
    max_confidence: f64,
) -> DetectionResult {
    let flat = context.flatten(limits);

    let mut best: Option<(&str, &str, f64)> = None;
    for (field, value) in &flat.fields {
        let entropy = shannon_entropy(value);
        if best.map_or(true, |(_, _, e)| entropy > e) {
            best = Some((field.as_str(), value.as_str(), entropy));
        }
    }

    match best {
        Some((field, value, entropy)) if entropy > threshold => {
            let confidence = (entropy / MAX_BITS_PER_CHAR).min(max_confidence);
            DetectionResult::new(
                DetectorKind::Entropy,
                confidence,
                vec![Evidence::new(
                    field,
                    format!("shannon_entropy={entropy:.3}"),
                    value,
                    confidence,
                )],
            )
        }
        _ => DetectionResult::empty(DetectorKind::Entropy),
    }
}
