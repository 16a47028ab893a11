//! Confidence scoring for carved candidates

use crate::domain::entities::SizingOutcome;

const BASE: f32 = 0.25;
const SPECIFICITY_WEIGHT: f32 = 0.25;
const SIZED_BONUS: f32 = 0.25;
const STRUCTURE_BONUS: f32 = 0.25;
const STRUCTURE_PENALTY: f32 = 0.15;

/// Scores a carved candidate in [0, 1].
///
/// A longer header counts for more, a length backed by an embedded size
/// field or a footer adds a fixed bonus, and a structural check adds or
/// removes weight depending on its verdict. `structure` is `None` when the
/// format has no check.
pub fn carve_confidence(specificity: f32, sizing: SizingOutcome, structure: Option<bool>) -> f32 {
    let mut score = BASE + SPECIFICITY_WEIGHT * specificity.clamp(0.0, 1.0);
    if sizing != SizingOutcome::DefaultSize {
        score += SIZED_BONUS;
    }
    match structure {
        Some(true) => score += STRUCTURE_BONUS,
        Some(false) => score -= STRUCTURE_PENALTY,
        None => {}
    }
    score.clamp(0.0, 1.0)
}
