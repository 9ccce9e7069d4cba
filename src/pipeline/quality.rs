use crate::common::PoseFeatureVector;

/// Components with magnitude below this count as missing landmarks.
pub const ZERO_EPSILON: f32 = 1e-6;
/// Scales population variance into the [0, 1] spread term.
pub const VARIANCE_SCALE: f32 = 1000.0;

const COVERAGE_WEIGHT: f32 = 0.7;
const SPREAD_WEIGHT: f32 = 0.3;

/// Usefulness of one feature vector in `[0, 1]`.
///
/// `0.7 * (1 - zero_fraction) + 0.3 * min(variance * K, 1)`. Non-finite
/// components are treated as missing. An empty vector scores 0.
pub fn score(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let cleaned: Vec<f64> = values
        .iter()
        .map(|v| if v.is_finite() { *v as f64 } else { 0.0 })
        .collect();

    let zeros = cleaned
        .iter()
        .filter(|v| v.abs() < ZERO_EPSILON as f64)
        .count();
    let zero_fraction = zeros as f64 / n;

    let mean = cleaned.iter().sum::<f64>() / n;
    let variance = cleaned.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let spread = (variance * VARIANCE_SCALE as f64).min(1.0);

    let raw = COVERAGE_WEIGHT as f64 * (1.0 - zero_fraction) + SPREAD_WEIGHT as f64 * spread;
    if raw.is_finite() {
        raw.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityAssessment {
    pub score: f32,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityScorer {
    expected_dimension: usize,
    threshold: f32,
}

impl QualityScorer {
    pub fn new(expected_dimension: usize, threshold: f32) -> Self {
        Self {
            expected_dimension,
            threshold,
        }
    }

    /// A vector of the wrong length is invalid no matter its score.
    pub fn assess(&self, vector: &PoseFeatureVector) -> QualityAssessment {
        let score = score(vector.values());
        let valid = vector.len() == self.expected_dimension && score >= self.threshold;
        QualityAssessment { score, valid }
    }
}
