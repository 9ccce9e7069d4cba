use serde::{Deserialize, Serialize};

/// Per-frame pose landmark encoding produced by the engine's feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoseFeatureVector(Vec<f32>);

impl PoseFeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f32>> for PoseFeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

impl AsRef<[f32]> for PoseFeatureVector {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}
