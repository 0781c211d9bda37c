use ndarray::ShapeError;
use thiserror::Error;

use crate::weight_loader::WeightError;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Shape mismatch in {layer}: expected {expected}, got {found:?}.")]
    ShapeMismatch {
        layer: String,
        expected: String,
        found: Vec<usize>,
    },
    #[error("Got running statistics for {found} blocks, but the model has {expected}.")]
    StatisticsMismatch { expected: usize, found: usize },
    #[error("Could not reshape tensor:\n {0}.")]
    LayoutError(#[from] ShapeError),
    #[error("Could not load model parameters:\n {0}")]
    WeightError(#[from] WeightError),
}

impl ModelError {
    pub(crate) fn shape_mismatch<E: ToString>(layer: &str, expected: E, found: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            layer: layer.to_string(),
            expected: expected.to_string(),
            found: found.to_vec(),
        }
    }
}
