//! Activation functions of the keypoint network.
use crate::FeatureMaps;

/// Relu implementation. Negative values are clamped to zero, NaN is passed on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReluLayer {}

impl ReluLayer {
    pub fn new() -> Self {
        Self {}
    }

    /// Reuses the buffer of the input.
    pub fn activate_inplace(&self, mut x: FeatureMaps) -> FeatureMaps {
        x.mapv_inplace(|a| if a < 0. { 0. } else { a });
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::*;

    #[test]
    fn test_relu() {
        let x = Array::from_shape_vec((1, 1, 2, 2), vec![1., -2., 3., -4.]).unwrap();
        let out = Array::from_shape_vec((1, 1, 2, 2), vec![1., 0., 3., 0.]).unwrap();
        let relu_layer = ReluLayer::new();
        assert_eq!(relu_layer.activate_inplace(x), out);
    }

    #[test]
    fn test_relu_passes_nan_on() {
        let x = Array::from_shape_vec((1, 1, 1, 3), vec![f32::NAN, -0.5, 0.5]).unwrap();
        let out = ReluLayer::new().activate_inplace(x);
        assert!(out[[0, 0, 0, 0]].is_nan());
        assert_eq!(out[[0, 0, 0, 1]], 0.);
        assert_eq!(out[[0, 0, 0, 2]], 0.5);
    }
}
