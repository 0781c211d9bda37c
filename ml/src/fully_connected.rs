use crate::{Features, ImagePrecision, ModelError, ModelResult, WeightPrecision};
use ndarray::*;

/// Rust implementation of a feed forward layer without activation.
/// The weight matrix shall have dimension (in that order)
/// input units x output units. Pytorch stores linear weights the other way around,
/// so they are transposed when loaded.
#[derive(Debug, Clone)]
pub struct FeedforwardLayer {
    weights: Array2<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    input_dimension: usize,
}

impl FeedforwardLayer {
    pub fn new(weights: Array2<WeightPrecision>, bias: Array1<WeightPrecision>) -> Self {
        let (input_dimension, output_dimension) = weights.dim();
        debug_assert_eq!(bias.len(), output_dimension, "One bias per output unit");
        Self {
            weights,
            bias,
            input_dimension,
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    /// Applies the affine map to every row of the batch.
    pub fn forward_pass<'a, V>(&self, data: V) -> ModelResult<Features>
    where
        V: AsArray<'a, ImagePrecision, Ix2>,
    {
        let data_arr: ArrayView2<ImagePrecision> = data.into();
        if data_arr.ncols() != self.input_dimension {
            return Err(ModelError::shape_mismatch(
                "fully connected layer",
                format!("(batch, {})", self.input_dimension),
                data_arr.shape(),
            ));
        }
        Ok(data_arr.dot(&self.weights) + &self.bias)
    }

    /// Visits the weights as (output units, input units), the way Pytorch names and shapes them.
    pub fn visit_parameters<F>(&self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewD<WeightPrecision>),
    {
        visit(
            &format!("{}.weight", prefix),
            self.weights.view().reversed_axes().into_dyn(),
        );
        visit(&format!("{}.bias", prefix), self.bias.view().into_dyn());
    }

    pub fn visit_parameters_mut<F>(&mut self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewMutD<WeightPrecision>),
    {
        visit(
            &format!("{}.weight", prefix),
            self.weights.view_mut().reversed_axes().into_dyn(),
        );
        visit(&format!("{}.bias", prefix), self.bias.view_mut().into_dyn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_pass() {
        let layer = FeedforwardLayer::new(array![[1., 0., 2.], [0., 1., -1.]], array![0.5, 0., 1.]);
        let data = array![[1., 2.], [-1., 0.]];

        let out = layer.forward_pass(&data).unwrap();

        assert_eq!(out, array![[1.5, 2., 1.], [-0.5, 0., -1.]]);
    }

    #[test]
    fn test_forward_pass_rejects_wrong_width() {
        let layer = FeedforwardLayer::new(Array::zeros((4, 2)), Array::zeros(2));
        let data: Array2<f32> = Array::zeros((1, 3));

        assert!(layer.forward_pass(&data).is_err());
    }

    #[test]
    fn test_parameters_are_visited_in_pytorch_layout() {
        let layer = FeedforwardLayer::new(Array::zeros((4, 2)), Array::zeros(2));
        let mut shapes = vec![];
        layer.visit_parameters("fc", &mut |name: &str, arr: ArrayViewD<f32>| {
            shapes.push((name.to_string(), arr.shape().to_vec()))
        });
        assert_eq!(
            shapes,
            vec![
                ("fc.weight".to_string(), vec![2, 4]),
                ("fc.bias".to_string(), vec![2])
            ]
        );
    }
}
