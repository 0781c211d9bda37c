//! Random parameter initialization, following Pytorch's defaults for convolutional and
//! linear layers: weights and biases are drawn from U(-1/sqrt(fan_in), 1/sqrt(fan_in)).
use ndarray::{Array, Dimension, ShapeBuilder};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::WeightPrecision;

/// Draws an array of the given shape from U(-1/sqrt(fan_in), 1/sqrt(fan_in)).
pub fn fan_in_uniform<R, Sh, D>(shape: Sh, fan_in: usize, rng: &mut R) -> Array<WeightPrecision, D>
where
    R: Rng + ?Sized,
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
{
    debug_assert!(fan_in > 0, "Fan in of 0 passed");
    let bound = 1.0 / (fan_in as WeightPrecision).sqrt();
    let distribution = Uniform::new_inclusive(-bound, bound);
    Array::from_shape_fn(shape, |_| distribution.sample(rng))
}
