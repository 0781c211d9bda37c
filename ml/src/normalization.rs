//! Channel-wise batch normalization (Ioffe & Szegedy, 2015, https://arxiv.org/abs/1502.03167).
//!
//! The layer behaves differently during training and inference. Which behavior is used is
//! always chosen explicitly by the caller through [`NormalizationMode`].
use ndarray::*;

use crate::{FeatureMaps, ImagePrecision, ModelError, ModelResult, WeightPrecision};

/// Same defaults as Pytorch's BatchNorm2d, so exported running statistics stay compatible.
pub const BATCH_NORM_EPSILON: WeightPrecision = 1e-5;
pub const BATCH_NORM_MOMENTUM: WeightPrecision = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationMode {
    /// Normalize with the frozen running statistics. Samples do not influence each other.
    Inference,
    /// Normalize with the statistics of the current batch.
    Training,
}

/// Per-channel statistics of one batch, as observed by a batch norm layer in training mode.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatistics {
    pub mean: Array1<ImagePrecision>,
    /// Unbiased variance, which is what enters the running estimate.
    pub variance: Array1<ImagePrecision>,
    /// Number of values per channel (batch * height * width)
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct BatchNormLayer {
    /// Learned scale
    gamma: Array1<WeightPrecision>,
    /// Learned shift
    beta: Array1<WeightPrecision>,
    running_mean: Array1<WeightPrecision>,
    running_var: Array1<WeightPrecision>,
    epsilon: WeightPrecision,
    momentum: WeightPrecision,
}

impl BatchNormLayer {
    pub fn new(
        gamma: Array1<WeightPrecision>,
        beta: Array1<WeightPrecision>,
        running_mean: Array1<WeightPrecision>,
        running_var: Array1<WeightPrecision>,
    ) -> Self {
        debug_assert!(
            gamma.len() == beta.len()
                && beta.len() == running_mean.len()
                && running_mean.len() == running_var.len(),
            "All batch norm parameters need one entry per channel"
        );
        Self {
            gamma,
            beta,
            running_mean,
            running_var,
            epsilon: BATCH_NORM_EPSILON,
            momentum: BATCH_NORM_MOMENTUM,
        }
    }

    /// Freshly initialized layer: unit scale, zero shift, zero mean and unit variance.
    pub fn identity(num_channels: usize) -> Self {
        Self::new(
            Array::ones(num_channels),
            Array::zeros(num_channels),
            Array::zeros(num_channels),
            Array::ones(num_channels),
        )
    }

    pub fn num_channels(&self) -> usize {
        self.gamma.len()
    }

    /// Only the affine parameters are learnable, the running statistics are not counted.
    pub fn num_parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    /// Normalizes every channel of the batch.
    ///
    /// In training mode the statistics of the batch are used and returned, so that the
    /// caller can fold them into the running estimate with [`BatchNormLayer::update_running_statistics`].
    /// In inference mode the running statistics are used and nothing is returned.
    pub fn normalize(
        &self,
        x: &FeatureMaps,
        mode: NormalizationMode,
    ) -> ModelResult<(FeatureMaps, Option<BatchStatistics>)> {
        let (batch, channels, height, width) = x.dim();
        if channels != self.num_channels() || batch == 0 {
            return Err(ModelError::shape_mismatch(
                "batch normalization",
                format!("(batch >= 1, {}, height, width)", self.num_channels()),
                x.shape(),
            ));
        }

        match mode {
            NormalizationMode::Inference => {
                let output = self.scale_and_shift(x, &self.running_mean, &self.running_var);
                Ok((output, None))
            }
            NormalizationMode::Training => {
                let count = batch * height * width;
                if count < 2 {
                    return Err(ModelError::shape_mismatch(
                        "batch normalization in training mode",
                        "more than one value per channel",
                        x.shape(),
                    ));
                }
                let mut mean = Array1::zeros(channels);
                let mut biased_variance = Array1::zeros(channels);
                for (c, values) in x.axis_iter(Axis(1)).enumerate() {
                    let channel_mean = values.sum() / count as ImagePrecision;
                    mean[c] = channel_mean;
                    biased_variance[c] = values
                        .fold(0.0, |acc, v| acc + (v - channel_mean).powi(2))
                        / count as ImagePrecision;
                }
                let output = self.scale_and_shift(x, &mean, &biased_variance);

                let correction = count as ImagePrecision / (count - 1) as ImagePrecision;
                let statistics = BatchStatistics {
                    mean,
                    variance: biased_variance * correction,
                    count,
                };
                Ok((output, Some(statistics)))
            }
        }
    }

    /// Folds the statistics of one batch into the running estimate
    /// (running = (1 - momentum) * running + momentum * observed).
    pub fn update_running_statistics(&mut self, statistics: &BatchStatistics) -> ModelResult<()> {
        if statistics.mean.len() != self.num_channels()
            || statistics.variance.len() != self.num_channels()
        {
            return Err(ModelError::shape_mismatch(
                "batch normalization statistics",
                self.num_channels(),
                &[statistics.mean.len(), statistics.variance.len()],
            ));
        }
        let momentum = self.momentum;
        Zip::from(&mut self.running_mean)
            .and(&statistics.mean)
            .for_each(|running, &observed| {
                *running = (1.0 - momentum) * *running + momentum * observed
            });
        Zip::from(&mut self.running_var)
            .and(&statistics.variance)
            .for_each(|running, &observed| {
                *running = (1.0 - momentum) * *running + momentum * observed
            });
        Ok(())
    }

    /// Visits gamma and beta under the Pytorch names `<prefix>.weight` and `<prefix>.bias`,
    /// followed by the running statistics.
    pub fn visit_parameters<F>(&self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewD<WeightPrecision>),
    {
        visit(&format!("{}.weight", prefix), self.gamma.view().into_dyn());
        visit(&format!("{}.bias", prefix), self.beta.view().into_dyn());
        visit(
            &format!("{}.running_mean", prefix),
            self.running_mean.view().into_dyn(),
        );
        visit(
            &format!("{}.running_var", prefix),
            self.running_var.view().into_dyn(),
        );
    }

    /// Mutable access to the learnable parameters only.
    pub fn visit_parameters_mut<F>(&mut self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewMutD<WeightPrecision>),
    {
        visit(&format!("{}.weight", prefix), self.gamma.view_mut().into_dyn());
        visit(&format!("{}.bias", prefix), self.beta.view_mut().into_dyn());
    }

    fn scale_and_shift(
        &self,
        x: &FeatureMaps,
        mean: &Array1<ImagePrecision>,
        variance: &Array1<ImagePrecision>,
    ) -> FeatureMaps {
        let mut output = x.to_owned();
        for (c, mut channel) in output.axis_iter_mut(Axis(1)).enumerate() {
            let scale = self.gamma[c] / (variance[c] + self.epsilon).sqrt();
            let shift = self.beta[c] - mean[c] * scale;
            channel.mapv_inplace(|v| v * scale + shift);
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close<D: Dimension>(a: &Array<f32, D>, b: &Array<f32, D>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4, "{} != {}", x, y);
        }
    }

    #[test]
    fn test_inference_uses_running_statistics() {
        let layer = BatchNormLayer::new(
            array![2., 1.],
            array![0., 1.],
            array![1., -1.],
            array![4., 1.],
        );
        let x = Array::from_shape_vec((1, 2, 1, 2), vec![1., 3., -1., 0.]).unwrap();

        let (y, statistics) = layer.normalize(&x, NormalizationMode::Inference).unwrap();

        assert!(statistics.is_none());
        let sqrt_4 = (4.0f32 + BATCH_NORM_EPSILON).sqrt();
        let sqrt_1 = (1.0f32 + BATCH_NORM_EPSILON).sqrt();
        let expected = Array::from_shape_vec(
            (1, 2, 1, 2),
            vec![0., 2. * 2. / sqrt_4, 1., 1. + 1. / sqrt_1],
        )
        .unwrap();
        assert_close(&y, &expected);
    }

    #[test]
    fn test_identity_layer_is_nearly_identity_in_inference() {
        let layer = BatchNormLayer::identity(3);
        let x = Array::from_shape_fn((2, 3, 2, 2), |(b, c, i, j)| (b + c + i + j) as f32 - 2.);

        let (y, _) = layer.normalize(&x, NormalizationMode::Inference).unwrap();

        assert_close(&y, &x);
    }

    #[test]
    fn test_training_normalizes_with_batch_statistics() {
        let layer = BatchNormLayer::identity(1);
        // Values 1..=4 over two samples
        let x = Array::from_shape_vec((2, 1, 1, 2), vec![1., 2., 3., 4.]).unwrap();

        let (y, statistics) = layer.normalize(&x, NormalizationMode::Training).unwrap();
        let statistics = statistics.unwrap();

        // Biased variance 1.25 normalizes, unbiased variance 5/3 is reported
        let std = (1.25f32 + BATCH_NORM_EPSILON).sqrt();
        let expected =
            Array::from_shape_vec((2, 1, 1, 2), vec![-1.5 / std, -0.5 / std, 0.5 / std, 1.5 / std])
                .unwrap();
        assert_close(&y, &expected);
        assert_eq!(statistics.count, 4);
        assert_close(&statistics.mean, &array![2.5]);
        assert_close(&statistics.variance, &array![5. / 3.]);
    }

    #[test]
    fn test_running_statistics_update_with_momentum() {
        let mut layer = BatchNormLayer::identity(2);
        let statistics = BatchStatistics {
            mean: array![1., -2.],
            variance: array![3., 1.],
            count: 8,
        };

        layer.update_running_statistics(&statistics).unwrap();

        assert_close(&layer.running_mean, &array![0.1, -0.2]);
        assert_close(&layer.running_var, &array![1.2, 1.0]);
    }

    #[test]
    fn test_wrong_channel_count_is_rejected() {
        let layer = BatchNormLayer::identity(4);
        let x = Array4::zeros((1, 3, 2, 2));

        assert!(layer.normalize(&x, NormalizationMode::Inference).is_err());
        assert!(layer.normalize(&x, NormalizationMode::Training).is_err());
    }

    #[test]
    fn test_training_needs_more_than_one_value_per_channel() {
        let layer = BatchNormLayer::identity(1);
        let x = Array::from_elem((1, 1, 1, 1), 3.0f32);

        assert!(matches!(
            layer.normalize(&x, NormalizationMode::Training),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(layer.normalize(&x, NormalizationMode::Inference).is_ok());
    }
}
