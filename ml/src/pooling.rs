use ndarray::*;

use crate::{FeatureMaps, ImagePrecision, ModelError, ModelResult};

/// Non-overlapping max pooling: the window size equals the stride.
/// Rows and columns that do not fill a whole window are dropped, like Pytorch's
/// MaxPool2d with default settings. A NaN inside a window makes the pooled value NaN.
#[derive(Debug, Clone, Copy)]
pub struct MaxPoolLayer {
    size: usize,
}

impl MaxPoolLayer {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0, "Pooling window of size 0 passed");
        Self { size }
    }

    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        (height / self.size, width / self.size)
    }

    pub fn pool(&self, x: &FeatureMaps) -> ModelResult<FeatureMaps> {
        let (batch, channels, height, width) = x.dim();
        let (new_height, new_width) = self.output_size(height, width);
        if new_height == 0 || new_width == 0 {
            return Err(ModelError::shape_mismatch(
                "max pooling",
                format!("(batch, channels, >= {}, >= {})", self.size, self.size),
                x.shape(),
            ));
        }

        let k = self.size;
        let mut output = Array4::from_elem(
            (batch, channels, new_height, new_width),
            ImagePrecision::NEG_INFINITY,
        );
        // Every offset inside the window is a strided view of the same shape as the output
        for i in 0..k {
            for j in 0..k {
                let window = x.slice(s![.., .., i..new_height * k;k, j..new_width * k;k]);
                Zip::from(&mut output)
                    .and(&window)
                    .for_each(|pooled, &value| {
                        if value > *pooled || value.is_nan() {
                            *pooled = value;
                        }
                    });
            }
        }
        Ok(output)
    }
}
