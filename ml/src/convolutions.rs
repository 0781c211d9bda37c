use crate::{
    ConvKernel, FeatureMaps, ImagePrecision, ModelError, ModelResult, WeightPrecision,
};
use ndarray::*;

/// Rust implementation of a convolutional layer with zero padding and a bias per output channel.
/// The weight matrix shall have dimension (in that order)
/// output channels x input channels x kernel height x kernel width
/// (to comply with the order in which pytorch weights are saved).
#[derive(Debug, Clone)]
pub struct ConvolutionLayer {
    /// Weight matrix of the kernel
    kernel: ConvKernel,
    bias: Array1<WeightPrecision>,
    kernel_width: usize,
    kernel_height: usize,
    stride: usize,
    padding: usize,
    num_input_channels: usize,
    num_output_channels: usize,
}

impl ConvolutionLayer {
    pub fn new(
        weights: ConvKernel,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: usize,
    ) -> ConvolutionLayer {
        let num_output_channels = weights.len_of(Axis(0)); // Filters
        let num_input_channels = weights.len_of(Axis(1)); // Channels
        let kernel_height = weights.len_of(Axis(2)); // Height
        let kernel_width = weights.len_of(Axis(3)); // Width

        debug_assert!(stride > 0, "Stride of 0 passed");
        debug_assert_eq!(bias.len(), num_output_channels, "One bias per filter");

        ConvolutionLayer {
            // im2col needs the filters flattened, which only works on standard layout
            kernel: weights.as_standard_layout().into_owned(),
            bias,
            kernel_width,
            kernel_height,
            stride,
            num_input_channels,
            num_output_channels,
            padding,
        }
    }

    /// Convolution with stride 1 and padding (kernel_size - 1) / 2, which keeps the
    /// spatial size of the input for odd kernels.
    pub fn same(weights: ConvKernel, bias: Array1<WeightPrecision>) -> ConvolutionLayer {
        let padding = (weights.len_of(Axis(2)) - 1) / 2;
        ConvolutionLayer::new(weights, bias, 1, padding)
    }

    pub fn num_output_channels(&self) -> usize {
        self.num_output_channels
    }

    pub fn num_parameters(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }

    /// Spatial output size for an input of the given size.
    /// new_h = (H + 2 * P - HH) / S + 1
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let new_height = (height + 2 * self.padding - self.kernel_height) / self.stride + 1;
        let new_width = (width + 2 * self.padding - self.kernel_width) / self.stride + 1;
        (new_height, new_width)
    }

    /// Calls `visit` with the kernel (`<prefix>.weight`) and the bias (`<prefix>.bias`).
    pub fn visit_parameters<F>(&self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewD<WeightPrecision>),
    {
        visit(&format!("{}.weight", prefix), self.kernel.view().into_dyn());
        visit(&format!("{}.bias", prefix), self.bias.view().into_dyn());
    }

    pub fn visit_parameters_mut<F>(&mut self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewMutD<WeightPrecision>),
    {
        visit(&format!("{}.weight", prefix), self.kernel.view_mut().into_dyn());
        visit(&format!("{}.bias", prefix), self.bias.view_mut().into_dyn());
    }

    /// Performs a convolution on every image of the batch using this layers parameters.
    /// Each image is converted to im2col format, so that the convolution becomes a single
    /// matrix product (read more here).
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    pub fn convolve(&self, images: &FeatureMaps) -> ModelResult<FeatureMaps> {
        let (batch, channels, height, width) = images.dim();
        if channels != self.num_input_channels
            || height + 2 * self.padding < self.kernel_height
            || width + 2 * self.padding < self.kernel_width
        {
            return Err(ModelError::shape_mismatch(
                "convolution",
                format!(
                    "(batch, {}, >= {}, >= {})",
                    self.num_input_channels,
                    self.kernel_height.saturating_sub(2 * self.padding),
                    self.kernel_width.saturating_sub(2 * self.padding)
                ),
                images.shape(),
            ));
        }

        let (new_height, new_width) = self.output_size(height, width);
        let mut output = Array4::zeros((batch, self.num_output_channels, new_height, new_width));
        for (image, mut convolved) in images.outer_iter().zip(output.outer_iter_mut()) {
            convolved.assign(&self.conv_2d(image)?);
        }
        Ok(output)
    }

    /// Convolves a single (C, H, W) image. Weights.shape = [F, C, HH, WW]
    fn conv_2d(&self, image: ArrayView3<ImagePrecision>) -> ModelResult<Array3<ImagePrecision>> {
        let (channels, height, width) = image.dim();
        let (new_height, new_width) = self.output_size(height, width);

        let padded = self.pad(image);
        let im_col = self.im2col(padded.view(), new_height, new_width)?;

        // weights.reshape(F, C*HH*WW)
        let filter_col = self.kernel.view().into_shape((
            self.num_output_channels,
            channels * self.kernel_height * self.kernel_width,
        ))?;

        let bias = self.bias.view().insert_axis(Axis(1));
        let activations = filter_col.dot(&im_col) + &bias;
        Ok(activations.into_shape((self.num_output_channels, new_height, new_width))?)
    }

    /// Surrounds every channel with `padding` zeros on each side.
    fn pad(&self, image: ArrayView3<ImagePrecision>) -> Array3<ImagePrecision> {
        let (channels, height, width) = image.dim();
        let p = self.padding;
        let mut padded = Array3::zeros((channels, height + 2 * p, width + 2 * p));
        // https://github.com/rust-ndarray/ndarray/issues/823
        padded
            .slice_mut(s![.., p..p + height, p..p + width])
            .assign(&image);
        padded
    }

    /// Builds the (C*HH*WW, H'*W') patch matrix. Row (c, i, j) holds the input pixel that
    /// kernel position (c, i, j) sees for every output location, so the row order matches
    /// the flattened kernel.
    fn im2col(
        &self,
        padded: ArrayView3<ImagePrecision>,
        new_height: usize,
        new_width: usize,
    ) -> ModelResult<Array2<ImagePrecision>> {
        let channels = padded.len_of(Axis(0));
        let rows = channels * self.kernel_height * self.kernel_width;
        let row_span = (new_height - 1) * self.stride + 1;
        let col_span = (new_width - 1) * self.stride + 1;

        let mut cols: Array3<ImagePrecision> = Array::zeros((rows, new_height, new_width));
        for c in 0..channels {
            for i in 0..self.kernel_height {
                for j in 0..self.kernel_width {
                    let row = (c * self.kernel_height + i) * self.kernel_width + j;
                    let patch = padded.slice(s![
                        c,
                        i..i + row_span;self.stride,
                        j..j + col_span;self.stride
                    ]);
                    cols.slice_mut(s![row, .., ..]).assign(&patch);
                }
            }
        }
        Ok(cols.into_shape((rows, new_height * new_width))?)
    }

    /// Naive implementation of 2d convolution for reference implementations
    #[cfg(test)]
    fn conv_2d_naive(&self, image: ArrayView3<ImagePrecision>) -> Array3<ImagePrecision> {
        let (_, height, width) = image.dim();
        let (new_height, new_width) = self.output_size(height, width);
        let padded = self.pad(image);

        let mut ret = Array::zeros((self.num_output_channels, new_height, new_width));
        for f in 0..self.num_output_channels {
            let kernel = self.kernel.slice(s![f, .., .., ..]);
            for i in 0..new_height {
                let i_with_stride = i * self.stride;
                for j in 0..new_width {
                    let j_with_stride = j * self.stride;
                    let imslice = padded.slice(s![
                        ..,
                        i_with_stride..(i_with_stride + self.kernel_height),
                        j_with_stride..(j_with_stride + self.kernel_width)
                    ]);
                    ret[[f, i, j]] = (&imslice * &kernel).sum() + self.bias[f];
                }
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(image: Array3<ImagePrecision>) -> FeatureMaps {
        image.insert_axis(Axis(0))
    }

    #[test]
    fn test_2d_conv_with_stride() {
        let test_img = array![[[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]]];
        let kernel = Array::from_shape_vec((1, 1, 1, 1), vec![1.]).unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, array![0.], 2, 0);

        let convolved_image = conv_layer.convolve(&batch_of(test_img)).unwrap();

        assert_eq!(convolved_image, batch_of(array![[[0., 0.], [-1., 0.]]]));
    }

    #[test]
    fn test_2d_conv() {
        let channel = array![
            [1.0, 2.0, 3.0, 4.0],
            [4.0, 5.0, 6.0, 7.0],
            [7.0, 8.0, 9.0, 9.0],
            [7.0, 8.0, 9.0, 9.0]
        ];
        let test_img = stack![Axis(0), channel, channel, channel];
        let kernel = Array::from_shape_vec(
            (1, 3, 2, 2),
            vec![1., 2., 1., 2., 1., 2., 1., 2., 1., 2., 1., 2.],
        )
        .unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, array![0.], 1, 0);
        let output = batch_of(array![[
            [57.0, 75.0, 93.0],
            [111.0, 129.0, 141.0],
            [138.0, 156.0, 162.0],
        ]]);

        let convolved_image = conv_layer.convolve(&batch_of(test_img)).unwrap();

        assert_eq!(convolved_image, output);
    }

    #[test]
    fn test_same_padding_keeps_size_and_adds_bias() {
        let test_img = array![[[1., 2., 3.], [4., 5., 6.], [7., 8., 9.]]];
        let kernel = Array::ones((1, 1, 3, 3));
        let conv_layer = ConvolutionLayer::same(kernel, array![1.]);

        let convolved_image = conv_layer.convolve(&batch_of(test_img)).unwrap();

        let output = batch_of(array![[
            [13., 22., 17.],
            [28., 46., 34.],
            [25., 40., 29.]
        ]]);
        assert_eq!(convolved_image, output);
    }

    #[test]
    fn test_im2col_matches_naive_convolution() {
        let kernel = Array::from_shape_fn((4, 2, 3, 3), |(f, c, i, j)| {
            (f as f32 - 1.5) * 0.5 + (c * 9 + i * 3 + j) as f32 * 0.25 - 2.0
        });
        let bias = array![0.5, -1.0, 0.0, 2.0];
        let image = Array::from_shape_fn((2, 6, 5), |(c, i, j)| {
            ((c * 30 + i * 5 + j) % 7) as f32 - 3.0
        });

        for &(stride, padding) in &[(1, 1), (1, 0), (2, 1)] {
            let conv_layer = ConvolutionLayer::new(kernel.clone(), bias.clone(), stride, padding);
            let fast = conv_layer.convolve(&batch_of(image.clone())).unwrap();
            let naive = conv_layer.conv_2d_naive(image.view());
            assert_eq!(fast.index_axis(Axis(0), 0), naive);
        }
    }

    #[test]
    fn test_filters_map_to_output_channels() {
        // Filter 0 copies channel 1, filter 1 negates channel 0
        let mut kernel = Array4::zeros((2, 2, 1, 1));
        kernel[[0, 1, 0, 0]] = 1.;
        kernel[[1, 0, 0, 0]] = -1.;
        let conv_layer = ConvolutionLayer::same(kernel, array![0., 0.]);
        let image = array![[[1., 2.], [3., 4.]], [[5., 6.], [7., 8.]]];

        let convolved_image = conv_layer.convolve(&batch_of(image)).unwrap();

        let output = batch_of(array![[[5., 6.], [7., 8.]], [[-1., -2.], [-3., -4.]]]);
        assert_eq!(convolved_image, output);
    }

    #[test]
    fn test_batch_is_convolved_per_image() {
        let kernel = Array::ones((1, 1, 3, 3));
        let conv_layer = ConvolutionLayer::same(kernel, array![0.]);
        let first = array![[[1., 0.], [0., 0.]]];
        let second = array![[[0., 0.], [0., 2.]]];
        let batch = stack![Axis(0), first, second];

        let convolved = conv_layer.convolve(&batch).unwrap();

        assert_eq!(
            convolved.index_axis(Axis(0), 0),
            conv_layer.convolve(&batch_of(first)).unwrap().index_axis(Axis(0), 0)
        );
        assert_eq!(
            convolved.index_axis(Axis(0), 1),
            conv_layer.convolve(&batch_of(second)).unwrap().index_axis(Axis(0), 0)
        );
    }

    #[test]
    fn test_wrong_channel_count_is_rejected() {
        let conv_layer = ConvolutionLayer::same(Array::zeros((4, 3, 3, 3)), Array::zeros(4));
        let images = Array4::zeros((1, 2, 8, 8));

        match conv_layer.convolve(&images) {
            Err(ModelError::ShapeMismatch { found, .. }) => assert_eq!(found, vec![1, 2, 8, 8]),
            other => panic!("Expected a shape mismatch, got {:?}", other),
        }
    }
}
