//! The keypoint regression network: five reduction blocks (convolution, batch norm, relu,
//! 2x2 max pooling) followed by a single linear projection onto 68 (x, y) pairs.
use crate::{
    activation_functions::ReluLayer,
    convolutions::ConvolutionLayer,
    fully_connected::FeedforwardLayer,
    initialization::fan_in_uniform,
    keypoints::NUM_KEYPOINTS,
    normalization::{BatchNormLayer, BatchStatistics, NormalizationMode},
    pooling::MaxPoolLayer,
    weight_loader::{WeightLoader, WeightResult},
    FeatureMaps, Features, ModelError, ModelResult, WeightPrecision,
};
use log::{debug, info};
use ndarray::*;
use rand::Rng;

/// Side length of the square input images.
pub const INPUT_SIZE: usize = 224;
/// Grayscale input
pub const INPUT_CHANNELS: usize = 1;
/// Every block halves the spatial size.
const POOLING_WINDOW: usize = 2;

/// Layout of a single reduction block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub input_channels: usize,
    pub output_channels: usize,
    pub kernel_size: usize,
}

impl BlockSpec {
    pub const fn new(input_channels: usize, output_channels: usize, kernel_size: usize) -> Self {
        Self {
            input_channels,
            output_channels,
            kernel_size,
        }
    }

    pub fn padding(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    /// Side length after convolution and pooling of a square input with the given side length.
    pub fn output_size(&self, size: usize) -> usize {
        (size + 2 * self.padding() + 1).saturating_sub(self.kernel_size) / POOLING_WINDOW
    }

    /// Learnable parameters: kernel and bias of the convolution, scale and shift of the batch norm.
    pub fn num_parameters(&self) -> usize {
        let kernel = self.output_channels * self.input_channels * self.kernel_size.pow(2);
        kernel + self.output_channels + 2 * self.output_channels
    }
}

/// Static description of the network. Nothing here is learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    pub input_channels: usize,
    pub input_size: usize,
    pub blocks: Vec<BlockSpec>,
    pub num_outputs: usize,
}

impl Architecture {
    /// 224x224x1 -> 112x112x32 -> 56x56x64 -> 28x28x128 -> 14x14x256 -> 7x7x256 -> 136
    pub fn keypoint_regressor() -> Self {
        Self {
            input_channels: INPUT_CHANNELS,
            input_size: INPUT_SIZE,
            blocks: vec![
                BlockSpec::new(1, 32, 5),
                BlockSpec::new(32, 64, 3),
                BlockSpec::new(64, 128, 3),
                BlockSpec::new(128, 256, 3),
                BlockSpec::new(256, 256, 3),
            ],
            num_outputs: 2 * NUM_KEYPOINTS,
        }
    }

    /// (channels, height, width) of the output of every block.
    pub fn block_output_shapes(&self) -> Vec<(usize, usize, usize)> {
        let mut size = self.input_size;
        self.blocks
            .iter()
            .map(|block| {
                size = block.output_size(size);
                (block.output_channels, size, size)
            })
            .collect()
    }

    /// Width of the flattened feature vector that enters the projection,
    /// derived from the block layout.
    pub fn flattened_width(&self) -> usize {
        match self.block_output_shapes().last() {
            Some((channels, height, width)) => channels * height * width,
            None => self.input_channels * self.input_size * self.input_size,
        }
    }

    pub fn num_parameters(&self) -> usize {
        let blocks: usize = self.blocks.iter().map(BlockSpec::num_parameters).sum();
        blocks + (self.flattened_width() + 1) * self.num_outputs
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Self::keypoint_regressor()
    }
}

/// Name of the i-th (0 based) layer in the Pytorch `state_dict`.
fn layer_name(index: usize) -> String {
    format!("layer{}", index + 1)
}

/// Convolution -> batch norm -> relu -> max pooling.
/// (batch, C_in, H, W) -> (batch, C_out, H/2, W/2)
#[derive(Debug, Clone)]
pub struct ReductionBlock {
    convolution: ConvolutionLayer,
    normalization: BatchNormLayer,
    activation: ReluLayer,
    pooling: MaxPoolLayer,
}

impl ReductionBlock {
    pub fn new(convolution: ConvolutionLayer, normalization: BatchNormLayer) -> Self {
        debug_assert_eq!(
            convolution.num_output_channels(),
            normalization.num_channels(),
            "Batch norm has to cover every filter of the convolution"
        );
        Self {
            convolution,
            normalization,
            activation: ReluLayer::new(),
            pooling: MaxPoolLayer::new(POOLING_WINDOW),
        }
    }

    /// Randomly initialized block, see [`crate::initialization`].
    pub fn random<R: Rng + ?Sized>(spec: &BlockSpec, rng: &mut R) -> Self {
        let fan_in = spec.input_channels * spec.kernel_size.pow(2);
        let kernel = fan_in_uniform(
            (
                spec.output_channels,
                spec.input_channels,
                spec.kernel_size,
                spec.kernel_size,
            ),
            fan_in,
            rng,
        );
        let bias = fan_in_uniform(spec.output_channels, fan_in, rng);
        Self::new(
            ConvolutionLayer::same(kernel, bias),
            BatchNormLayer::identity(spec.output_channels),
        )
    }

    /// Loads a block stored under `<prefix>.0.*` (convolution) and `<prefix>.1.*` (batch norm).
    pub fn from_loader<L: WeightLoader>(
        spec: &BlockSpec,
        prefix: &str,
        loader: &mut L,
    ) -> WeightResult<Self> {
        let c_out = spec.output_channels;
        let kernel = loader.get_weight(
            &format!("{}.0.weight", prefix),
            (c_out, spec.input_channels, spec.kernel_size, spec.kernel_size),
        )?;
        let bias = loader.get_weight(&format!("{}.0.bias", prefix), c_out)?;

        let gamma = loader.get_weight(&format!("{}.1.weight", prefix), c_out)?;
        let beta = loader.get_weight(&format!("{}.1.bias", prefix), c_out)?;
        let running_mean = loader.get_weight(&format!("{}.1.running_mean", prefix), c_out)?;
        let running_var = loader.get_weight(&format!("{}.1.running_var", prefix), c_out)?;

        Ok(Self::new(
            ConvolutionLayer::same(kernel, bias),
            BatchNormLayer::new(gamma, beta, running_mean, running_var),
        ))
    }

    pub fn forward(
        &self,
        x: &FeatureMaps,
        mode: NormalizationMode,
    ) -> ModelResult<(FeatureMaps, Option<BatchStatistics>)> {
        let convolved = self.convolution.convolve(x)?;
        let (normalized, statistics) = self.normalization.normalize(&convolved, mode)?;
        let activated = self.activation.activate_inplace(normalized);
        Ok((self.pooling.pool(&activated)?, statistics))
    }

    pub fn num_parameters(&self) -> usize {
        self.convolution.num_parameters() + self.normalization.num_parameters()
    }

    fn visit_parameters<F>(&self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewD<WeightPrecision>),
    {
        self.convolution
            .visit_parameters(&format!("{}.0", prefix), visit);
        self.normalization
            .visit_parameters(&format!("{}.1", prefix), visit);
    }

    fn visit_parameters_mut<F>(&mut self, prefix: &str, visit: &mut F)
    where
        F: FnMut(&str, ArrayViewMutD<WeightPrecision>),
    {
        self.convolution
            .visit_parameters_mut(&format!("{}.0", prefix), visit);
        self.normalization
            .visit_parameters_mut(&format!("{}.1", prefix), visit);
    }
}

/// Output of a forward pass in training mode.
#[derive(Debug, Clone)]
pub struct TrainingPass {
    /// (batch, 136) raw regression values
    pub keypoints: Features,
    /// Batch statistics observed by each block, in block order
    pub statistics: Vec<BatchStatistics>,
}

/// Regresses 68 facial keypoints from a 224x224 grayscale image.
///
/// The struct owns all parameters. The forward passes only borrow it, every mutation goes
/// through a `&mut self` method and increases [`KeypointRegressor::version`].
#[derive(Debug, Clone)]
pub struct KeypointRegressor {
    architecture: Architecture,
    blocks: Vec<ReductionBlock>,
    projection: FeedforwardLayer,
    version: u64,
}

impl KeypointRegressor {
    /// Randomly initialized network with the fixed keypoint architecture.
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::with_architecture(Architecture::keypoint_regressor(), rng)
    }

    pub fn with_architecture<R: Rng + ?Sized>(architecture: Architecture, rng: &mut R) -> Self {
        let blocks = architecture
            .blocks
            .iter()
            .map(|spec| ReductionBlock::random(spec, &mut *rng))
            .collect();

        let width = architecture.flattened_width();
        let projection = FeedforwardLayer::new(
            fan_in_uniform((width, architecture.num_outputs), width, rng),
            fan_in_uniform(architecture.num_outputs, width, rng),
        );
        info!(
            "Initialized keypoint regressor with {} parameters",
            architecture.num_parameters()
        );

        Self {
            architecture,
            blocks,
            projection,
            version: 0,
        }
    }

    /// Network with the fixed keypoint architecture and trained parameters.
    pub fn from_loader<L: WeightLoader>(loader: &mut L) -> ModelResult<Self> {
        Self::from_loader_with_architecture(Architecture::keypoint_regressor(), loader)
    }

    pub fn from_loader_with_architecture<L: WeightLoader>(
        architecture: Architecture,
        loader: &mut L,
    ) -> ModelResult<Self> {
        let blocks = architecture
            .blocks
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                ReductionBlock::from_loader(spec, &layer_name(index), &mut *loader)
            })
            .collect::<WeightResult<Vec<_>>>()?;

        let prefix = layer_name(architecture.blocks.len());
        let width = architecture.flattened_width();
        let weights: Array2<WeightPrecision> = loader.get_weight(
            &format!("{}.weight", prefix),
            (architecture.num_outputs, width),
        )?;
        let bias = loader.get_weight(&format!("{}.bias", prefix), architecture.num_outputs)?;
        // Pytorch stores (out, in)
        let projection = FeedforwardLayer::new(weights.reversed_axes(), bias);
        info!(
            "Loaded keypoint regressor with {} parameters",
            architecture.num_parameters()
        );

        Ok(Self {
            architecture,
            blocks,
            projection,
            version: 0,
        })
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// Increases with every mutation of the parameters.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of learnable parameters. Running statistics are not counted.
    pub fn num_parameters(&self) -> usize {
        let blocks: usize = self.blocks.iter().map(ReductionBlock::num_parameters).sum();
        blocks + self.projection.num_parameters()
    }

    /// Inference: (batch, 1, 224, 224) -> (batch, 136).
    /// Batch norm uses the running statistics, so every sample is processed independently
    /// of the rest of the batch.
    pub fn forward(&self, images: &FeatureMaps) -> ModelResult<Features> {
        let (keypoints, _) = self.run(images, NormalizationMode::Inference)?;
        Ok(keypoints)
    }

    /// Training mode forward pass: batch norm uses the statistics of this batch, which are
    /// returned for [`KeypointRegressor::update_running_statistics`].
    pub fn forward_training(&self, images: &FeatureMaps) -> ModelResult<TrainingPass> {
        let (keypoints, statistics) = self.run(images, NormalizationMode::Training)?;
        Ok(TrainingPass {
            keypoints,
            statistics,
        })
    }

    fn run(
        &self,
        images: &FeatureMaps,
        mode: NormalizationMode,
    ) -> ModelResult<(Features, Vec<BatchStatistics>)> {
        self.check_input(images)?;

        let mut statistics = Vec::with_capacity(self.blocks.len());
        let mut features = images.as_standard_layout().into_owned();
        for (index, block) in self.blocks.iter().enumerate() {
            let (output, block_statistics) = block.forward(&features, mode)?;
            debug!("{} output shape {:?}", layer_name(index), output.shape());
            statistics.extend(block_statistics);
            features = output;
        }

        // Channel major, row major within a channel: the memory order of the feature maps
        let batch = features.len_of(Axis(0));
        let width = features.len() / batch;
        let flattened = features.into_shape((batch, width))?;
        let keypoints = self.projection.forward_pass(&flattened)?;
        Ok((keypoints, statistics))
    }

    fn check_input(&self, images: &FeatureMaps) -> ModelResult<()> {
        let (batch, channels, height, width) = images.dim();
        let size = self.architecture.input_size;
        if batch == 0
            || channels != self.architecture.input_channels
            || height != size
            || width != size
        {
            return Err(ModelError::shape_mismatch(
                "model input",
                format!(
                    "(batch >= 1, {}, {}, {})",
                    self.architecture.input_channels, size, size
                ),
                images.shape(),
            ));
        }
        Ok(())
    }

    /// Folds the statistics of a training pass into the running statistics of every block.
    /// Nothing is changed if the statistics don't fit the model.
    pub fn update_running_statistics(&mut self, statistics: &[BatchStatistics]) -> ModelResult<()> {
        if statistics.len() != self.blocks.len() {
            return Err(ModelError::StatisticsMismatch {
                expected: self.blocks.len(),
                found: statistics.len(),
            });
        }
        for (block, observed) in self.blocks.iter().zip(statistics) {
            let channels = block.normalization.num_channels();
            if observed.mean.len() != channels || observed.variance.len() != channels {
                return Err(ModelError::shape_mismatch(
                    "batch normalization statistics",
                    channels,
                    &[observed.mean.len(), observed.variance.len()],
                ));
            }
        }

        for (block, observed) in self.blocks.iter_mut().zip(statistics) {
            block.normalization.update_running_statistics(observed)?;
        }
        self.version += 1;
        Ok(())
    }

    /// Visits every tensor of the model under its `state_dict` name, running statistics included.
    pub fn visit_parameters<F>(&self, mut visit: F)
    where
        F: FnMut(&str, ArrayViewD<WeightPrecision>),
    {
        for (index, block) in self.blocks.iter().enumerate() {
            block.visit_parameters(&layer_name(index), &mut visit);
        }
        self.projection
            .visit_parameters(&layer_name(self.blocks.len()), &mut visit);
    }

    /// Mutable access to every learnable tensor, e.g. for an optimizer step.
    pub fn visit_parameters_mut<F>(&mut self, mut visit: F)
    where
        F: FnMut(&str, ArrayViewMutD<WeightPrecision>),
    {
        for (index, block) in self.blocks.iter_mut().enumerate() {
            block.visit_parameters_mut(&layer_name(index), &mut visit);
        }
        self.projection
            .visit_parameters_mut(&layer_name(self.blocks.len()), &mut visit);
        self.version += 1;
    }
}
