//! Layers and model definition of a convolutional facial keypoint regressor.
//!
//! All tensors follow the Pytorch layout (batch, channels, height, width), so that
//! parameters exported from a Pytorch `state_dict` can be loaded without reordering.
use ndarray::{Array2, Array4};

pub mod activation_functions;
pub mod convolutions;
mod errors;
pub mod fully_connected;
pub mod initialization;
pub mod keypoints;
pub mod models;
pub mod normalization;
pub mod pooling;
pub mod weight_loader;

pub use errors::{ModelError, ModelResult};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Convolution weights in (output channels, input channels, kernel height, kernel width) order.
pub type ConvKernel = Array4<WeightPrecision>;
/// A batch of feature maps in (batch, channels, height, width) order.
pub type FeatureMaps = Array4<ImagePrecision>;
/// A batch of flat feature vectors, one row per sample.
pub type Features = Array2<ImagePrecision>;
