//! Conversion between images on disk and the tensors of the keypoint regressor.
use image::{
    imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, ImageError, Luma, Rgb, RgbImage,
};
use log::{info, warn};
use ml::{
    keypoints::Keypoints,
    models::{KeypointRegressor, INPUT_SIZE},
    weight_loader::{JsonWeightLoader, NpzWeightLoader, WeightError},
    FeatureMaps, ModelError,
};
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_npy::{read_npy, ReadNpyError};
use nshare::ToNdarray2;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::{json, Value};
use std::{ffi::OsStr, path::Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeypointsError {
    #[error("File {0} had unrecognized type.")]
    UnsupportedFormat(String),
    #[error("Could not open input. Filesystem reported error\n {0}.")]
    IoError(#[from] std::io::Error),
    #[error("Could not read image:\n {0}")]
    ImageError(#[from] ImageError),
    #[error("Could not read numpy array:\n {0}")]
    NpyError(#[from] ReadNpyError),
    #[error("Could not read weights:\n {0}")]
    WeightError(#[from] WeightError),
    #[error("Could not build the network:\n {0}")]
    ModelError(#[from] ModelError),
}

const KEYPOINT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Reads the network input from an image or a (height, width) numpy array.
///
/// Images are converted to grayscale, resized to the input size of the network and scaled to [0, 1].
/// Arrays are passed on unchanged. Also returns the grayscale picture the network sees.
pub fn load_input<P: AsRef<Path>>(
    path: P,
) -> Result<(FeatureMaps, GrayImage), KeypointsError> {
    let path = path.as_ref();
    match path.extension().and_then(OsStr::to_str) {
        Some("npy") => {
            let arr: Array2<f32> = read_npy(path)?;
            let gray = array_to_gray_image(arr.view());
            Ok((array_to_input(arr), gray))
        }
        Some("png") | Some("jpg") | Some("jpeg") => {
            let img = image::io::Reader::open(path)?.decode()?;
            let gray = resize_to_input(&img);
            Ok((gray_to_input(&gray), gray))
        }
        _ => Err(KeypointsError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Builds the network from trained parameters (.npz or .json), or randomly initialized
/// from the seed if no parameters are given.
pub fn load_model(
    weights: Option<&Path>,
    seed: u64,
) -> Result<KeypointRegressor, KeypointsError> {
    let path = match weights {
        Some(p) => p,
        None => {
            warn!(
                "No weights given, predicting with a random network (seed {})",
                seed
            );
            let mut rng = StdRng::seed_from_u64(seed);
            return Ok(KeypointRegressor::new(&mut rng));
        }
    };

    info!("Loading weights from {}", path.display());
    let model = match path.extension().and_then(OsStr::to_str) {
        Some("npz") => KeypointRegressor::from_loader(&mut NpzWeightLoader::from_path(path)?)?,
        Some("json") => KeypointRegressor::from_loader(&mut JsonWeightLoader::new(path)?)?,
        _ => {
            return Err(KeypointsError::UnsupportedFormat(
                path.display().to_string(),
            ))
        }
    };
    Ok(model)
}

/// Grayscale version of the image with the side length the network expects.
pub fn resize_to_input(img: &DynamicImage) -> GrayImage {
    let size = INPUT_SIZE as u32;
    image::imageops::resize(&img.to_luma8(), size, size, FilterType::Triangle)
}

/// Returns the image as pre-scaled (1, 1, height, width) batch, ready to be put into the network
pub fn gray_to_input(img: &GrayImage) -> FeatureMaps {
    let scaled = img.clone().into_ndarray2().mapv(|x| x as f32 / 255.0);
    array_to_input(scaled)
}

/// Wraps a (height, width) array into a batch with a single grayscale image.
pub fn array_to_input(arr: Array2<f32>) -> FeatureMaps {
    arr.insert_axis(Axis(0)).insert_axis(Axis(0))
}

/// Turns a [0, 1] valued array into a grayscale image
pub fn array_to_gray_image(arr: ArrayView2<f32>) -> GrayImage {
    let (height, width) = arr.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Luma([to_pixel(&arr[[y as usize, x as usize]])])
    })
}

/// Turns a [0, 1] intensity into a pixel value
pub fn to_pixel(x: &f32) -> u8 {
    (x.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Marks every keypoint with a small red square. Keypoints are taken as pixel coordinates
/// of the given image, points outside of it are skipped.
pub fn draw_keypoints(img: &GrayImage, keypoints: &Keypoints) -> RgbImage {
    let mut annotated = DynamicImage::ImageLuma8(img.clone()).to_rgb8();
    let (width, height) = (annotated.width() as i64, annotated.height() as i64);
    for [x, y] in keypoints.iter() {
        let (cx, cy) = (x.round() as i64, y.round() as i64);
        for px in cx - 1..=cx + 1 {
            for py in cy - 1..=cy + 1 {
                if (0..width).contains(&px) && (0..height).contains(&py) {
                    annotated.put_pixel(px as u32, py as u32, KEYPOINT_COLOR);
                }
            }
        }
    }
    annotated
}

/// `{"keypoints": [[x0, y0], [x1, y1], ...]}`
pub fn keypoints_to_json(keypoints: &Keypoints) -> Value {
    let points: Vec<Value> = keypoints.iter().map(|[x, y]| json!([x, y])).collect();
    json!({ "keypoints": points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_gray_image_is_scaled_into_batch() {
        let img = GrayImage::from_raw(3, 2, vec![0, 51, 255, 102, 0, 0]).unwrap();
        let input = gray_to_input(&img);
        assert_eq!(input.dim(), (1, 1, 2, 3));
        assert_eq!(input[[0, 0, 0, 1]], 0.2);
        assert_eq!(input[[0, 0, 0, 2]], 1.0);
        assert_eq!(input[[0, 0, 1, 0]], 0.4);
    }

    #[test]
    fn test_resize_to_input() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(300, 100));
        let gray = resize_to_input(&img);
        assert_eq!(gray.dimensions(), (224, 224));
    }

    #[test]
    fn test_array_and_image_conversion() {
        let arr = array![[0.0, 0.5], [1.0, 2.0], [-1.0, 0.2]];
        let gray = array_to_gray_image(arr.view());
        assert_eq!(gray.dimensions(), (2, 3));
        assert_eq!(gray.get_pixel(1, 0), &Luma([128]));
        assert_eq!(gray.get_pixel(1, 1), &Luma([255]));
        assert_eq!(gray.get_pixel(0, 2), &Luma([0]));

        assert_eq!(array_to_input(arr).dim(), (1, 1, 3, 2));
    }

    #[test]
    fn test_draw_keypoints() {
        let img = GrayImage::new(10, 10);
        let keypoints = Keypoints(vec![[4.2, 5.0], [-20.0, 3.0], [9.0, 9.0]]);

        let annotated = draw_keypoints(&img, &keypoints);

        assert_eq!(annotated.get_pixel(4, 5), &KEYPOINT_COLOR);
        assert_eq!(annotated.get_pixel(5, 6), &KEYPOINT_COLOR);
        assert_eq!(annotated.get_pixel(9, 9), &KEYPOINT_COLOR);
        assert_eq!(annotated.get_pixel(0, 3), &Rgb([0, 0, 0]));
        assert_eq!(annotated.get_pixel(7, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_keypoints_to_json() {
        let keypoints = Keypoints(vec![[1.0, 2.0], [3.5, -4.0]]);
        assert_eq!(
            keypoints_to_json(&keypoints),
            json!({ "keypoints": [[1.0, 2.0], [3.5, -4.0]] })
        );
    }

    #[test]
    fn test_unsupported_format() {
        assert!(matches!(
            load_input("face.gif"),
            Err(KeypointsError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            load_model(Some(Path::new("weights.pt")), 0),
            Err(KeypointsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_random_model_without_weights() {
        let model = load_model(None, 42).unwrap();
        assert_eq!(model.num_parameters(), 2_686_024);
        assert_eq!(model.version(), 0);
    }

    #[test]
    fn test_missing_weight_file() {
        assert!(matches!(
            load_model(Some(Path::new("does-not-exist.npz")), 0),
            Err(KeypointsError::WeightError(_))
        ));
    }
}
