use ndarray::{ArrayView1, Axis};

use crate::{Features, ImagePrecision, ModelError, ModelResult};

/// Number of facial landmarks predicted per image.
pub const NUM_KEYPOINTS: usize = 68;

/// The (x, y) landmark pairs of one prediction, in the order the network emits them
/// (x0, y0, x1, y1, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoints(pub Vec<[ImagePrecision; 2]>);

impl Keypoints {
    /// Pairs up one row of network output.
    pub fn from_row(row: ArrayView1<ImagePrecision>) -> ModelResult<Self> {
        if row.len() % 2 != 0 {
            return Err(ModelError::shape_mismatch(
                "keypoint extraction",
                "an even number of coordinates",
                row.shape(),
            ));
        }
        let coordinates: Vec<ImagePrecision> = row.iter().copied().collect();
        Ok(Keypoints(
            coordinates.chunks(2).map(|xy| [xy[0], xy[1]]).collect(),
        ))
    }

    /// One set of keypoints per row of a batch of predictions.
    pub fn from_batch(predictions: &Features) -> ModelResult<Vec<Self>> {
        predictions
            .axis_iter(Axis(0))
            .map(Keypoints::from_row)
            .collect()
    }

    /// Maps every coordinate through `value * scale + offset`, e.g. to undo the
    /// normalization applied to the training targets.
    pub fn denormalize(&self, scale: ImagePrecision, offset: ImagePrecision) -> Self {
        Keypoints(
            self.0
                .iter()
                .map(|[x, y]| [x * scale + offset, y * scale + offset])
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[ImagePrecision; 2]> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_rows_are_paired() {
        let predictions = array![[1., 2., 3., 4.], [-1., -2., -3., -4.]];
        let keypoints = Keypoints::from_batch(&predictions).unwrap();
        assert_eq!(keypoints[0], Keypoints(vec![[1., 2.], [3., 4.]]));
        assert_eq!(keypoints[1], Keypoints(vec![[-1., -2.], [-3., -4.]]));
    }

    #[test]
    fn test_full_prediction_has_68_points() {
        let predictions: Array2<f32> = Array2::zeros((1, 2 * NUM_KEYPOINTS));
        let keypoints = Keypoints::from_batch(&predictions).unwrap();
        assert_eq!(keypoints[0].len(), NUM_KEYPOINTS);
    }

    #[test]
    fn test_denormalize() {
        let keypoints = Keypoints(vec![[0., 1.], [-1., 0.5]]);
        assert_eq!(
            keypoints.denormalize(50., 100.),
            Keypoints(vec![[100., 150.], [50., 125.]])
        );
    }

    #[test]
    fn test_odd_row_is_rejected() {
        let predictions = array![[1., 2., 3.]];
        assert!(Keypoints::from_batch(&predictions).is_err());
    }
}
