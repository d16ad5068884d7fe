use ndarray::{Array1, Array2, Array3, Axis};

use crate::{Category, Error, Result};

/// Plain arrays as returned by one forward pass, before thresholding.
#[derive(Debug, Clone)]
pub struct RawPrediction {
    /// `[N, 4]` boxes as `x1, y1, x2, y2` in image pixels.
    pub boxes: Array2<f32>,
    /// `[N]` label ids.
    pub labels: Array1<i64>,
    /// `[N]` confidences in `[0, 1]`.
    pub scores: Array1<f32>,
    /// `[N, H, W]` per-instance mask probabilities pasted into image space.
    pub masks: Array3<f32>,
}

impl RawPrediction {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            boxes: Array2::zeros((0, 4)),
            labels: Array1::zeros(0),
            scores: Array1::zeros(0),
            masks: Array3::zeros((0, height as usize, width as usize)),
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything scoring below `score_threshold` and splits the rest into
    /// per-instance [`Detection`]s. Fails if the arrays disagree on instance count.
    pub fn into_detections(self, score_threshold: f32) -> Result<Vec<Detection>> {
        let count = self.scores.len();
        if self.boxes.dim() != (count, 4) {
            return Err(Error::malformed(format!(
                "expected {count}x4 boxes, got {:?}",
                self.boxes.dim()
            )));
        }
        if self.labels.len() != count || self.masks.len_of(Axis(0)) != count {
            return Err(Error::malformed(format!(
                "instance count mismatch: {count} scores, {} labels, {} masks",
                self.labels.len(),
                self.masks.len_of(Axis(0))
            )));
        }

        let detections = self
            .scores
            .iter()
            .enumerate()
            .filter(|(_, score)| **score >= score_threshold)
            .map(|(i, score)| {
                let row = self.boxes.row(i);
                let label = u32::try_from(self.labels[i])
                    .map_err(|_| Error::malformed(format!("negative label {}", self.labels[i])))?;
                Ok(Detection {
                    bbox: [row[0], row[1], row[2], row[3]],
                    category_id: label,
                    score: *score,
                    mask: self.masks.index_axis(Axis(0), i).to_owned(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(detections)
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    /// `x1, y1, x2, y2`.
    pub bbox: [f32; 4],
    pub category_id: u32,
    pub score: f32,
    /// Same size as the source image.
    pub mask: Array2<f32>,
}

impl Detection {
    pub fn category(&self) -> Option<Category> {
        Category::from_id(self.category_id)
    }

    /// Box in COCO `[x, y, width, height]` form.
    pub fn xywh(&self) -> [f32; 4] {
        let [x1, y1, x2, y2] = self.bbox;
        [x1, y1, x2 - x1, y2 - y1]
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    fn prediction() -> RawPrediction {
        RawPrediction {
            boxes: arr2(&[[0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 3.0, 2.0]]),
            labels: arr1(&[2, 4]),
            scores: arr1(&[0.95, 0.4]),
            masks: Array3::zeros((2, 6, 8)),
        }
    }

    #[test]
    fn thresholding_keeps_confident_instances() {
        let detections = prediction().into_detections(0.8).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].category(), Some(Category::Text));
        assert_eq!(detections[0].mask.dim(), (6, 8));
        assert_eq!(detections[0].xywh(), [0.0, 0.0, 4.0, 4.0]);
    }

    #[test]
    fn mismatched_arrays_are_rejected() {
        let mut prediction = prediction();
        prediction.labels = arr1(&[2]);
        assert!(matches!(
            prediction.into_detections(0.5),
            Err(Error::MalformedPrediction(_))
        ));
    }
}
