//! Text-proportion readability score: the share of page area covered by Text and Title
//! regions, bucketed into a fixed score table and compared between ground truth and
//! predictions.

use float_ord::FloatOrd;
use serde::Serialize;

use crate::{coco::CocoAnnotation, polygon::mask_area, Category, Detection, Error, Result};

/// One region contributing to a page's area summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Region {
    /// Annotated region, `area` taken from the dataset.
    GroundTruth { category_id: u32, area: f64 },
    /// Predicted region, `pixel_area` counted from its mask.
    Predicted { category_id: u32, pixel_area: f64 },
}

impl Region {
    pub fn ground_truth(annotation: &CocoAnnotation) -> Self {
        Region::GroundTruth {
            category_id: annotation.category_id,
            area: annotation.area,
        }
    }

    pub fn predicted(detection: &Detection, mask_threshold: f32) -> Self {
        Region::Predicted {
            category_id: detection.category_id,
            pixel_area: mask_area(detection.mask.view(), mask_threshold),
        }
    }

    pub fn category_id(&self) -> u32 {
        match *self {
            Region::GroundTruth { category_id, .. } | Region::Predicted { category_id, .. } => {
                category_id
            }
        }
    }

    pub fn area(&self) -> f64 {
        match *self {
            Region::GroundTruth { area, .. } => area,
            Region::Predicted { pixel_area, .. } => pixel_area,
        }
    }

    pub fn is_textual(&self) -> bool {
        Category::from_id(self.category_id()).is_some_and(Category::is_textual)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AreaSummary {
    pub text_area: f64,
    pub total_area: f64,
}

impl AreaSummary {
    pub fn from_regions<'a>(regions: impl IntoIterator<Item = &'a Region>) -> Self {
        regions
            .into_iter()
            .fold(AreaSummary::default(), |mut summary, region| {
                summary.total_area += region.area();
                if region.is_textual() {
                    summary.text_area += region.area();
                }
                summary
            })
    }

    /// `text_area / total_area`, or 0 for a page without any area.
    pub fn ratio(&self, image_id: u64) -> f64 {
        if self.total_area == 0.0 {
            log::warn!(
                "Image {image_id} has no region area (text area {}, total area {}), using ratio 0",
                self.text_area,
                self.total_area
            );
            return 0.0;
        }
        self.text_area / self.total_area
    }
}

/// Maps a text-area ratio to its readability score. Ranges are closed on the low end.
pub fn bucket_score(ratio: f64) -> u8 {
    match ratio {
        r if (0.9..=1.0).contains(&r) => 1,
        r if (0.0..0.1).contains(&r) || (0.8..0.9).contains(&r) => 3,
        r if (0.1..0.2).contains(&r) || (0.7..0.8).contains(&r) => 5,
        r if (0.2..0.3).contains(&r) || (0.6..0.7).contains(&r) => 7,
        r if (0.3..0.4).contains(&r) => 15,
        r if (0.4..0.5).contains(&r) => 12,
        r if (0.5..0.6).contains(&r) => 9,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreRecord {
    pub image_id: u64,
    pub ratio: f64,
    pub score: u8,
}

impl ScoreRecord {
    pub fn from_regions(image_id: u64, regions: &[Region]) -> Self {
        let ratio = AreaSummary::from_regions(regions).ratio(image_id);
        Self {
            image_id,
            ratio,
            score: bucket_score(ratio),
        }
    }
}

/// Agreement between ground-truth and predicted scores over one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreStatistics {
    /// Spearman rank correlation. `NaN` when either sequence is constant.
    pub rho: f64,
    pub mse: f64,
    pub mae: f64,
    pub rmse: f64,
    pub count: usize,
}

impl ScoreStatistics {
    pub fn compute(truth: &[f64], predicted: &[f64]) -> Result<Self> {
        if truth.is_empty() || truth.len() != predicted.len() {
            return Err(Error::ScoreSequence {
                truth: truth.len(),
                predicted: predicted.len(),
            });
        }
        let mse = mean_squared_error(truth, predicted);
        Ok(Self {
            rho: spearman(predicted, truth),
            mse,
            mae: mean_absolute_error(truth, predicted),
            rmse: mse.sqrt(),
            count: truth.len(),
        })
    }
}

/// Accumulates score records for ground truth and predictions side by side.
#[derive(Debug, Clone, Default)]
pub struct ScoreTracker {
    truth: Vec<ScoreRecord>,
    predicted: Vec<ScoreRecord>,
}

impl ScoreTracker {
    pub fn push(&mut self, truth: ScoreRecord, predicted: ScoreRecord) {
        self.truth.push(truth);
        self.predicted.push(predicted);
    }

    pub fn len(&self) -> usize {
        self.truth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.truth.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = (&ScoreRecord, &ScoreRecord)> {
        self.truth.iter().zip(&self.predicted)
    }

    pub fn statistics(&self) -> Result<ScoreStatistics> {
        let scores = |records: &[ScoreRecord]| {
            records
                .iter()
                .map(|it| it.score as f64)
                .collect::<Vec<_>>()
        };
        ScoreStatistics::compute(&scores(&self.truth), &scores(&self.predicted))
    }
}

pub fn mean_squared_error(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>() / a.len() as f64
}

pub fn mean_absolute_error(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f64>() / a.len() as f64
}

/// Ranks starting at 1, ties get the average of the ranks they span.
fn rank(values: &[f64]) -> Vec<f64> {
    let mut order = (0..values.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| FloatOrd(values[i]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end hold ranks start+1..=end
        let average = (start + 1 + end) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = average;
        }
        start = end;
    }
    ranks
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return f64::NAN;
    }
    (cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0)
}

/// Spearman rank correlation with average ranks for ties.
pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    pearson(&rank(a), &rank(b))
}
