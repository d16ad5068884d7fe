use std::fmt;

use serde::Serialize;
use tracing::instrument;

use crate::{
    coco::{CocoAnnotation, CocoImage},
    coco_eval::{CocoEvaluator, CocoMetrics, IouType},
    scoring::{Region, ScoreRecord, ScoreStatistics, ScoreTracker},
    DatasetSplit, Detection, DetectionOptions, InstanceSegmenter, LayoutAnalyzer, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub images: usize,
    pub bbox: CocoMetrics,
    pub segm: CocoMetrics,
    pub readability: ScoreStatistics,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Evaluated {} images", self.images)?;
        writeln!(f, "IoU metric: bbox\n{}", self.bbox)?;
        writeln!(f, "IoU metric: segm\n{}", self.segm)?;
        write!(
            f,
            "Readability: rho {:.4}, mae {:.4}, mse {:.4}, rmse {:.4}",
            self.readability.rho, self.readability.mae, self.readability.mse, self.readability.rmse
        )
    }
}

/// One pass over a dataset split: COCO metrics plus text-proportion score agreement.
pub struct EvaluationPass {
    options: DetectionOptions,
    bbox: CocoEvaluator,
    segm: CocoEvaluator,
    scores: ScoreTracker,
}

impl EvaluationPass {
    pub fn new(options: DetectionOptions) -> Self {
        Self {
            options,
            bbox: CocoEvaluator::new(IouType::Bbox, options.mask_threshold),
            segm: CocoEvaluator::new(IouType::Segm, options.mask_threshold),
            scores: ScoreTracker::default(),
        }
    }

    #[instrument(level = "debug", skip_all, fields(image_id = image.id))]
    pub fn add_image(
        &mut self,
        image: &CocoImage,
        annotations: &[&CocoAnnotation],
        detections: &[Detection],
    ) {
        let truth = annotations
            .iter()
            .map(|it| Region::ground_truth(it))
            .collect::<Vec<_>>();
        let predicted = detections
            .iter()
            .map(|it| Region::predicted(it, self.options.mask_threshold))
            .collect::<Vec<_>>();
        let truth = ScoreRecord::from_regions(image.id, &truth);
        let predicted = ScoreRecord::from_regions(image.id, &predicted);
        log::debug!(
            "Image {}: true ratio {:.3} (score {}), predicted ratio {:.3} (score {})",
            image.id,
            truth.ratio,
            truth.score,
            predicted.ratio,
            predicted.score
        );
        self.scores.push(truth, predicted);

        self.bbox
            .update(annotations, detections, image.width, image.height);
        self.segm
            .update(annotations, detections, image.width, image.height);
    }

    pub fn scores(&self) -> &ScoreTracker {
        &self.scores
    }

    /// Fails when no image was added, since the score statistics are undefined.
    pub fn finish(self) -> Result<EvaluationReport> {
        let readability = self.scores.statistics()?;
        Ok(EvaluationReport {
            images: self.scores.len(),
            bbox: self.bbox.evaluate(),
            segm: self.segm.evaluate(),
            readability,
        })
    }
}

/// Runs the analyzer over every image of `split` and scores it against the annotations.
#[instrument(skip(analyzer, split), fields(split = %split.name))]
pub fn evaluate<S: InstanceSegmenter>(
    analyzer: &LayoutAnalyzer<S>,
    split: &DatasetSplit,
    options: DetectionOptions,
) -> Result<EvaluationReport> {
    let coco = split.load_annotations()?;
    let mut pass = EvaluationPass::new(options);
    let total = coco.images.len();
    for (i, image) in coco.images.iter().enumerate() {
        let pixels = image::open(split.image_path(&image.file_name))?;
        let detections = analyzer.detect(&pixels, options)?;
        let annotations = coco.annotations_for(image.id).collect::<Vec<_>>();
        pass.add_image(image, &annotations, &detections);
        if (i + 1) % 100 == 0 || i + 1 == total {
            log::info!("Test: [{}/{total}]", i + 1);
        }
    }
    let report = pass.finish()?;
    log::info!("{report}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use ndarray::{s, Array2};

    use super::*;
    use crate::Category;

    fn annotation(id: u64, category: Category, bbox: [f32; 4]) -> CocoAnnotation {
        let [_, _, w, h] = bbox;
        CocoAnnotation {
            id,
            image_id: 0,
            category_id: category.id(),
            segmentation: Default::default(),
            bbox,
            area: (w * h) as f64,
            iscrowd: 0,
            ignore: 0,
        }
    }

    fn detection(category: Category, bbox: [f32; 4]) -> Detection {
        let [x, y, w, h] = bbox;
        let mut mask = Array2::zeros((50, 50));
        mask.slice_mut(s![y as usize..(y + h) as usize, x as usize..(x + w) as usize])
            .fill(1.0);
        Detection {
            bbox: [x, y, x + w, y + h],
            category_id: category.id(),
            score: 0.9,
            mask,
        }
    }

    #[test]
    fn finishing_an_empty_pass_fails() {
        assert!(EvaluationPass::new(DetectionOptions::default())
            .finish()
            .is_err());
    }

    #[test]
    fn exact_predictions_give_perfect_report() {
        let mut pass = EvaluationPass::new(DetectionOptions::default());
        let image = |id| CocoImage {
            id,
            file_name: format!("{id}.png"),
            width: 50,
            height: 50,
        };
        let pages = [
            vec![
                (Category::Text, [0.0, 0.0, 10.0, 4.0]),
                (Category::Image, [20.0, 20.0, 10.0, 6.0]),
            ],
            vec![(Category::Table, [5.0, 5.0, 20.0, 20.0])],
            vec![(Category::Title, [0.0, 0.0, 30.0, 30.0])],
        ];
        for (id, page) in pages.iter().enumerate() {
            let annotations = page
                .iter()
                .enumerate()
                .map(|(i, (category, bbox))| annotation(i as u64, *category, *bbox))
                .collect::<Vec<_>>();
            let detections = page
                .iter()
                .map(|(category, bbox)| detection(*category, *bbox))
                .collect::<Vec<_>>();
            pass.add_image(
                &image(id as u64),
                &annotations.iter().collect::<Vec<_>>(),
                &detections,
            );
        }
        assert_eq!(pass.scores().len(), 3);
        let report = pass.finish().unwrap();
        assert_eq!(report.images, 3);
        assert_eq!(report.bbox.ap, 1.0);
        assert_eq!(report.segm.ap, 1.0);
        assert!((report.readability.rho - 1.0).abs() < 1e-12);
        assert_eq!(report.readability.mae, 0.0);
    }
}
