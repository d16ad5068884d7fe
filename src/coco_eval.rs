//! COCO detection and segmentation metrics.
//!
//! Images are matched as they arrive so that instance masks never outlive a single
//! [`CocoEvaluator::update`] call; only per-detection match states are retained. Matching is
//! greedy in descending score order per category, at IoU thresholds `.50:.05:.95`, keeping the
//! 100 best detections per image and category. Crowd annotations do not count as ground truth,
//! and detections that only overlap a crowd region are ignored rather than counted as false
//! positives. Precision is interpolated at 101 recall points.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use float_ord::FloatOrd;
use image::{GrayImage, Luma};
use imageproc::{drawing::draw_polygon_mut, point::Point};
use ndarray::ArrayView2;
use serde::Serialize;
use tracing::instrument;

use crate::{
    coco::{CocoAnnotation, Segmentation},
    Detection,
};

const IOU_THRESHOLDS: usize = 10;
const RECALL_POINTS: usize = 101;
const MAX_DETECTIONS: usize = 100;

fn iou_threshold(index: usize) -> f64 {
    0.5 + 0.05 * index as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IouType {
    Bbox,
    Segm,
}

impl fmt::Display for IouType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IouType::Bbox => write!(f, "bbox"),
            IouType::Segm => write!(f, "segm"),
        }
    }
}

/// Binary instance mask stored with the bounds of its foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    width: usize,
    height: usize,
    bits: Vec<bool>,
    /// `x0, y0, x1, y1`, exclusive on the high end; empty masks have `x0 >= x1`.
    bounds: [usize; 4],
    area: usize,
}

impl BinaryMask {
    fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Self {
        let mut bits = vec![false; width * height];
        let mut bounds = [width, height, 0, 0];
        let mut area = 0;
        for y in 0..height {
            for x in 0..width {
                if f(x, y) {
                    bits[y * width + x] = true;
                    area += 1;
                    bounds[0] = bounds[0].min(x);
                    bounds[1] = bounds[1].min(y);
                    bounds[2] = bounds[2].max(x + 1);
                    bounds[3] = bounds[3].max(y + 1);
                }
            }
        }
        Self {
            width,
            height,
            bits,
            bounds,
            area,
        }
    }

    pub fn from_probabilities(mask: ArrayView2<f32>, threshold: f32) -> Self {
        let (height, width) = mask.dim();
        Self::from_fn(width, height, |x, y| mask[[y, x]] >= threshold)
    }

    /// Rasterizes COCO polygons or an RLE mask. Annotations without a usable segmentation
    /// fall back to their box.
    pub fn from_annotation(annotation: &CocoAnnotation, width: u32, height: u32) -> Self {
        let mut canvas = GrayImage::new(width, height);
        let mut drawn = false;
        if let Segmentation::Rle(rle) = &annotation.segmentation {
            for (x, y) in rle.foreground().filter(|(x, y)| *x < width && *y < height) {
                canvas.put_pixel(x, y, Luma([255]));
                drawn = true;
            }
        }
        for polygon in annotation.segmentation.polygons() {
            let mut points = polygon
                .chunks_exact(2)
                .map(|pair| Point::new(pair[0].round() as i32, pair[1].round() as i32))
                .collect::<Vec<_>>();
            while points.len() > 1 && points.first() == points.last() {
                points.pop();
            }
            if points.len() < 3 {
                continue;
            }
            draw_polygon_mut(&mut canvas, &points, Luma([255]));
            drawn = true;
        }
        if !drawn {
            let [x, y, w, h] = annotation.bbox;
            let (x0, y0) = (x.max(0.0) as u32, y.max(0.0) as u32);
            let (x1, y1) = ((x + w).max(0.0) as u32, (y + h).max(0.0) as u32);
            for py in y0..y1.min(height) {
                for px in x0..x1.min(width) {
                    canvas.put_pixel(px, py, Luma([255]));
                }
            }
        }
        Self::from_fn(width as usize, height as usize, |x, y| {
            canvas.get_pixel(x as u32, y as u32).0[0] > 0
        })
    }

    pub fn area(&self) -> usize {
        self.area
    }

    pub fn iou(&self, other: &BinaryMask) -> f64 {
        let union_guess = self.area + other.area;
        if union_guess == 0 || self.width != other.width || self.height != other.height {
            return 0.0;
        }
        let x0 = self.bounds[0].max(other.bounds[0]);
        let y0 = self.bounds[1].max(other.bounds[1]);
        let x1 = self.bounds[2].min(other.bounds[2]);
        let y1 = self.bounds[3].min(other.bounds[3]);
        let mut intersection = 0usize;
        for y in y0..y1 {
            let row = y * self.width;
            intersection += (x0..x1)
                .filter(|x| self.bits[row + x] && other.bits[row + x])
                .count();
        }
        intersection as f64 / (union_guess - intersection) as f64
    }
}

/// Standard box IoU on `[x, y, width, height]` boxes.
pub fn bbox_iou(a: [f32; 4], b: [f32; 4]) -> f64 {
    let [ax, ay, aw, ah] = a.map(f64::from);
    let [bx, by, bw, bh] = b.map(f64::from);
    let iw = ((ax + aw).min(bx + bw) - ax.max(bx)).max(0.0);
    let ih = ((ay + ah).min(by + bh) - ay.max(by)).max(0.0);
    let intersection = iw * ih;
    let union = aw * ah + bw * bh - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

struct Instance {
    category_id: u32,
    bbox: [f32; 4],
    mask: Option<BinaryMask>,
    score: f32,
    crowd: bool,
}

impl Instance {
    fn iou(&self, other: &Instance, iou_type: IouType) -> f64 {
        match (iou_type, &self.mask, &other.mask) {
            (IouType::Segm, Some(a), Some(b)) => a.iou(b),
            _ => bbox_iou(self.bbox, other.bbox),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchState {
    TruePositive,
    FalsePositive,
    Ignored,
}

struct ScoredMatch {
    score: f32,
    states: [MatchState; IOU_THRESHOLDS],
}

#[derive(Default)]
struct CategoryRecord {
    ground_truth: usize,
    matches: Vec<ScoredMatch>,
}

/// Summary numbers; `-1` marks a metric without any ground truth to measure against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CocoMetrics {
    pub ap: f64,
    pub ap50: f64,
    pub ap75: f64,
    pub ar100: f64,
}

impl fmt::Display for CocoMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            " Average Precision  (AP) @[ IoU=0.50:0.95 | area=   all | maxDets=100 ] = {:.3}",
            self.ap
        )?;
        writeln!(
            f,
            " Average Precision  (AP) @[ IoU=0.50      | area=   all | maxDets=100 ] = {:.3}",
            self.ap50
        )?;
        writeln!(
            f,
            " Average Precision  (AP) @[ IoU=0.75      | area=   all | maxDets=100 ] = {:.3}",
            self.ap75
        )?;
        write!(
            f,
            " Average Recall     (AR) @[ IoU=0.50:0.95 | area=   all | maxDets=100 ] = {:.3}",
            self.ar100
        )
    }
}

pub struct CocoEvaluator {
    iou_type: IouType,
    mask_threshold: f32,
    categories: BTreeMap<u32, CategoryRecord>,
    images: usize,
}

impl CocoEvaluator {
    pub fn new(iou_type: IouType, mask_threshold: f32) -> Self {
        Self {
            iou_type,
            mask_threshold,
            categories: BTreeMap::new(),
            images: 0,
        }
    }

    pub fn iou_type(&self) -> IouType {
        self.iou_type
    }

    pub fn images(&self) -> usize {
        self.images
    }

    /// Matches the detections of one image against its annotations.
    #[instrument(level = "trace", skip_all, fields(iou_type = %self.iou_type))]
    pub fn update(
        &mut self,
        annotations: &[&CocoAnnotation],
        detections: &[Detection],
        width: u32,
        height: u32,
    ) {
        self.images += 1;
        let segm = self.iou_type == IouType::Segm;
        let ground_truth = annotations
            .iter()
            .map(|it| Instance {
                category_id: it.category_id,
                bbox: it.bbox,
                mask: segm.then(|| BinaryMask::from_annotation(it, width, height)),
                score: 1.0,
                crowd: it.iscrowd != 0,
            })
            .collect::<Vec<_>>();
        let detections = detections
            .iter()
            .map(|it| Instance {
                category_id: it.category_id,
                bbox: it.xywh(),
                mask: segm.then(|| BinaryMask::from_probabilities(it.mask.view(), self.mask_threshold)),
                score: it.score,
                crowd: false,
            })
            .collect::<Vec<_>>();

        let category_ids = ground_truth
            .iter()
            .chain(&detections)
            .map(|it| it.category_id)
            .collect::<BTreeSet<_>>();
        for category_id in category_ids {
            let gts = ground_truth
                .iter()
                .filter(|it| it.category_id == category_id)
                .collect::<Vec<_>>();
            let mut dts = detections
                .iter()
                .filter(|it| it.category_id == category_id)
                .collect::<Vec<_>>();
            dts.sort_by_key(|it| Reverse(FloatOrd(it.score)));
            dts.truncate(MAX_DETECTIONS);

            let matches = match_category(&gts, &dts, self.iou_type);
            let record = self.categories.entry(category_id).or_default();
            record.ground_truth += gts.iter().filter(|it| !it.crowd).count();
            record.matches.extend(matches);
        }
    }

    #[instrument(level = "debug", skip(self), fields(iou_type = %self.iou_type))]
    pub fn evaluate(&self) -> CocoMetrics {
        let mut precision = vec![vec![]; IOU_THRESHOLDS];
        let mut recall = vec![vec![]; IOU_THRESHOLDS];
        for record in self.categories.values().filter(|it| it.ground_truth > 0) {
            let mut matches = record.matches.iter().collect::<Vec<_>>();
            matches.sort_by_key(|it| Reverse(FloatOrd(it.score)));
            for t in 0..IOU_THRESHOLDS {
                let (ap, rc) = average_precision(
                    matches.iter().map(|it| it.states[t]),
                    record.ground_truth,
                );
                precision[t].push(ap);
                recall[t].push(rc);
            }
        }
        let metrics = CocoMetrics {
            ap: mean(precision.iter().flatten()),
            ap50: mean(precision[0].iter()),
            ap75: mean(precision[5].iter()),
            ar100: mean(recall.iter().flatten()),
        };
        log::debug!("{} metrics over {} images: {metrics:?}", self.iou_type, self.images);
        metrics
    }
}

fn match_category(gts: &[&Instance], dts: &[&Instance], iou_type: IouType) -> Vec<ScoredMatch> {
    let ious = dts
        .iter()
        .map(|dt| gts.iter().map(|gt| dt.iou(gt, iou_type)).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    let mut states = vec![[MatchState::FalsePositive; IOU_THRESHOLDS]; dts.len()];
    for t in 0..IOU_THRESHOLDS {
        let threshold = iou_threshold(t).min(1.0 - 1e-10);
        let mut taken = vec![false; gts.len()];
        for (d, row) in ious.iter().enumerate() {
            let mut best: Option<usize> = None;
            let mut best_iou = threshold;
            // regular ground truth first, crowd regions only as a fallback
            for crowd in [false, true] {
                for (g, gt) in gts.iter().enumerate() {
                    if gt.crowd != crowd || (taken[g] && !gt.crowd) || row[g] < best_iou {
                        continue;
                    }
                    best_iou = row[g];
                    best = Some(g);
                }
                if best.is_some() {
                    break;
                }
            }
            states[d][t] = match best {
                Some(g) if gts[g].crowd => MatchState::Ignored,
                Some(g) => {
                    taken[g] = true;
                    MatchState::TruePositive
                }
                None => MatchState::FalsePositive,
            };
        }
    }

    dts.iter()
        .zip(states)
        .map(|(dt, states)| ScoredMatch {
            score: dt.score,
            states,
        })
        .collect()
}

/// 101-point interpolated precision and final recall for one category and threshold.
fn average_precision(states: impl Iterator<Item = MatchState>, ground_truth: usize) -> (f64, f64) {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut recall = vec![];
    let mut precision = vec![];
    for state in states {
        match state {
            MatchState::TruePositive => tp += 1,
            MatchState::FalsePositive => fp += 1,
            MatchState::Ignored => continue,
        }
        recall.push(tp as f64 / ground_truth as f64);
        precision.push(tp as f64 / (tp + fp) as f64);
    }
    for i in (1..precision.len()).rev() {
        if precision[i] > precision[i - 1] {
            precision[i - 1] = precision[i];
        }
    }
    let sampled = (0..RECALL_POINTS)
        .map(|i| i as f64 / (RECALL_POINTS - 1) as f64)
        .map(|threshold| {
            let idx = recall.partition_point(|rc| *rc < threshold);
            precision.get(idx).copied().unwrap_or(0.0)
        })
        .sum::<f64>();
    (
        sampled / RECALL_POINTS as f64,
        recall.last().copied().unwrap_or(0.0),
    )
}

fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        -1.0
    } else {
        sum / count as f64
    }
}
