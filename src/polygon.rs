//! Reduction of instance masks to COCO polygon segmentations.

use geo::{Area, Coord, LineString, Polygon};
use imageproc::{
    contours::{find_contours, BorderType},
    point::Point,
};
use ndarray::ArrayView2;
use tracing::instrument;

use crate::util::to_binary_image;

/// Vertex budget per contour used by the COCO export.
pub const MAX_POLYGON_POINTS: usize = 30;

/// Extracts the outer contours of `mask` at `threshold` and turns each into a closed,
/// flattened `x, y, x, y, ...` polygon with at most `max_points` distinct vertices.
///
/// Contours with `max_points` or more points are subsampled evenly with a stride of
/// `len / (max_points - 1)`. The first vertex is repeated at the end. An empty mask gives
/// an empty list.
#[instrument(level = "trace", skip(mask))]
pub fn mask_to_polygons(mask: ArrayView2<f32>, threshold: f32, max_points: usize) -> Vec<Vec<f32>> {
    let image = to_binary_image(mask, threshold);
    find_contours::<i32>(&image)
        .into_iter()
        .filter(|it| it.border_type == BorderType::Outer)
        .filter(|it| !it.points.is_empty())
        .map(|it| to_geo_poly(&subsample(&it.points, max_points)))
        .map(|poly| flatten(&poly))
        .collect()
}

fn subsample(points: &[Point<i32>], max_points: usize) -> Vec<Point<i32>> {
    if max_points > 1 && points.len() >= max_points {
        let step = points.len() / (max_points - 1);
        points.iter().copied().step_by(step).take(max_points).collect()
    } else {
        points.to_vec()
    }
}

/// Builds an explicitly closed polygon, including single-point contours.
pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f32> {
    let mut coords = points
        .iter()
        .map(|point| Coord {
            x: point.x as f32,
            y: point.y as f32,
        })
        .collect::<Vec<_>>();
    if let Some(first) = coords.first().copied() {
        coords.push(first);
    }
    Polygon::new(LineString::new(coords), vec![])
}

fn flatten(poly: &Polygon<f32>) -> Vec<f32> {
    poly.exterior()
        .coords()
        .flat_map(|coord| [coord.x, coord.y])
        .collect()
}

/// Parses a flattened COCO polygon back into a geometry. Trailing odd values are ignored.
pub fn from_flat(flat: &[f32]) -> Polygon<f32> {
    let coords = flat
        .chunks_exact(2)
        .map(|pair| Coord {
            x: pair[0],
            y: pair[1],
        })
        .collect::<Vec<_>>();
    Polygon::new(LineString::new(coords), vec![])
}

/// Shoelace area of a flattened polygon.
pub fn polygon_area(flat: &[f32]) -> f32 {
    from_flat(flat).unsigned_area()
}

/// Pixel count of `mask` at or above `threshold`.
pub fn mask_area(mask: ArrayView2<f32>, threshold: f32) -> f64 {
    mask.iter().filter(|value| **value >= threshold).count() as f64
}
