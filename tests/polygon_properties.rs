//! Invariants of mask-to-polygon conversion over arbitrary masks.

use ndarray::Array2;
use proptest::prelude::*;
use tcalayout::polygon::{mask_to_polygons, MAX_POLYGON_POINTS};

fn masks() -> impl Strategy<Value = Array2<f32>> {
    (1usize..64, 1usize..64).prop_flat_map(|(height, width)| {
        proptest::collection::vec(0.0f32..1.0, height * width).prop_map(move |data| {
            Array2::from_shape_vec((height, width), data).expect("length matches shape")
        })
    })
}

/// Random blocks, so contours get long enough to be subsampled.
fn blob_masks() -> impl Strategy<Value = Array2<f32>> {
    proptest::collection::vec((0usize..80, 0usize..80, 1usize..60, 1usize..60), 1..6).prop_map(
        |blocks| {
            let mut mask = Array2::zeros((96, 96));
            for (y, x, h, w) in blocks {
                let (y1, x1) = ((y + h).min(96), (x + w).min(96));
                mask.slice_mut(ndarray::s![y..y1, x..x1]).fill(1.0);
            }
            mask
        },
    )
}

fn check_polygons(mask: &Array2<f32>, threshold: f32) -> Result<usize, TestCaseError> {
    let (height, width) = mask.dim();
    let mut most = 0;
    for polygon in mask_to_polygons(mask.view(), threshold, MAX_POLYGON_POINTS) {
        let len = polygon.len();
        prop_assert!(len % 2 == 0 && len >= 4, "bad length {len}");
        prop_assert_eq!(&polygon[..2], &polygon[len - 2..]);
        // the closing point repeats the first one
        let distinct = len / 2 - 1;
        prop_assert!(distinct <= MAX_POLYGON_POINTS, "{distinct} vertices");
        most = most.max(distinct);
        for xy in polygon.chunks_exact(2) {
            prop_assert!((0.0..width as f32).contains(&xy[0]));
            prop_assert!((0.0..height as f32).contains(&xy[1]));
        }
    }
    Ok(most)
}

#[test]
fn noise_masks_give_closed_capped_polygons() {
    proptest!(ProptestConfig::with_cases(200), |(mask in masks(), threshold in 0.05f32..0.95)| {
        check_polygons(&mask, threshold)?;
    });
}

#[test]
fn blob_masks_give_closed_capped_polygons() {
    proptest!(ProptestConfig::with_cases(100), |(mask in blob_masks())| {
        check_polygons(&mask, 0.5)?;
    });
}

#[test]
fn large_blob_uses_full_vertex_budget() {
    // a 40x62 block has a contour of about 200 points
    let mut mask = Array2::zeros((96, 96));
    mask.slice_mut(ndarray::s![10..50, 10..72]).fill(1.0);
    let most = check_polygons(&mask, 0.5).unwrap();
    assert_eq!(most, MAX_POLYGON_POINTS);
}
