use image::{DynamicImage, GrayImage, ImageBuffer};
use ndarray::{Array3, ArrayView2, Axis};
use tracing::instrument;

/// Converts to an `[3, H, W]` tensor with values in `[0, 1]`.
#[instrument(level = "debug", skip(image))]
pub(crate) fn to_chw_tensor(image: &DynamicImage) -> Array3<f32> {
    let image = image.to_rgb32f();
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).0[ch],
    )
}

/// Binarizes a probability mask: pixels at or above `threshold` become 255.
pub(crate) fn to_binary_image(data: ArrayView2<f32>, threshold: f32) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        if data[[y as usize, x as usize]] >= threshold {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    })
}
