//! Annotated overlay images for inspecting predictions.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use tracing::instrument;

use crate::{error::ensure_exists, label_color, CategoryIndex, Detection, Error, Result};

pub struct OverlayStyle {
    pub line_thickness: u32,
    pub mask_alpha: f32,
    pub mask_threshold: f32,
    pub font: Option<FontVec>,
    pub font_size: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            line_thickness: 3,
            mask_alpha: 0.5,
            mask_threshold: 0.5,
            font: None,
            font_size: 20.0,
        }
    }
}

impl OverlayStyle {
    /// Loads a TrueType/OpenType font for captions.
    pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = ensure_exists(path.as_ref())?;
        let bytes = std::fs::read(&path)?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| Error::Font(format!("{}: {e}", path.display())))?;
        self.font = Some(font);
        Ok(self)
    }
}

/// Draws masks, boxes and (when a font is configured) `name: score%` captions.
#[instrument(level = "debug", skip_all, fields(detections = detections.len()))]
pub fn draw_detections(
    image: &DynamicImage,
    detections: &[Detection],
    index: &CategoryIndex,
    style: &OverlayStyle,
) -> RgbImage {
    let mut canvas = image.to_rgb8();
    for detection in detections {
        blend_mask(&mut canvas, detection, style);
    }
    for detection in detections {
        let color = label_color(detection.category_id);
        if let Some(rect) = box_rect(&canvas, detection.bbox) {
            draw_thick_rect(&mut canvas, rect, color, style.line_thickness);
            if let Some(font) = &style.font {
                let caption = format!(
                    "{}: {}%",
                    index.name(detection.category_id),
                    (detection.score * 100.0) as u32
                );
                draw_caption(&mut canvas, rect, &caption, color, font, style.font_size);
            }
        }
    }
    canvas
}

fn blend_mask(canvas: &mut RgbImage, detection: &Detection, style: &OverlayStyle) {
    let color = label_color(detection.category_id);
    let alpha = style.mask_alpha.clamp(0.0, 1.0);
    for ((y, x), value) in detection.mask.indexed_iter() {
        if *value < style.mask_threshold {
            continue;
        }
        let (x, y) = (x as u32, y as u32);
        if x >= canvas.width() || y >= canvas.height() {
            continue;
        }
        let pixel = canvas.get_pixel_mut(x, y);
        for (channel, tint) in pixel.0.iter_mut().zip(color.0) {
            *channel = (*channel as f32 * (1.0 - alpha) + tint as f32 * alpha).round() as u8;
        }
    }
}

/// Clamps an `x1, y1, x2, y2` box to the canvas.
fn box_rect(canvas: &RgbImage, [x1, y1, x2, y2]: [f32; 4]) -> Option<Rect> {
    let (width, height) = canvas.dimensions();
    let x1 = (x1.max(0.0) as u32).min(width.saturating_sub(1));
    let y1 = (y1.max(0.0) as u32).min(height.saturating_sub(1));
    let x2 = (x2.max(0.0) as u32).min(width);
    let y2 = (y2.max(0.0) as u32).min(height);
    (x2 > x1 && y2 > y1).then(|| Rect::at(x1 as i32, y1 as i32).of_size(x2 - x1, y2 - y1))
}

fn draw_thick_rect(canvas: &mut RgbImage, rect: Rect, color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness.max(1) {
        let width = rect.width().saturating_sub(2 * t);
        let height = rect.height().saturating_sub(2 * t);
        if width == 0 || height == 0 {
            break;
        }
        let inner = Rect::at(rect.left() + t as i32, rect.top() + t as i32).of_size(width, height);
        draw_hollow_rect_mut(canvas, inner, color);
    }
}

fn draw_caption(
    canvas: &mut RgbImage,
    rect: Rect,
    caption: &str,
    color: Rgb<u8>,
    font: &FontVec,
    font_size: f32,
) {
    let scale = PxScale::from(font_size);
    let (text_width, text_height) = text_size(scale, font, caption);
    let top = if rect.top() >= text_height as i32 + 2 {
        rect.top() - text_height as i32 - 2
    } else {
        rect.bottom() + 1
    };
    let background = Rect::at(rect.left(), top).of_size(text_width.max(1) + 4, text_height.max(1) + 2);
    draw_filled_rect_mut(canvas, background, color);
    draw_text_mut(
        canvas,
        Rgb([255, 255, 255]),
        rect.left() + 2,
        top + 1,
        scale,
        font,
        caption,
    );
}

#[cfg(test)]
mod tests {
    use ndarray::{s, Array2};

    use super::*;

    fn detection(bbox: [f32; 4], category_id: u32) -> Detection {
        let mut mask = Array2::zeros((40, 60));
        mask.slice_mut(s![12..20, 12..20]).fill(1.0);
        Detection {
            bbox,
            category_id,
            score: 0.9,
            mask,
        }
    }

    #[test]
    fn boxes_and_masks_are_painted() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(60, 40));
        let overlay = draw_detections(
            &image,
            &[detection([10.0, 10.0, 30.0, 25.0], 2)],
            &CategoryIndex::default(),
            &OverlayStyle::default(),
        );
        let color = label_color(2);
        assert_eq!(overlay.dimensions(), (60, 40));
        assert_eq!(*overlay.get_pixel(10, 10), color);
        assert_eq!(*overlay.get_pixel(29, 24), color);
        // mask interior is blended halfway towards the label colour
        let blended = overlay.get_pixel(15, 15);
        assert_eq!(blended.0[0], (color.0[0] as f32 * 0.5).round() as u8);
        assert_eq!(*overlay.get_pixel(50, 35), Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_boxes_are_skipped() {
        let canvas = RgbImage::new(20, 20);
        assert!(box_rect(&canvas, [5.0, 5.0, 5.0, 9.0]).is_none());
        assert!(box_rect(&canvas, [-5.0, -5.0, 50.0, 50.0]).is_some());
    }

    #[test]
    fn missing_font_is_reported() {
        let result = OverlayStyle::default().with_font_file("/nonexistent/font.ttf");
        assert!(matches!(result, Err(Error::MissingFile(_))));
    }
}
