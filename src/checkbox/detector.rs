use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::page::{PixelRect, points_to_pixels};

const BACKGROUND: Luma<u8> = Luma([255]);
const INK: u8 = 255;

/// Detector thresholds. Every length is in points and converted with the
/// raster DPI, so the same config works at any rendering resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub blur_sigma_pt: f64,
    /// Must exceed `max_side_pt` or filled boxes lose their interior.
    pub block_radius_pt: f64,
    pub threshold_offset: u8,
    pub min_side_pt: f64,
    pub max_side_pt: f64,
    /// Largest accepted long-side / short-side ratio.
    pub max_aspect_ratio: f64,
    pub min_area_pt2: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            blur_sigma_pt: 0.25,
            block_radius_pt: 20.0,
            threshold_offset: 10,
            min_side_pt: 6.0,
            max_side_pt: 18.0,
            max_aspect_ratio: 1.25,
            min_area_pt2: 36.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateRegion {
    pub id: String,
    pub page: u32,
    pub rect: PixelRect,
}

pub struct DetectedRegions {
    /// Ink is 255, background 0.
    pub binary: GrayImage,
    pub candidates: Vec<CandidateRegion>,
}

pub struct RegionDetector {
    config: DetectorConfig,
}

impl RegionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn detect(
        &self,
        page: u32,
        image: &GrayImage,
        dpi: f64,
        text_boxes: &[PixelRect],
    ) -> DetectedRegions {
        let masked = mask_text_boxes(image, text_boxes);
        let binary = self.binarize(&masked, dpi);
        let candidates = self.find_candidates(page, &binary, dpi);
        DetectedRegions { binary, candidates }
    }

    pub fn binarize(&self, image: &GrayImage, dpi: f64) -> GrayImage {
        let sigma = points_to_pixels(self.config.blur_sigma_pt, dpi) as f32;
        let blurred = if sigma > 0.0 {
            gaussian_blur_f32(image, sigma)
        } else {
            image.clone()
        };
        let radius = points_to_pixels(self.config.block_radius_pt, dpi).round().max(1.0) as u32;
        adaptive_mean_threshold(&blurred, radius, self.config.threshold_offset)
    }

    fn find_candidates(&self, page: u32, binary: &GrayImage, dpi: f64) -> Vec<CandidateRegion> {
        let min_side = points_to_pixels(self.config.min_side_pt, dpi);
        let max_side = points_to_pixels(self.config.max_side_pt, dpi);
        let min_area = points_to_pixels(1.0, dpi).powi(2) * self.config.min_area_pt2;

        let contours: Vec<Contour<u32>> = find_contours(binary);
        let mut rects = contours
            .iter()
            .filter(|contour| contour.border_type == BorderType::Outer)
            .filter_map(contour_bounds)
            .filter(|rect| {
                let width = rect.width as f64;
                let height = rect.height as f64;
                let aspect = width.max(height) / width.min(height);
                width >= min_side
                    && height >= min_side
                    && width <= max_side
                    && height <= max_side
                    && aspect <= self.config.max_aspect_ratio
                    && rect.area() as f64 >= min_area
            })
            .collect::<Vec<PixelRect>>();

        rects.sort_by_key(|rect| (rect.y, rect.x, rect.width, rect.height));
        rects.dedup();

        let outermost = rects
            .iter()
            .filter(|rect| {
                !rects
                    .iter()
                    .any(|other| other != *rect && other.contains(rect))
            })
            .copied()
            .collect::<Vec<PixelRect>>();

        outermost
            .into_iter()
            .enumerate()
            .map(|(ordinal, rect)| CandidateRegion {
                id: format!("{page}:r{ordinal}"),
                page,
                rect,
            })
            .collect()
    }
}

pub fn mask_text_boxes(image: &GrayImage, text_boxes: &[PixelRect]) -> GrayImage {
    let mut masked = image.clone();
    let (width, height) = masked.dimensions();
    for text_box in text_boxes {
        if text_box.x >= width || text_box.y >= height {
            continue;
        }
        let clipped_width = text_box.width.min(width - text_box.x).max(1);
        let clipped_height = text_box.height.min(height - text_box.y).max(1);
        draw_filled_rect_mut(
            &mut masked,
            Rect::at(text_box.x as i32, text_box.y as i32).of_size(clipped_width, clipped_height),
            BACKGROUND,
        );
    }
    masked
}

/// Mean-C adaptive threshold over a `(2r+1)^2` window, computed with an
/// integral image. Pixels darker than the local mean minus `offset` become
/// ink (255).
pub fn adaptive_mean_threshold(image: &GrayImage, radius: u32, offset: u8) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut output = GrayImage::new(width, height);
    if width == 0 || height == 0 {
        return output;
    }

    let stride = width as usize + 1;
    let mut integral = vec![0u64; stride * (height as usize + 1)];
    for y in 0..height as usize {
        let mut row_sum = 0u64;
        for x in 0..width as usize {
            row_sum += image.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row_sum;
        }
    }

    for y in 0..height {
        let top = y.saturating_sub(radius) as usize;
        let bottom = (y + radius + 1).min(height) as usize;
        for x in 0..width {
            let left = x.saturating_sub(radius) as usize;
            let right = (x + radius + 1).min(width) as usize;
            let sum = integral[bottom * stride + right] + integral[top * stride + left]
                - integral[top * stride + right]
                - integral[bottom * stride + left];
            let count = ((bottom - top) * (right - left)) as u64;
            let mean = (sum / count) as i64;

            let value = image.get_pixel(x, y)[0] as i64;
            if value < mean - offset as i64 {
                output.put_pixel(x, y, Luma([INK]));
            }
        }
    }

    output
}

fn contour_bounds(contour: &Contour<u32>) -> Option<PixelRect> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for point in &contour.points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    Some(PixelRect {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}
