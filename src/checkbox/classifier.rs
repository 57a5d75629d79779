use image::GrayImage;
use serde::{Deserialize, Serialize};

use super::calibration::CalibrationRecord;
use crate::issues::ExtractionIssue;
use crate::page::{PixelRect, points_to_pixels};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Checked,
    Unchecked,
    RejectedAsNoise,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checked => "checked",
            Self::Unchecked => "unchecked",
            Self::RejectedAsNoise => "rejected_as_noise",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedDensity {
    pub classification: Classification,
    pub confidence: f64,
}

/// Classifier bound to one valid calibration. It cannot be built without
/// one, which is how an uncalibrated template blocks classification.
#[derive(Debug, Clone)]
pub struct StateClassifier {
    template_id: String,
    threshold: f64,
    noise_floor: f64,
    separation_margin: f64,
}

impl StateClassifier {
    pub fn from_calibration(
        template_id: &str,
        record: Option<&CalibrationRecord>,
    ) -> Result<Self, ExtractionIssue> {
        let Some(record) = record else {
            return Err(ExtractionIssue::CalibrationMissing {
                template_id: template_id.to_string(),
            });
        };
        if !record.is_valid() {
            return Err(ExtractionIssue::CalibrationInvalid {
                template_id: template_id.to_string(),
                separation_margin: record.separation_margin,
            });
        }

        Ok(Self {
            template_id: template_id.to_string(),
            threshold: record.threshold,
            noise_floor: record.noise_floor,
            separation_margin: record.separation_margin,
        })
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn classify_density(&self, density: f64) -> ClassifiedDensity {
        if density < self.noise_floor {
            return ClassifiedDensity {
                classification: Classification::RejectedAsNoise,
                confidence: 1.0,
            };
        }

        let classification = if density > self.threshold {
            Classification::Checked
        } else {
            Classification::Unchecked
        };
        let half_margin = self.separation_margin / 2.0;
        let closeness = ((density - self.threshold).abs() / half_margin).min(1.0);

        ClassifiedDensity {
            classification,
            confidence: 0.5 + 0.5 * closeness,
        }
    }
}

pub fn interior_margin_px(margin_pt: f64, dpi: f64) -> u32 {
    points_to_pixels(margin_pt, dpi).round().max(1.0) as u32
}

/// Foreground fraction inside `rect` after shrinking it by `margin` pixels.
/// A region too small to have an interior reads as empty.
pub fn interior_ink_density(binary: &GrayImage, rect: &PixelRect, margin: u32) -> f64 {
    let Some(interior) = rect.shrink(margin) else {
        return 0.0;
    };

    let (width, height) = binary.dimensions();
    let right = interior.right().min(width);
    let bottom = interior.bottom().min(height);
    if interior.x >= right || interior.y >= bottom {
        return 0.0;
    }

    let mut ink = 0u64;
    for y in interior.y..bottom {
        for x in interior.x..right {
            if binary.get_pixel(x, y)[0] > 0 {
                ink += 1;
            }
        }
    }

    let total = (right - interior.x) as u64 * (bottom - interior.y) as u64;
    ink as f64 / total as f64
}
