mod calibration;
mod classifier;
mod correlator;
mod detector;

pub use calibration::{
    CalibrationRecord, CalibrationStore, LabeledSample, SampleLabel, calibrate, separation_violations,
};
pub use classifier::{Classification, StateClassifier, interior_ink_density, interior_margin_px};
pub use correlator::{
    AnchorPosition, RegionPosition, ToleranceMode, correlate, resolve_tolerance_px,
};
pub use detector::{CandidateRegion, DetectorConfig, RegionDetector, mask_text_boxes};

use image::GrayImage;
use serde::Serialize;

use crate::page::PixelRect;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckboxRegion {
    pub id: String,
    pub page: u32,
    pub rect: PixelRect,
    pub interior_ink_density: f64,
    /// `None` when no valid calibration was available.
    pub classification: Option<Classification>,
    pub confidence: f64,
}

impl CheckboxRegion {
    pub fn position(&self) -> RegionPosition {
        RegionPosition {
            region_id: self.id.clone(),
            center_y: self.rect.center_y(),
        }
    }

    pub fn is_noise(&self) -> bool {
        self.classification == Some(Classification::RejectedAsNoise)
    }
}

/// Measures and, when a classifier is available, labels every candidate.
pub fn classify_candidates(
    candidates: Vec<CandidateRegion>,
    binary: &GrayImage,
    margin_px: u32,
    classifier: Option<&StateClassifier>,
) -> Vec<CheckboxRegion> {
    candidates
        .into_iter()
        .map(|candidate| {
            let density = interior_ink_density(binary, &candidate.rect, margin_px);
            let classified = classifier.map(|classifier| classifier.classify_density(density));
            CheckboxRegion {
                id: candidate.id,
                page: candidate.page,
                rect: candidate.rect,
                interior_ink_density: density,
                classification: classified.map(|value| value.classification),
                confidence: classified.map(|value| value.confidence).unwrap_or(0.0),
            }
        })
        .collect()
}
