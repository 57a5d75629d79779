use serde::Serialize;
use thiserror::Error;

/// Diagnostics carried alongside extraction results. None of these abort a
/// batch; the caller decides what each one means for the document at hand.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionIssue {
    #[error("format unrecognized for {filename} (sample: {sample:?})")]
    FormatUnrecognized { filename: String, sample: String },

    #[error("no calibration record for template {template_id}")]
    CalibrationMissing { template_id: String },

    #[error(
        "calibration for template {template_id} is invalid (separation margin {separation_margin:.4})"
    )]
    CalibrationInvalid {
        template_id: String,
        separation_margin: f64,
    },

    #[error("region {region_id} rejected as noise (density {density:.4})")]
    RegionRejectedAsNoise { region_id: String, density: f64 },

    #[error("checkbox on page {page} at ({x}, {y}) has no parameter code within tolerance")]
    UnattributableCheckbox {
        page: u32,
        x: u32,
        y: u32,
        state: String,
    },

    #[error("token {text:?} of {code} has low confidence {confidence:.2}")]
    LowConfidenceToken {
        code: String,
        text: String,
        confidence: f64,
    },

    #[error("document source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("page {page} failed: {reason}")]
    PageFailed { page: u32, reason: String },

    #[error("document timed out after {elapsed_ms} ms ({pages_done} pages processed)")]
    DocumentTimedOut { elapsed_ms: u128, pages_done: usize },
}

impl ExtractionIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FormatUnrecognized { .. } => "format_unrecognized",
            Self::CalibrationMissing { .. } => "calibration_missing",
            Self::CalibrationInvalid { .. } => "calibration_invalid",
            Self::RegionRejectedAsNoise { .. } => "region_rejected_as_noise",
            Self::UnattributableCheckbox { .. } => "unattributable_checkbox",
            Self::LowConfidenceToken { .. } => "low_confidence_token",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::PageFailed { .. } => "page_failed",
            Self::DocumentTimedOut { .. } => "document_timed_out",
        }
    }

    /// Recoverable issues leave the document's records usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::FormatUnrecognized { .. } | Self::SourceUnavailable { .. }
        )
    }
}
