use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::format::{DetectionSource, Grammar};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    KeyValue,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" | "cfg" | "set" | "ini" => Some(Self::KeyValue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::KeyValue => "key_value",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub filename: String,
    pub kind: DocumentKind,
    pub byte_len: u64,
    pub sha256: String,
    pub grammar: Option<Grammar>,
    pub detected_via: Option<DetectionSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub document_count: usize,
    pub recognized_count: usize,
    pub documents: Vec<DocumentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVersions {
    pub pdfinfo: Option<String>,
    pub pdftotext: Option<String>,
    pub pdftoppm: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractPaths {
    pub cache_root: String,
    pub source_directory: String,
    pub manifest_dir: String,
    pub inventory_manifest_path: String,
    pub db_path: String,
    pub calibration_path: String,
    pub config_path: Option<String>,
    pub records_jsonl_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractCounts {
    pub document_count: usize,
    pub completed_count: usize,
    pub partial_count: usize,
    pub failed_count: usize,
    pub timed_out_count: usize,
    pub pages_processed: usize,
    pub records_emitted: usize,
    pub checkboxes_attributed: usize,
    pub checkboxes_checked: usize,
    pub checkboxes_not_evaluated: usize,
    pub unattributable_checkboxes: usize,
    pub noise_regions_rejected: usize,
    pub low_confidence_tokens: usize,
    pub rows_staged: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub filename: String,
    pub grammar: Option<Grammar>,
    pub template_id: Option<String>,
    pub status: String,
    pub pages_processed: usize,
    pub record_count: usize,
    pub issue_count: usize,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub jobs: usize,
    pub raster_dpi: f64,
    pub tool_versions: ToolVersions,
    pub paths: ExtractPaths,
    pub counts: ExtractCounts,
    pub documents: Vec<DocumentSummary>,
    pub source_hashes: Vec<DocumentEntry>,
    pub warnings: Vec<String>,
}
