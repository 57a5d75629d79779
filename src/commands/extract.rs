use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rayon::prelude::*;
use rayon::ThreadPool;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkbox::{
    AnchorPosition, CalibrationStore, CheckboxRegion, RegionDetector, StateClassifier,
    classify_candidates, correlate, interior_margin_px, resolve_tolerance_px,
};
use crate::cli::ExtractArgs;
use crate::commands::inventory::{self, INVENTORY_MANIFEST_FILENAME};
use crate::config::{ExtractionConfig, TemplateSettings};
use crate::format::{FormatDetector, Grammar, SNIFF_BYTE_LIMIT};
use crate::grammar::LineGrammar;
use crate::issues::ExtractionIssue;
use crate::model::{
    DocumentInventoryManifest, DocumentKind, DocumentSummary, ExtractCounts, ExtractPaths,
    ExtractRunManifest, ToolVersions,
};
use crate::page::{
    BoundingBox, PageContent, PageRaster, PixelRect, lines_from_plain_text, lines_from_words,
};
use crate::records::{
    CHECKBOX_COLUMNS, CheckboxDiagnostic, CheckboxState, ParameterCode, ParameterRecord,
    TOKEN_COLUMNS, flat_row_header, flatten_record, overall_confidence,
};
use crate::tokenizer::FieldTokenizer;
use crate::util::{
    ensure_directory, now_utc_string, read_json, read_leading_bytes, utc_compact_string,
    write_json_lines, write_json_pretty,
};

const DB_SCHEMA_VERSION: &str = "0.1.0";
pub const STAGING_DB_FILENAME: &str = "relayscan_staging.sqlite";
pub const CALIBRATION_FILENAME: &str = "calibration.json";

mod export;
mod pipeline;
mod run;
mod sources;
#[cfg(test)]
mod tests;

pub use export::{count_rows, table_exists};
pub use run::run;

pub(crate) use export::StagingStore;
pub(crate) use pipeline::{DocumentOutcome, DocumentStatus};

use pipeline::*;
use run::*;
use sources::*;
