use serde::{Deserialize, Serialize};

use crate::checkbox::Classification;
use crate::format::Grammar;
use crate::page::BoundingBox;
use crate::tokenizer::ValueToken;

pub const TOKEN_COLUMNS: usize = 8;
pub const CHECKBOX_COLUMNS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterCode {
    pub id: String,
    pub page: u32,
    pub code: String,
    pub description: String,
    pub raw_value: String,
    /// Anchor of the code word in PDF points.
    pub anchor: BoundingBox,
}

impl ParameterCode {
    pub fn new(
        page: u32,
        ordinal: usize,
        code: String,
        description: String,
        raw_value: String,
        anchor: BoundingBox,
    ) -> Self {
        Self {
            id: format!("{page}:{ordinal}"),
            page,
            code,
            description,
            raw_value,
            anchor,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckboxState {
    Checked,
    Unchecked,
    NotEvaluated,
}

impl CheckboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checked => "checked",
            Self::Unchecked => "unchecked",
            Self::NotEvaluated => "not_evaluated",
        }
    }

    /// Noise never reaches a record, so it has no state.
    pub fn from_classification(classification: Option<Classification>) -> Option<Self> {
        match classification {
            None => Some(Self::NotEvaluated),
            Some(Classification::Checked) => Some(Self::Checked),
            Some(Classification::Unchecked) => Some(Self::Unchecked),
            Some(Classification::RejectedAsNoise) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub code: String,
    pub description: String,
    pub raw_value: String,
    pub page: u32,
    pub grammar: Grammar,
    pub template_id: String,
    pub tokens: Vec<ValueToken>,
    pub checkbox_states: Vec<CheckboxState>,
    pub overall_confidence: f64,
}

impl ParameterRecord {
    pub fn checked_count(&self) -> usize {
        self.count_state(CheckboxState::Checked)
    }

    pub fn count_state(&self, state: CheckboxState) -> usize {
        self.checkbox_states
            .iter()
            .filter(|value| **value == state)
            .count()
    }
}

/// Checkbox that could not be attributed to any parameter code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckboxDiagnostic {
    pub page: u32,
    pub region_id: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub state: CheckboxState,
    pub interior_ink_density: f64,
}

/// Importer-facing row: fixed repeated columns for tokens and checkbox
/// states. Overflow is folded into the last column so nothing is lost.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRow {
    pub code: String,
    pub description: String,
    pub raw_value: String,
    pub token_columns: Vec<Option<String>>,
    pub checkbox_columns: Vec<Option<String>>,
    pub overall_confidence: f64,
}

pub fn flatten_record(record: &ParameterRecord) -> FlatRow {
    let token_cells = record
        .tokens
        .iter()
        .map(|token| format!("{}={}", token.token_type.as_str(), token.text))
        .collect::<Vec<String>>();
    let checkbox_cells = record
        .checkbox_states
        .iter()
        .map(|state| state.as_str().to_string())
        .collect::<Vec<String>>();

    FlatRow {
        code: record.code.clone(),
        description: record.description.clone(),
        raw_value: record.raw_value.clone(),
        token_columns: fold_into_columns(token_cells, TOKEN_COLUMNS, "|"),
        checkbox_columns: fold_into_columns(checkbox_cells, CHECKBOX_COLUMNS, ","),
        overall_confidence: record.overall_confidence,
    }
}

pub fn flat_row_header() -> Vec<String> {
    let mut header = vec![
        "code".to_string(),
        "description".to_string(),
        "raw_value".to_string(),
    ];
    header.extend((1..=TOKEN_COLUMNS).map(|index| format!("token_{index}")));
    header.extend((1..=CHECKBOX_COLUMNS).map(|index| format!("checkbox_{index}")));
    header.push("overall_confidence".to_string());
    header
}

fn fold_into_columns(cells: Vec<String>, width: usize, joiner: &str) -> Vec<Option<String>> {
    let mut columns = vec![None; width];
    if width == 0 {
        return columns;
    }

    let overflow_start = width - 1;
    for (index, cell) in cells.into_iter().enumerate() {
        let slot = index.min(overflow_start);
        match &mut columns[slot] {
            Some(existing) if index > overflow_start => {
                existing.push_str(joiner);
                existing.push_str(&cell);
            }
            column => *column = Some(cell),
        }
    }
    columns
}

/// Confidence for a whole record: the weaker of the value's token
/// confidence and the mean checkbox confidence. A checkbox that was not
/// evaluated contributes zero.
pub fn overall_confidence(token_confidence: f64, checkbox_confidences: &[f64]) -> f64 {
    if checkbox_confidences.is_empty() {
        return token_confidence;
    }
    let mean = checkbox_confidences.iter().sum::<f64>() / checkbox_confidences.len() as f64;
    token_confidence.min(mean)
}
