use super::*;

/// Expected parameter codes for a relay family, as published by the vendor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Glossary {
    /// Restricts the comparison to rows staged under this grammar.
    #[serde(default)]
    pub grammar: Option<String>,
    pub entries: Vec<GlossaryEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlossaryEntry {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UnexpectedCode {
    pub(crate) code: String,
    pub(crate) filenames: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DescriptionMismatch {
    pub(crate) code: String,
    pub(crate) filename: String,
    pub(crate) row_index: i64,
    pub(crate) expected: String,
    pub(crate) staged: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LowConfidenceRow {
    pub(crate) code: String,
    pub(crate) filename: String,
    pub(crate) row_index: i64,
    pub(crate) overall_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct Findings {
    pub(crate) staged_rows: usize,
    pub(crate) matched_codes: usize,
    pub(crate) missing_codes: Vec<GlossaryEntry>,
    pub(crate) unexpected_codes: Vec<UnexpectedCode>,
    pub(crate) description_mismatches: Vec<DescriptionMismatch>,
    pub(crate) low_confidence_rows: Vec<LowConfidenceRow>,
    pub(crate) not_evaluated_checkboxes: usize,
}

impl Findings {
    pub(crate) fn has_glossary_differences(&self) -> bool {
        !self.missing_codes.is_empty()
            || !self.unexpected_codes.is_empty()
            || !self.description_mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ValidationCheck {
    pub(crate) check_id: String,
    pub(crate) name: String,
    pub(crate) result: String,
}

pub(crate) fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Case- and whitespace-insensitive form used to compare descriptions.
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn compare_rows(
    glossary: &Glossary,
    rows: &[StagedRow],
    min_confidence: f64,
) -> Findings {
    let expected = glossary
        .entries
        .iter()
        .map(|entry| (normalize_code(&entry.code), entry))
        .collect::<BTreeMap<String, &GlossaryEntry>>();

    let mut seen = BTreeSet::new();
    let mut unexpected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut findings = Findings {
        staged_rows: rows.len(),
        ..Findings::default()
    };

    for row in rows {
        let record = &row.record;
        let code = normalize_code(&record.code);

        match expected.get(&code) {
            Some(entry) => {
                seen.insert(code.clone());
                // Rows without a printed description carry nothing to compare.
                if !record.description.trim().is_empty()
                    && normalize_text(&record.description) != normalize_text(&entry.name)
                {
                    findings.description_mismatches.push(DescriptionMismatch {
                        code: entry.code.clone(),
                        filename: row.filename.clone(),
                        row_index: row.row_index,
                        expected: entry.name.clone(),
                        staged: record.description.clone(),
                    });
                }
            }
            None => {
                unexpected
                    .entry(code.clone())
                    .or_default()
                    .insert(row.filename.clone());
            }
        }

        if record.overall_confidence < min_confidence {
            findings.low_confidence_rows.push(LowConfidenceRow {
                code: record.code.clone(),
                filename: row.filename.clone(),
                row_index: row.row_index,
                overall_confidence: record.overall_confidence,
            });
        }
        findings.not_evaluated_checkboxes += record.count_state(CheckboxState::NotEvaluated);
    }

    findings.matched_codes = seen.len();
    findings.missing_codes = expected
        .iter()
        .filter(|(code, _)| !seen.contains(*code))
        .map(|(_, entry)| (*entry).clone())
        .collect();
    findings.unexpected_codes = unexpected
        .into_iter()
        .map(|(code, filenames)| UnexpectedCode {
            code,
            filenames: filenames.into_iter().collect(),
        })
        .collect();

    findings
}

pub(crate) fn build_checks(findings: &Findings) -> Vec<ValidationCheck> {
    let check = |check_id: &str, name: &str, passed: bool| ValidationCheck {
        check_id: check_id.to_string(),
        name: name.to_string(),
        result: if passed { "pass" } else { "fail" }.to_string(),
    };

    vec![
        check(
            "V-001",
            "Every glossary code is staged",
            findings.missing_codes.is_empty(),
        ),
        check(
            "V-002",
            "No staged code is absent from the glossary",
            findings.unexpected_codes.is_empty(),
        ),
        check(
            "V-003",
            "Staged descriptions match glossary names",
            findings.description_mismatches.is_empty(),
        ),
        check(
            "V-004",
            "Row confidence at or above the minimum",
            findings.low_confidence_rows.is_empty(),
        ),
        check(
            "V-005",
            "Every attributed checkbox was classified",
            findings.not_evaluated_checkboxes == 0,
        ),
    ]
}
