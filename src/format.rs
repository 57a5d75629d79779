use std::fmt;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::issues::ExtractionIssue;

pub const SNIFF_LINE_LIMIT: usize = 40;
pub const SNIFF_BYTE_LIMIT: usize = 16 * 1024;
const SAMPLE_CHAR_LIMIT: usize = 120;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grammar {
    MicomP122x205,
    MicomP122,
    MicomP220,
    SepamS40,
    SelSettings,
}

impl Grammar {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MicomP122x205 => "micom_p122_205",
            Self::MicomP122 => "micom_p122",
            Self::MicomP220 => "micom_p220",
            Self::SepamS40 => "sepam_s40",
            Self::SelSettings => "sel_settings",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "micom_p122_205" => Some(Self::MicomP122x205),
            "micom_p122" => Some(Self::MicomP122),
            "micom_p220" => Some(Self::MicomP220),
            "sepam_s40" => Some(Self::SepamS40),
            "sel_settings" => Some(Self::SelSettings),
            _ => None,
        }
    }

    /// Template family used for calibration lookup unless the config
    /// overrides it.
    pub fn default_template_id(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Detection {
    Recognized { grammar: Grammar, via: DetectionSource },
    Unrecognized,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Filename,
    Content,
}

impl DetectionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filename => "filename",
            Self::Content => "content",
        }
    }
}

// Ordered most-specific first: the 205 variant must win over plain P122.
const FILENAME_RULES: &[(Grammar, &str)] = &[
    (Grammar::MicomP122x205, r"(?i)P122[-_ ]?205"),
    (Grammar::MicomP122, r"(?i)P122"),
    (Grammar::MicomP220, r"(?i)P220"),
    (Grammar::SepamS40, r"(?i)SEPAM|(?:^|[^A-Z0-9])S4\d(?:[^0-9]|$)"),
    (Grammar::SelSettings, r"(?i)SEL[-_ ]?\d{3}"),
];

// Assignment syntax is structural, so it outranks model names that may
// appear inside SEL values.
const CONTENT_MARKERS: &[(Grammar, &[&str])] = &[
    (Grammar::SelSettings, &["RID :=", "RID:=", "TID :=", "TID:="]),
    (Grammar::MicomP122x205, &["P122-205", "P122 205", "P122_205"]),
    (Grammar::MicomP122, &["MICOM P122", "P122"]),
    (Grammar::MicomP220, &["MICOM P220", "P220"]),
    (Grammar::SepamS40, &["SEPAM"]),
];

pub struct FormatDetector {
    filename_rules: Vec<(Grammar, Regex)>,
}

impl FormatDetector {
    pub fn new() -> Result<Self> {
        let mut filename_rules = Vec::with_capacity(FILENAME_RULES.len());
        for (grammar, pattern) in FILENAME_RULES {
            let regex = Regex::new(pattern)
                .with_context(|| format!("failed to compile filename rule for {grammar}"))?;
            filename_rules.push((*grammar, regex));
        }
        Ok(Self { filename_rules })
    }

    pub fn detect(&self, filename: &str, leading: &[u8]) -> Detection {
        if let Some(grammar) = self.match_filename(filename) {
            return Detection::Recognized {
                grammar,
                via: DetectionSource::Filename,
            };
        }

        match sniff_content(leading) {
            Some(grammar) => Detection::Recognized {
                grammar,
                via: DetectionSource::Content,
            },
            None => Detection::Unrecognized,
        }
    }

    /// Same as [`detect`](Self::detect) but turns `Unrecognized` into the
    /// diagnostic the caller must surface.
    pub fn require(&self, filename: &str, leading: &[u8]) -> Result<Grammar, ExtractionIssue> {
        match self.detect(filename, leading) {
            Detection::Recognized { grammar, .. } => Ok(grammar),
            Detection::Unrecognized => Err(ExtractionIssue::FormatUnrecognized {
                filename: filename.to_string(),
                sample: sample_leading_bytes(leading),
            }),
        }
    }

    fn match_filename(&self, filename: &str) -> Option<Grammar> {
        self.filename_rules
            .iter()
            .find(|(_, regex)| regex.is_match(filename))
            .map(|(grammar, _)| *grammar)
    }
}

fn sniff_content(leading: &[u8]) -> Option<Grammar> {
    let limit = leading.len().min(SNIFF_BYTE_LIMIT);
    let text = String::from_utf8_lossy(&leading[..limit]);
    let lines = text
        .lines()
        .take(SNIFF_LINE_LIMIT)
        .map(|line| line.to_ascii_uppercase())
        .collect::<Vec<String>>();

    CONTENT_MARKERS
        .iter()
        .find(|(_, markers)| {
            lines
                .iter()
                .any(|line| markers.iter().any(|marker| line.contains(marker)))
        })
        .map(|(grammar, _)| *grammar)
}

fn sample_leading_bytes(leading: &[u8]) -> String {
    String::from_utf8_lossy(leading)
        .chars()
        .take(SAMPLE_CHAR_LIMIT)
        .map(|character| {
            if character.is_control() && character != '\n' {
                ' '
            } else {
                character
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FormatDetector {
        FormatDetector::new().expect("filename rules compile")
    }

    #[test]
    fn variant_rule_wins_over_shorter_prefix() {
        let detector = detector();
        assert_eq!(
            detector.detect("SE_P122-205_feeder06.pdf", b""),
            Detection::Recognized {
                grammar: Grammar::MicomP122x205,
                via: DetectionSource::Filename
            }
        );
        assert_eq!(
            detector.detect("P122_204-PN-06.pdf", b""),
            Detection::Recognized {
                grammar: Grammar::MicomP122,
                via: DetectionSource::Filename
            }
        );
    }

    #[test]
    fn content_sniffing_is_used_when_filename_is_neutral() {
        let detector = detector();
        let content = b"Relay settings export\nRID := FEEDER 06\nTID := SUB 204\n";
        assert_eq!(
            detector.detect("export.txt", content),
            Detection::Recognized {
                grammar: Grammar::SelSettings,
                via: DetectionSource::Content
            }
        );
    }

    #[test]
    fn sel_assignments_win_over_model_names_in_values() {
        let detector = detector();
        let content = b"RID := P122_204-PN-06\nTID := SUB 204\n";
        assert!(matches!(
            detector.detect("export.txt", content),
            Detection::Recognized {
                grammar: Grammar::SelSettings,
                ..
            }
        ));
    }

    #[test]
    fn content_markers_beyond_the_sniff_window_are_ignored() {
        let detector = detector();
        let mut content = "filler\n".repeat(SNIFF_LINE_LIMIT);
        content.push_str("MiCOM P220\n");
        assert_eq!(
            detector.detect("dump.txt", content.as_bytes()),
            Detection::Unrecognized
        );
    }

    #[test]
    fn unrecognized_documents_carry_a_diagnostic_sample() {
        let detector = detector();
        let issue = detector
            .require("notes.txt", b"hello\x00world\n")
            .expect_err("no grammar should match");
        match issue {
            ExtractionIssue::FormatUnrecognized { filename, sample } => {
                assert_eq!(filename, "notes.txt");
                assert_eq!(sample, "hello world");
            }
            other => panic!("unexpected issue {other:?}"),
        }
    }

    #[test]
    fn sepam_rule_does_not_fire_inside_longer_numbers() {
        let detector = detector();
        assert_eq!(detector.detect("report_S412.txt", b""), Detection::Unrecognized);
        assert!(matches!(
            detector.detect("bay_S40_settings.txt", b""),
            Detection::Recognized {
                grammar: Grammar::SepamS40,
                ..
            }
        ));
    }

    #[test]
    fn grammar_tags_round_trip_through_parse() {
        for grammar in [
            Grammar::MicomP122x205,
            Grammar::MicomP122,
            Grammar::MicomP220,
            Grammar::SepamS40,
            Grammar::SelSettings,
        ] {
            assert_eq!(Grammar::parse(grammar.as_str()), Some(grammar));
        }
    }
}
