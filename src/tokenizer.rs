use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

const ANSI_CONFIDENCE: f64 = 0.95;
const DATE_CONFIDENCE: f64 = 0.95;
const MODEL_PREFIX_CONFIDENCE: f64 = 0.9;
const SIDE_CONFIDENCE: f64 = 0.9;
const POSITIONAL_CONFIDENCE: f64 = 0.85;
const MODEL_SERIES_CONFIDENCE: f64 = 0.85;
const MODEL_SUFFIX_CONFIDENCE: f64 = 0.8;
const REVISION_CONFIDENCE: f64 = 0.8;
const BUS_BAR_CONFIDENCE: f64 = 0.75;
const FEEDER_CONFIDENCE: f64 = 0.75;
const SEQUENCE_CONFIDENCE: f64 = 0.7;
const UNKNOWN_CONFIDENCE: f64 = 0.3;

const ANSI_CODES: &[&str] = &[
    "21", "24", "25", "27", "32", "37", "46", "47", "49", "50", "50N", "50G", "50BF", "51",
    "51N", "51G", "51V", "59", "59N", "67", "67N", "79", "81", "81O", "81U", "86", "87", "87B",
    "87T",
];

const MODEL_SERIES: &[&str] = &["MICOM", "SEPAM", "SEL", "EASERGY", "VAMP"];

const SIDE_WORDS: &[&str] = &["LADO", "SIDE"];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    AnsiCode,
    ModelPrefix,
    ModelSeries,
    ModelVariant,
    ModelSuffix,
    SequenceNumber,
    PlantReference,
    Revision,
    BusBar,
    Feeder,
    Side,
    Date,
    Atomic,
    Unknown,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnsiCode => "ansi_code",
            Self::ModelPrefix => "model_prefix",
            Self::ModelSeries => "model_series",
            Self::ModelVariant => "model_variant",
            Self::ModelSuffix => "model_suffix",
            Self::SequenceNumber => "sequence_number",
            Self::PlantReference => "plant_reference",
            Self::Revision => "revision",
            Self::BusBar => "bus_bar",
            Self::Feeder => "feeder",
            Self::Side => "side",
            Self::Date => "date",
            Self::Atomic => "atomic",
            Self::Unknown => "unknown",
        }
    }

    fn is_model(self) -> bool {
        matches!(self, Self::ModelPrefix | Self::ModelVariant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueToken {
    pub position: usize,
    pub text: String,
    pub token_type: TokenType,
    pub confidence: f64,
    /// Delimiter run that followed this token in the source value.
    pub delimiter: String,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizedField {
    /// Delimiters that preceded the first token.
    pub leading: String,
    pub tokens: Vec<ValueToken>,
    pub confidence: f64,
    pub is_atomic: bool,
}

impl TokenizedField {
    pub fn reconstruct(&self) -> String {
        let mut output = self.leading.clone();
        for token in &self.tokens {
            output.push_str(&token.text);
            output.push_str(&token.delimiter);
        }
        output
    }

    pub fn low_confidence_tokens(&self) -> impl Iterator<Item = &ValueToken> {
        self.tokens.iter().filter(|token| token.low_confidence)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    text: String,
    delimiter: String,
    compound: Option<TokenType>,
}

pub struct FieldTokenizer {
    model_prefix: Regex,
    date: Regex,
    revision: Regex,
    bus_bar: Regex,
    model_suffix: Regex,
}

impl FieldTokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            model_prefix: Regex::new(r"^(?i)[A-Z]{1,2}\d{3}$")
                .context("failed to compile model prefix regex")?,
            date: Regex::new(
                r"^(?:(?P<y1>\d{4})[-_/.](?P<m1>\d{2})[-_/.](?P<d1>\d{2})|(?P<d2>\d{2})[-_/.](?P<m2>\d{2})[-_/.](?P<y2>\d{4}))$",
            )
            .context("failed to compile date regex")?,
            revision: Regex::new(r"^(?i)(?:REV|R|V)\.?\d+[A-Z]?$")
                .context("failed to compile revision regex")?,
            bus_bar: Regex::new(r"^[A-Z]{2}$").context("failed to compile bus bar regex")?,
            model_suffix: Regex::new(r"^(?i)[A-Z]\d?$")
                .context("failed to compile model suffix regex")?,
        })
    }

    pub fn tokenize(&self, raw: &str) -> TokenizedField {
        let (leading, segments) = split_segments(raw);

        if segments.is_empty() {
            // Delimiter-only values such as "-" are a single opaque token.
            let tokens = if raw.is_empty() {
                Vec::new()
            } else {
                vec![ValueToken {
                    position: 0,
                    text: raw.to_string(),
                    token_type: TokenType::Atomic,
                    confidence: 1.0,
                    delimiter: String::new(),
                    low_confidence: false,
                }]
            };
            return TokenizedField {
                leading: String::new(),
                tokens,
                confidence: 1.0,
                is_atomic: true,
            };
        }

        if segments.len() == 1 {
            let segment = &segments[0];
            return TokenizedField {
                leading,
                tokens: vec![ValueToken {
                    position: 0,
                    text: segment.text.clone(),
                    token_type: TokenType::Atomic,
                    confidence: 1.0,
                    delimiter: segment.delimiter.clone(),
                    low_confidence: false,
                }],
                confidence: 1.0,
                is_atomic: true,
            };
        }

        let segments = self.merge_compounds(segments);
        let mut tokens = Vec::<ValueToken>::with_capacity(segments.len());
        for (position, segment) in segments.iter().enumerate() {
            let previous = tokens
                .last()
                .map(|token: &ValueToken| (token.token_type, token.delimiter.as_str()));
            let (token_type, confidence) = self.classify(segment, previous);
            tokens.push(ValueToken {
                position,
                text: segment.text.clone(),
                token_type,
                confidence,
                delimiter: segment.delimiter.clone(),
                low_confidence: confidence < LOW_CONFIDENCE_THRESHOLD,
            });
        }

        let confidence = length_weighted_confidence(&tokens);
        TokenizedField {
            leading,
            tokens,
            confidence,
            is_atomic: false,
        }
    }

    fn merge_compounds(&self, segments: Vec<Segment>) -> Vec<Segment> {
        let mut merged = Vec::<Segment>::with_capacity(segments.len());
        let mut index = 0usize;

        while index < segments.len() {
            if let Some(date) = self.try_merge_date(&segments[index..]) {
                merged.push(date);
                index += 3;
                continue;
            }
            if let Some(side) = try_merge_side(&segments[index..]) {
                merged.push(side);
                index += 2;
                continue;
            }
            merged.push(segments[index].clone());
            index += 1;
        }

        merged
    }

    fn try_merge_date(&self, window: &[Segment]) -> Option<Segment> {
        let [first, second, third, ..] = window else {
            return None;
        };
        if !matches!(first.delimiter.as_str(), "-" | "_") || first.delimiter != second.delimiter {
            return None;
        }

        let text = format!(
            "{}{}{}{}{}",
            first.text, first.delimiter, second.text, second.delimiter, third.text
        );
        if !self.is_date(&text) {
            return None;
        }

        Some(Segment {
            text,
            delimiter: third.delimiter.clone(),
            compound: Some(TokenType::Date),
        })
    }

    fn is_date(&self, text: &str) -> bool {
        let Some(captures) = self.date.captures(text) else {
            return false;
        };
        let month = captures
            .name("m1")
            .or_else(|| captures.name("m2"))
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(0);
        let day = captures
            .name("d1")
            .or_else(|| captures.name("d2"))
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(0);
        (1..=12).contains(&month) && (1..=31).contains(&day)
    }

    fn classify(&self, segment: &Segment, previous: Option<(TokenType, &str)>) -> (TokenType, f64) {
        let text = segment.text.as_str();
        let upper = text.to_ascii_uppercase();

        if ANSI_CODES.contains(&upper.as_str()) {
            return (TokenType::AnsiCode, ANSI_CONFIDENCE);
        }
        if self.model_prefix.is_match(text) {
            return (TokenType::ModelPrefix, MODEL_PREFIX_CONFIDENCE);
        }
        if segment.compound == Some(TokenType::Date) || self.is_date(text) {
            return (TokenType::Date, DATE_CONFIDENCE);
        }
        if segment.compound == Some(TokenType::Side) {
            return (TokenType::Side, SIDE_CONFIDENCE);
        }

        if let Some((previous_type, joiner)) = previous {
            if previous_type == TokenType::ModelPrefix && is_digits(text, 3) {
                return if joiner == "-" {
                    (TokenType::ModelVariant, POSITIONAL_CONFIDENCE)
                } else {
                    (TokenType::PlantReference, POSITIONAL_CONFIDENCE)
                };
            }
            if previous_type.is_model() && joiner == "-" && self.model_suffix.is_match(text) {
                return (TokenType::ModelSuffix, MODEL_SUFFIX_CONFIDENCE);
            }
        }

        if MODEL_SERIES.contains(&upper.as_str()) {
            return (TokenType::ModelSeries, MODEL_SERIES_CONFIDENCE);
        }
        if self.revision.is_match(text) {
            return (TokenType::Revision, REVISION_CONFIDENCE);
        }
        if self.bus_bar.is_match(text) {
            return (TokenType::BusBar, BUS_BAR_CONFIDENCE);
        }
        if is_digits(text, 2) {
            return (TokenType::Feeder, FEEDER_CONFIDENCE);
        }
        if !text.is_empty() && text.chars().all(|character| character.is_ascii_digit()) {
            return (TokenType::SequenceNumber, SEQUENCE_CONFIDENCE);
        }

        (TokenType::Unknown, UNKNOWN_CONFIDENCE)
    }
}

fn try_merge_side(window: &[Segment]) -> Option<Segment> {
    let [first, second, ..] = window else {
        return None;
    };
    if !SIDE_WORDS.contains(&first.text.to_ascii_uppercase().as_str()) {
        return None;
    }
    if !matches!(first.delimiter.as_str(), "_" | "-") {
        return None;
    }
    let mut chars = second.text.chars();
    let single_alnum = matches!(
        (chars.next(), chars.next()),
        (Some(character), None) if character.is_ascii_alphanumeric()
    );
    if !single_alnum {
        return None;
    }

    Some(Segment {
        text: format!("{}{}{}", first.text, first.delimiter, second.text),
        delimiter: second.delimiter.clone(),
        compound: Some(TokenType::Side),
    })
}

fn is_delimiter(character: char) -> bool {
    matches!(character, '_' | '-' | ':') || character.is_whitespace()
}

fn split_segments(raw: &str) -> (String, Vec<Segment>) {
    let mut leading = String::new();
    let mut segments = Vec::<Segment>::new();
    let mut current = String::new();
    let mut delimiter = String::new();

    for character in raw.chars() {
        if is_delimiter(character) {
            if current.is_empty() && segments.is_empty() {
                leading.push(character);
            } else {
                delimiter.push(character);
            }
            continue;
        }

        if !delimiter.is_empty() {
            segments.push(Segment {
                text: std::mem::take(&mut current),
                delimiter: std::mem::take(&mut delimiter),
                compound: None,
            });
        }
        current.push(character);
    }

    if !current.is_empty() {
        segments.push(Segment {
            text: current,
            delimiter,
            compound: None,
        });
    }

    (leading, segments)
}

fn is_digits(text: &str, width: usize) -> bool {
    text.len() == width && text.chars().all(|character| character.is_ascii_digit())
}

fn length_weighted_confidence(tokens: &[ValueToken]) -> f64 {
    let total_chars = tokens
        .iter()
        .map(|token| token.text.chars().count())
        .sum::<usize>();
    if total_chars == 0 {
        return 1.0;
    }

    let weighted = tokens
        .iter()
        .map(|token| token.text.chars().count() as f64 * token.confidence)
        .sum::<f64>();
    weighted / total_chars as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> FieldTokenizer {
        FieldTokenizer::new().expect("tokenizer regexes compile")
    }

    fn types_and_text(field: &TokenizedField) -> Vec<(TokenType, &str)> {
        field
            .tokens
            .iter()
            .map(|token| (token.token_type, token.text.as_str()))
            .collect()
    }

    #[test]
    fn composite_feeder_name_decomposes_into_typed_tokens() {
        let field = tokenizer().tokenize("P122_204-PN-06_LADO_A_2014-08-01");

        assert_eq!(
            types_and_text(&field),
            vec![
                (TokenType::ModelPrefix, "P122"),
                (TokenType::PlantReference, "204"),
                (TokenType::BusBar, "PN"),
                (TokenType::Feeder, "06"),
                (TokenType::Side, "LADO_A"),
                (TokenType::Date, "2014-08-01"),
            ]
        );
        assert!(field.confidence > 0.8, "confidence was {}", field.confidence);
        assert!(!field.is_atomic);
        assert_eq!(
            field.tokens.iter().map(|token| token.position).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn empty_value_is_atomic_with_no_tokens() {
        let field = tokenizer().tokenize("");
        assert!(field.tokens.is_empty());
        assert!(field.is_atomic);
        assert_eq!(field.confidence, 1.0);
    }

    #[test]
    fn delimiter_only_values_become_one_atomic_token() {
        let tokenizer = tokenizer();
        for raw in ["-", "--", ":", "   "] {
            let field = tokenizer.tokenize(raw);
            assert_eq!(field.tokens.len(), 1, "no token for {raw:?}");
            assert_eq!(field.tokens[0].text, raw);
            assert_eq!(field.tokens[0].token_type, TokenType::Atomic);
            assert_eq!(field.tokens[0].confidence, 1.0);
            assert!(field.leading.is_empty());
            assert!(field.is_atomic);
            assert_eq!(field.reconstruct(), raw);
        }
    }

    #[test]
    fn merged_compounds_are_not_atomic() {
        let tokenizer = tokenizer();
        let side = tokenizer.tokenize("LADO_A");
        assert_eq!(types_and_text(&side), vec![(TokenType::Side, "LADO_A")]);
        assert!(!side.is_atomic);

        let date = tokenizer.tokenize("2014-08-01");
        assert_eq!(types_and_text(&date), vec![(TokenType::Date, "2014-08-01")]);
        assert!(!date.is_atomic);
    }

    #[test]
    fn single_segment_is_one_atomic_token() {
        let field = tokenizer().tokenize("1.20In");
        assert_eq!(field.tokens.len(), 1);
        assert_eq!(field.tokens[0].token_type, TokenType::Atomic);
        assert_eq!(field.tokens[0].confidence, 1.0);
        assert!(field.is_atomic);
    }

    #[test]
    fn reconstruct_reproduces_every_input() {
        let tokenizer = tokenizer();
        let samples = [
            "",
            "   ",
            "P122_204-PN-06_LADO_A_2014-08-01",
            "  leading and trailing  ",
            "a--b__c::d",
            "MiCOM P220 - REV2",
            "50N:OFF",
            "27-06-2014",
            "tab\tseparated\tvalue",
            "LADO_",
            "_LADO_B_",
            "P122-205-A",
            "ñandú-ß_値",
            "2014_13_01",
        ];

        for sample in samples {
            let field = tokenizer.tokenize(sample);
            assert_eq!(field.reconstruct(), sample, "round trip failed for {sample:?}");
        }
    }

    #[test]
    fn variant_and_suffix_follow_the_model_prefix() {
        let field = tokenizer().tokenize("P122-205-A");
        assert_eq!(
            types_and_text(&field),
            vec![
                (TokenType::ModelPrefix, "P122"),
                (TokenType::ModelVariant, "205"),
                (TokenType::ModelSuffix, "A"),
            ]
        );
    }

    #[test]
    fn ansi_codes_take_priority_over_positional_rules() {
        let field = tokenizer().tokenize("50N_51_OFF");
        assert_eq!(field.tokens[0].token_type, TokenType::AnsiCode);
        assert_eq!(field.tokens[1].token_type, TokenType::AnsiCode);
        assert_eq!(field.tokens[2].token_type, TokenType::Unknown);
        assert!(field.tokens[2].low_confidence);
        assert_eq!(field.low_confidence_tokens().count(), 1);
    }

    #[test]
    fn day_first_dates_are_merged() {
        let field = tokenizer().tokenize("REV3 27-06-2014");
        assert_eq!(
            types_and_text(&field),
            vec![(TokenType::Revision, "REV3"), (TokenType::Date, "27-06-2014")]
        );
    }

    #[test]
    fn out_of_range_month_is_not_a_date() {
        let field = tokenizer().tokenize("2014_13_01");
        assert!(field
            .tokens
            .iter()
            .all(|token| token.token_type != TokenType::Date));
        assert_eq!(field.tokens.len(), 3);
    }

    #[test]
    fn unmatched_segments_fall_through_to_unknown() {
        let field = tokenizer().tokenize("foo bar");
        assert!(field
            .tokens
            .iter()
            .all(|token| token.token_type == TokenType::Unknown));
        assert!((field.confidence - UNKNOWN_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn model_series_names_are_recognized() {
        let field = tokenizer().tokenize("MiCOM P220 - REV2");
        assert_eq!(field.tokens[0].token_type, TokenType::ModelSeries);
        assert_eq!(field.tokens[1].token_type, TokenType::ModelPrefix);
        assert_eq!(field.tokens[1].delimiter, " - ");
        assert_eq!(field.tokens[2].token_type, TokenType::Revision);
    }
}
