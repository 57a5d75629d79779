use anyhow::{Context, Result};
use regex::Regex;

use crate::format::Grammar;

/// One parameter assignment recognized on a text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLine {
    pub code: String,
    pub description: String,
    pub raw_value: String,
    /// Byte offset of the code inside the line, used to find its anchor word.
    pub code_offset: usize,
}

enum LineShape {
    /// `CODE  description : value`, value optional (checkbox rows).
    Described(Regex),
    /// `CODE := value`, several per line in separate columns.
    Assignments(Regex),
}

pub struct LineGrammar {
    grammar: Grammar,
    shape: LineShape,
    column_split: Regex,
}

impl LineGrammar {
    pub fn for_grammar(grammar: Grammar) -> Result<Self> {
        let shape = match grammar {
            Grammar::MicomP122x205 | Grammar::MicomP122 | Grammar::MicomP220 => {
                LineShape::Described(
                    Regex::new(
                        r"^\s*(?P<code>[0-9A-F]{2}\.[0-9A-F]{2}(?:\.[0-9A-F]{2})?)\s+(?P<description>\S.*?)(?:\s*[:=]\s*(?P<value>.*?))?\s*$",
                    )
                    .context("failed to compile MiCOM line regex")?,
                )
            }
            Grammar::SepamS40 => LineShape::Described(
                Regex::new(
                    r"^\s*(?P<code>[A-Z]{2,4}\d{2,3}[A-Z]?)\s+(?P<description>\S.*?)(?:\s*[:=]\s*(?P<value>.*?))?\s*$",
                )
                .context("failed to compile Sepam line regex")?,
            ),
            Grammar::SelSettings => LineShape::Assignments(
                Regex::new(r"^(?P<code>[A-Z0-9][A-Z0-9_]*)\s*:=\s*(?P<value>.*?)\s*$")
                    .context("failed to compile SEL assignment regex")?,
            ),
        };

        Ok(Self {
            grammar,
            shape,
            column_split: Regex::new(r"\t+|\s{2,}").context("failed to compile column regex")?,
        })
    }

    pub fn grammar(&self) -> Grammar {
        self.grammar
    }

    pub fn parse_line(&self, text: &str) -> Vec<CodeLine> {
        match &self.shape {
            LineShape::Described(regex) => regex
                .captures(text)
                .and_then(|captures| {
                    let code = captures.name("code")?;
                    let description = captures
                        .name("description")
                        .map(|value| value.as_str().trim())
                        .unwrap_or_default();
                    Some(CodeLine {
                        code: code.as_str().to_string(),
                        description: description.to_string(),
                        raw_value: captures
                            .name("value")
                            .map(|value| value.as_str().to_string())
                            .unwrap_or_default(),
                        code_offset: code.start(),
                    })
                })
                .into_iter()
                .collect(),
            LineShape::Assignments(regex) => self
                .columns(text)
                .into_iter()
                .filter_map(|(offset, column)| {
                    let captures = regex.captures(column)?;
                    let code = captures.name("code")?;
                    Some(CodeLine {
                        code: code.as_str().to_string(),
                        description: String::new(),
                        raw_value: captures
                            .name("value")
                            .map(|value| value.as_str().to_string())
                            .unwrap_or_default(),
                        code_offset: offset + code.start(),
                    })
                })
                .collect(),
        }
    }

    fn columns<'a>(&self, text: &'a str) -> Vec<(usize, &'a str)> {
        let mut columns = Vec::new();
        let mut start = 0usize;
        for separator in self.column_split.find_iter(text) {
            if separator.start() > start {
                columns.push((start, &text[start..separator.start()]));
            }
            start = separator.end();
        }
        if start < text.len() {
            columns.push((start, &text[start..]));
        }

        // A lone `:=` column means the splitter cut an assignment apart.
        let mut merged = Vec::<(usize, &'a str)>::with_capacity(columns.len());
        for (offset, column) in columns {
            match merged.last_mut() {
                Some((previous_offset, previous))
                    if column.starts_with(":=") || previous.trim_end().ends_with(":=") =>
                {
                    let end = offset + column.len();
                    *previous = &text[*previous_offset..end];
                }
                _ => merged.push((offset, column)),
            }
        }
        merged
    }
}
