use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::util::{now_utc_string, read_json, write_json_pretty};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleLabel {
    Checked,
    Unchecked,
    Noise,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub density: f64,
    pub label: SampleLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub template_id: String,
    pub threshold: f64,
    pub noise_floor: f64,
    pub sample_count: usize,
    pub separation_margin: f64,
    #[serde(default)]
    pub generated_at: Option<String>,
}

impl CalibrationRecord {
    pub fn is_valid(&self) -> bool {
        self.separation_margin > 0.0
            && self.threshold.is_finite()
            && self.noise_floor.is_finite()
            && self.noise_floor <= self.threshold
    }
}

/// Accumulates labelled densities for one template family. The UI loop that
/// produces the labels lives elsewhere; this only holds the math.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSession {
    template_id: String,
    checked: Vec<f64>,
    unchecked: Vec<f64>,
    noise: Vec<f64>,
}

impl CalibrationSession {
    pub fn new(template_id: &str) -> Self {
        Self {
            template_id: template_id.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, sample: LabeledSample) {
        let bucket = match sample.label {
            SampleLabel::Checked => &mut self.checked,
            SampleLabel::Unchecked => &mut self.unchecked,
            SampleLabel::Noise => &mut self.noise,
        };
        bucket.push(sample.density.clamp(0.0, 1.0));
    }

    pub fn sample_count(&self) -> usize {
        self.checked.len() + self.unchecked.len() + self.noise.len()
    }

    pub fn finish(&self) -> CalibrationRecord {
        let sample_count = self.sample_count();
        let (Some(min_checked), Some(max_unchecked), Some(min_unchecked)) = (
            min_of(&self.checked),
            max_of(&self.unchecked),
            min_of(&self.unchecked),
        ) else {
            // Without both classes there is no margin to measure.
            return CalibrationRecord {
                template_id: self.template_id.clone(),
                threshold: 0.0,
                noise_floor: 0.0,
                sample_count,
                separation_margin: 0.0,
                generated_at: Some(now_utc_string()),
            };
        };

        let noise_floor = match max_of(&self.noise) {
            Some(max_noise) if max_noise < min_unchecked => (max_noise + min_unchecked) / 2.0,
            _ => min_unchecked / 2.0,
        };

        CalibrationRecord {
            template_id: self.template_id.clone(),
            threshold: (max_unchecked + min_checked) / 2.0,
            noise_floor,
            sample_count,
            separation_margin: min_checked - max_unchecked,
            generated_at: Some(now_utc_string()),
        }
    }
}

pub fn calibrate<I>(template_id: &str, samples: I) -> CalibrationRecord
where
    I: IntoIterator<Item = LabeledSample>,
{
    let mut session = CalibrationSession::new(template_id);
    for sample in samples {
        session.record(sample);
    }
    session.finish()
}

/// Pairs of (densest unchecked, sparsest checked) sample indices whose
/// ranges overlap; empty when the set is separable.
pub fn separation_violations(samples: &[LabeledSample]) -> Vec<(usize, usize)> {
    let mut violations = Vec::new();
    for (unchecked_index, unchecked) in samples.iter().enumerate() {
        if unchecked.label != SampleLabel::Unchecked {
            continue;
        }
        for (checked_index, checked) in samples.iter().enumerate() {
            if checked.label == SampleLabel::Checked && checked.density <= unchecked.density {
                violations.push((unchecked_index, checked_index));
            }
        }
    }
    violations
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationStore {
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    #[serde(default)]
    pub records: BTreeMap<String, CalibrationRecord>,
}

fn default_manifest_version() -> u32 {
    1
}

impl CalibrationStore {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                manifest_version: default_manifest_version(),
                records: BTreeMap::new(),
            });
        }

        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_pretty(path, self)
    }

    pub fn get(&self, template_id: &str) -> Option<&CalibrationRecord> {
        self.records.get(template_id)
    }

    pub fn insert(&mut self, record: CalibrationRecord) -> Option<CalibrationRecord> {
        self.records.insert(record.template_id.clone(), record)
    }
}
