use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkbox::{DetectorConfig, ToleranceMode};
use crate::format::Grammar;
use crate::util::read_json;

pub const DEFAULT_RASTER_DPI: f64 = 150.0;
pub const DEFAULT_INTERIOR_MARGIN_PT: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub raster_dpi: f64,
    pub detector: DetectorConfig,
    pub interior_margin_pt: f64,
    pub tolerance: ToleranceMode,
    /// grammar tag → template id, for families sharing one layout.
    pub template_aliases: BTreeMap<String, String>,
    pub templates: BTreeMap<String, TemplateOverride>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            raster_dpi: DEFAULT_RASTER_DPI,
            detector: DetectorConfig::default(),
            interior_margin_pt: DEFAULT_INTERIOR_MARGIN_PT,
            tolerance: ToleranceMode::default(),
            template_aliases: BTreeMap::new(),
            templates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateOverride {
    pub detector: Option<DetectorConfig>,
    pub interior_margin_pt: Option<f64>,
    pub tolerance: Option<ToleranceMode>,
}

/// Settings in effect for one document after applying template overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSettings {
    pub template_id: String,
    pub detector: DetectorConfig,
    pub interior_margin_pt: f64,
    pub tolerance: ToleranceMode,
}

impl ExtractionConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let config: Self = read_json(path)?;
        config.validate()?;

        info!(
            path = %path.display(),
            templates = config.templates.len(),
            aliases = config.template_aliases.len(),
            "loaded extraction config"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.raster_dpi.is_finite() && self.raster_dpi > 0.0) {
            bail!("raster_dpi must be positive, got {}", self.raster_dpi);
        }
        validate_detector("detector", &self.detector)?;
        validate_tolerance("tolerance", &self.tolerance)?;
        for grammar in self.template_aliases.keys() {
            if Grammar::parse(grammar).is_none() {
                bail!("template_aliases has unknown grammar tag {grammar:?}");
            }
        }
        for (template_id, template) in &self.templates {
            if let Some(detector) = &template.detector {
                validate_detector(&format!("templates.{template_id}.detector"), detector)?;
            }
            if let Some(tolerance) = &template.tolerance {
                validate_tolerance(&format!("templates.{template_id}.tolerance"), tolerance)?;
            }
        }
        Ok(())
    }

    pub fn template_id_for(&self, grammar: Grammar) -> String {
        self.template_aliases
            .get(grammar.as_str())
            .cloned()
            .unwrap_or_else(|| grammar.default_template_id().to_string())
    }

    pub fn resolve(&self, grammar: Grammar) -> TemplateSettings {
        self.settings_for_template(&self.template_id_for(grammar))
    }

    pub fn settings_for_template(&self, template_id: &str) -> TemplateSettings {
        let template = self.templates.get(template_id);

        TemplateSettings {
            detector: template
                .and_then(|value| value.detector.clone())
                .unwrap_or_else(|| self.detector.clone()),
            interior_margin_pt: template
                .and_then(|value| value.interior_margin_pt)
                .unwrap_or(self.interior_margin_pt),
            tolerance: template
                .and_then(|value| value.tolerance.clone())
                .unwrap_or_else(|| self.tolerance.clone()),
            template_id: template_id.to_string(),
        }
    }
}

fn validate_detector(label: &str, detector: &DetectorConfig) -> Result<()> {
    if detector.min_side_pt <= 0.0 || detector.max_side_pt < detector.min_side_pt {
        bail!(
            "{label}: side window [{}, {}] is empty",
            detector.min_side_pt,
            detector.max_side_pt
        );
    }
    if detector.max_aspect_ratio < 1.0 {
        bail!("{label}: max_aspect_ratio must be >= 1.0");
    }
    if detector.block_radius_pt <= detector.max_side_pt {
        bail!(
            "{label}: block_radius_pt ({}) must exceed max_side_pt ({})",
            detector.block_radius_pt,
            detector.max_side_pt
        );
    }
    Ok(())
}

fn validate_tolerance(label: &str, tolerance: &ToleranceMode) -> Result<()> {
    let positive = |value: f64| value.is_finite() && value > 0.0;
    match *tolerance {
        ToleranceMode::Fixed { points } if !positive(points) => {
            bail!("{label}: points must be positive, got {points}");
        }
        ToleranceMode::AnchorSpacing {
            factor,
            fallback_points,
        } if !positive(factor) || !positive(fallback_points) => {
            bail!(
                "{label}: factor ({factor}) and fallback_points ({fallback_points}) must be positive"
            );
        }
        _ => Ok(()),
    }
}
