use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::GrayImage;
use serde::Deserialize;
use tracing::{info, warn};

use crate::checkbox::{
    CalibrationRecord, CalibrationStore, LabeledSample, RegionDetector, SampleLabel, calibrate,
    interior_ink_density, interior_margin_px, mask_text_boxes, separation_violations,
};
use crate::cli::CalibrateArgs;
use crate::commands::extract::CALIBRATION_FILENAME;
use crate::config::{ExtractionConfig, TemplateSettings};
use crate::page::PixelRect;
use crate::util::read_json;

/// Labelled regions for one template family, as produced by the labelling UI.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleManifest {
    pub template_id: String,
    /// Default DPI for samples that reference page images.
    #[serde(default)]
    pub dpi: Option<f64>,
    /// Text boxes per page image, masked before binarizing as extraction does.
    #[serde(default)]
    pub text_boxes: BTreeMap<PathBuf, Vec<PixelRect>>,
    pub samples: Vec<SampleEntry>,
}

/// Either a precomputed density or a region on a page image to measure.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleEntry {
    pub label: SampleLabel,
    #[serde(default)]
    pub density: Option<f64>,
    /// Relative to the manifest's directory.
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub region: Option<PixelRect>,
    #[serde(default)]
    pub dpi: Option<f64>,
}

pub fn run(args: CalibrateArgs) -> Result<()> {
    let calibration_path = args
        .calibration_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join(CALIBRATION_FILENAME));
    let manifest: SampleManifest = read_json(&args.samples_path)?;
    let config = ExtractionConfig::load(args.config_path.as_deref())?;
    let base_dir = args
        .samples_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    info!(
        template_id = %manifest.template_id,
        samples = manifest.samples.len(),
        "calibrating"
    );

    let (record, samples) = calibrate_manifest(&manifest, &base_dir, &config)?;
    let violations = separation_violations(&samples);

    if record.is_valid() {
        info!(
            template_id = %record.template_id,
            threshold = record.threshold,
            noise_floor = record.noise_floor,
            separation_margin = record.separation_margin,
            "calibration is valid"
        );
    } else {
        warn!(
            template_id = %record.template_id,
            separation_margin = record.separation_margin,
            overlapping_pairs = violations.len(),
            "checked and unchecked samples overlap; record will be stored as invalid"
        );
        for (unchecked, checked) in violations.iter().take(10) {
            warn!(
                unchecked_sample = unchecked,
                unchecked_density = samples[*unchecked].density,
                checked_sample = checked,
                checked_density = samples[*checked].density,
                "overlapping samples"
            );
        }
    }

    if args.dry_run {
        info!("calibration dry-run complete; store untouched");
    } else {
        let mut store = CalibrationStore::load(&calibration_path)?;
        if let Some(previous) = store.insert(record.clone()) {
            info!(
                previous_threshold = previous.threshold,
                previous_generated_at = %previous.generated_at.unwrap_or_default(),
                "replacing existing calibration"
            );
        }
        store.save(&calibration_path)?;
        info!(path = %calibration_path.display(), "wrote calibration store");
    }

    if !record.is_valid() {
        bail!(
            "calibration for {} is invalid (separation margin {:.4}, {} overlapping pairs)",
            record.template_id,
            record.separation_margin,
            violations.len()
        );
    }

    Ok(())
}

pub fn calibrate_manifest(
    manifest: &SampleManifest,
    base_dir: &Path,
    config: &ExtractionConfig,
) -> Result<(CalibrationRecord, Vec<LabeledSample>)> {
    let settings = config.settings_for_template(&manifest.template_id);
    let mut measurer = DensityMeasurer::new(&settings, base_dir, &manifest.text_boxes);
    let default_dpi = manifest.dpi.unwrap_or(config.raster_dpi);

    let mut samples = Vec::with_capacity(manifest.samples.len());
    for (index, sample) in manifest.samples.iter().enumerate() {
        let density = measurer
            .measure(sample, default_dpi)
            .with_context(|| format!("failed to measure sample {index}"))?;
        samples.push(LabeledSample {
            density,
            label: sample.label,
        });
    }

    let record = calibrate(&manifest.template_id, samples.iter().copied());
    Ok((record, samples))
}

struct DensityMeasurer<'a> {
    detector: RegionDetector,
    interior_margin_pt: f64,
    base_dir: &'a Path,
    text_boxes: &'a BTreeMap<PathBuf, Vec<PixelRect>>,
    /// Binarized page images keyed by path and DPI bits.
    binarized: BTreeMap<(PathBuf, u64), GrayImage>,
}

impl<'a> DensityMeasurer<'a> {
    fn new(
        settings: &TemplateSettings,
        base_dir: &'a Path,
        text_boxes: &'a BTreeMap<PathBuf, Vec<PixelRect>>,
    ) -> Self {
        Self {
            detector: RegionDetector::new(settings.detector.clone()),
            interior_margin_pt: settings.interior_margin_pt,
            base_dir,
            text_boxes,
            binarized: BTreeMap::new(),
        }
    }

    fn measure(&mut self, sample: &SampleEntry, default_dpi: f64) -> Result<f64> {
        if let Some(density) = sample.density {
            if !(0.0..=1.0).contains(&density) {
                bail!("density {density} is outside [0, 1]");
            }
            return Ok(density);
        }

        let (Some(image_path), Some(region)) = (&sample.image, &sample.region) else {
            bail!("sample needs either a density or an image with a region");
        };
        let dpi = sample.dpi.unwrap_or(default_dpi);
        if !(dpi.is_finite() && dpi > 0.0) {
            bail!("sample dpi must be positive, got {dpi}");
        }

        let path = self.base_dir.join(image_path);
        let key = (path.clone(), dpi.to_bits());
        if !self.binarized.contains_key(&key) {
            let page = image::open(&path)
                .with_context(|| format!("failed to open page image {}", path.display()))?
                .to_luma8();
            let text_boxes = self
                .text_boxes
                .get(image_path)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let binary = self
                .detector
                .binarize(&mask_text_boxes(&page, text_boxes), dpi);
            self.binarized.insert(key.clone(), binary);
        }
        let binary = self
            .binarized
            .get(&key)
            .context("binarized page missing from cache")?;

        let (width, height) = binary.dimensions();
        if !region.fits_within(width, height) {
            bail!(
                "region {:?} lies outside {} ({}x{})",
                region,
                path.display(),
                width,
                height
            );
        }

        let margin = interior_margin_px(self.interior_margin_pt, dpi);
        Ok(interior_ink_density(binary, region, margin))
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
    use imageproc::rect::Rect;

    use super::*;

    fn entry(label: SampleLabel, density: f64) -> SampleEntry {
        SampleEntry {
            label,
            density: Some(density),
            image: None,
            region: None,
            dpi: None,
        }
    }

    #[test]
    fn precomputed_densities_calibrate_directly() {
        let manifest = SampleManifest {
            template_id: "micom_p122".to_string(),
            dpi: None,
            text_boxes: BTreeMap::new(),
            samples: vec![
                entry(SampleLabel::Unchecked, 0.04),
                entry(SampleLabel::Unchecked, 0.10),
                entry(SampleLabel::Checked, 0.50),
                entry(SampleLabel::Checked, 0.62),
                entry(SampleLabel::Noise, 0.00),
            ],
        };

        let (record, samples) =
            calibrate_manifest(&manifest, Path::new("."), &ExtractionConfig::default())
                .expect("calibration runs");
        assert!(record.is_valid());
        assert_eq!(record.sample_count, 5);
        assert!((record.threshold - 0.30).abs() < 1e-9);
        assert!((record.separation_margin - 0.40).abs() < 1e-9);
        assert!((record.noise_floor - 0.02).abs() < 1e-9);
        assert!(separation_violations(&samples).is_empty());
    }

    #[test]
    fn out_of_range_density_is_rejected() {
        let manifest = SampleManifest {
            template_id: "micom_p122".to_string(),
            dpi: None,
            text_boxes: BTreeMap::new(),
            samples: vec![entry(SampleLabel::Checked, 1.5)],
        };
        let error = calibrate_manifest(&manifest, Path::new("."), &ExtractionConfig::default())
            .expect_err("density above one fails");
        assert!(format!("{error:#}").contains("outside [0, 1]"));
    }

    #[test]
    fn regions_on_page_images_are_measured_like_the_detector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut page = GrayImage::from_pixel(200, 100, Luma([255]));
        for (x, checked) in [(20, true), (60, false), (100, true), (140, false)] {
            draw_hollow_rect_mut(&mut page, Rect::at(x, 40).of_size(12, 12), Luma([0]));
            if checked {
                draw_filled_rect_mut(&mut page, Rect::at(x + 3, 43).of_size(6, 6), Luma([0]));
            }
        }
        page.save(dir.path().join("page1.png")).expect("png saves");

        let region = |x: u32, label: SampleLabel| SampleEntry {
            label,
            density: None,
            image: Some(PathBuf::from("page1.png")),
            region: Some(PixelRect {
                x,
                y: 40,
                width: 12,
                height: 12,
            }),
            dpi: None,
        };
        let manifest = SampleManifest {
            template_id: "micom_p122".to_string(),
            dpi: Some(72.0),
            text_boxes: BTreeMap::new(),
            samples: vec![
                region(20, SampleLabel::Checked),
                region(60, SampleLabel::Unchecked),
                region(100, SampleLabel::Checked),
                region(140, SampleLabel::Unchecked),
            ],
        };

        let (record, samples) =
            calibrate_manifest(&manifest, dir.path(), &ExtractionConfig::default())
                .expect("calibration runs");
        assert!((samples[0].density - 36.0 / 64.0).abs() < 1e-9);
        assert_eq!(samples[1].density, 0.0);
        assert!(record.is_valid());
        assert!((record.threshold - 36.0 / 128.0).abs() < 1e-9);
        assert_eq!(record.noise_floor, 0.0);
    }

    #[test]
    fn sample_without_density_or_region_is_an_error() {
        let manifest = SampleManifest {
            template_id: "micom_p122".to_string(),
            dpi: None,
            text_boxes: BTreeMap::new(),
            samples: vec![SampleEntry {
                label: SampleLabel::Checked,
                density: None,
                image: Some(PathBuf::from("page1.png")),
                region: None,
                dpi: None,
            }],
        };
        let error = calibrate_manifest(&manifest, Path::new("."), &ExtractionConfig::default())
            .expect_err("incomplete sample fails");
        assert!(format!("{error:#}").contains("needs either a density"));
    }

    #[test]
    fn text_boxes_are_masked_like_extraction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut page = GrayImage::from_pixel(200, 100, Luma([255]));
        draw_filled_rect_mut(&mut page, Rect::at(34, 38).of_size(40, 16), Luma([0]));
        draw_hollow_rect_mut(&mut page, Rect::at(20, 40).of_size(12, 12), Luma([0]));
        draw_filled_rect_mut(&mut page, Rect::at(23, 43).of_size(6, 6), Luma([0]));
        page.save(dir.path().join("page1.png")).expect("png saves");

        let text_box = PixelRect {
            x: 34,
            y: 38,
            width: 40,
            height: 16,
        };
        let region = PixelRect {
            x: 20,
            y: 40,
            width: 12,
            height: 12,
        };
        let manifest = SampleManifest {
            template_id: "micom_p122".to_string(),
            dpi: Some(72.0),
            text_boxes: BTreeMap::from([(PathBuf::from("page1.png"), vec![text_box])]),
            samples: vec![SampleEntry {
                label: SampleLabel::Checked,
                density: None,
                image: Some(PathBuf::from("page1.png")),
                region: Some(region),
                dpi: None,
            }],
        };

        let config = ExtractionConfig::default();
        let (_, samples) =
            calibrate_manifest(&manifest, dir.path(), &config).expect("calibration runs");

        let settings = config.settings_for_template("micom_p122");
        let detected = RegionDetector::new(settings.detector.clone())
            .detect(1, &page, 72.0, &[text_box]);
        let margin = interior_margin_px(settings.interior_margin_pt, 72.0);
        let runtime = interior_ink_density(&detected.binary, &region, margin);
        assert_eq!(samples[0].density, runtime);
    }

    #[test]
    fn overflowing_region_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        GrayImage::from_pixel(64, 64, Luma([255]))
            .save(dir.path().join("page1.png"))
            .expect("png saves");

        let manifest = SampleManifest {
            template_id: "micom_p122".to_string(),
            dpi: Some(72.0),
            text_boxes: BTreeMap::new(),
            samples: vec![SampleEntry {
                label: SampleLabel::Checked,
                density: None,
                image: Some(PathBuf::from("page1.png")),
                region: Some(PixelRect {
                    x: u32::MAX - 2,
                    y: 10,
                    width: 12,
                    height: 12,
                }),
                dpi: None,
            }],
        };
        let error = calibrate_manifest(&manifest, dir.path(), &ExtractionConfig::default())
            .expect_err("region past the page fails");
        assert!(format!("{error:#}").contains("lies outside"));
    }
}
