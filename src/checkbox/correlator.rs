use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::page::points_to_pixels;

const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ToleranceMode {
    Fixed {
        points: f64,
    },
    /// Fraction of the page's median vertical spacing between consecutive
    /// anchors; falls back to `fallback_points` when a page has fewer than
    /// two anchors.
    AnchorSpacing {
        factor: f64,
        fallback_points: f64,
    },
}

impl Default for ToleranceMode {
    fn default() -> Self {
        Self::Fixed { points: 10.0 }
    }
}

/// Vertical position of a parameter code in raster pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorPosition {
    pub code_id: String,
    pub center_y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionPosition {
    pub region_id: String,
    pub center_y: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlation {
    /// region id → code id; a map so no region can hold two codes.
    pub assignments: BTreeMap<String, String>,
    pub unattributable: Vec<String>,
}

impl Correlation {
    pub fn code_for(&self, region_id: &str) -> Option<&str> {
        self.assignments.get(region_id).map(String::as_str)
    }
}

pub fn resolve_tolerance_px(mode: &ToleranceMode, anchors: &[AnchorPosition], dpi: f64) -> f64 {
    match mode {
        ToleranceMode::Fixed { points } => points_to_pixels(*points, dpi),
        ToleranceMode::AnchorSpacing {
            factor,
            fallback_points,
        } => match median_spacing(anchors) {
            Some(spacing) => spacing * factor,
            None => points_to_pixels(*fallback_points, dpi),
        },
    }
}

fn median_spacing(anchors: &[AnchorPosition]) -> Option<f64> {
    let mut positions = anchors
        .iter()
        .map(|anchor| anchor.center_y)
        .collect::<Vec<f64>>();
    positions.sort_by(f64::total_cmp);

    let mut gaps = positions
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|gap| *gap > TIE_EPSILON)
        .collect::<Vec<f64>>();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_by(f64::total_cmp);

    let middle = gaps.len() / 2;
    Some(if gaps.len() % 2 == 0 {
        (gaps[middle - 1] + gaps[middle]) / 2.0
    } else {
        gaps[middle]
    })
}

/// Greedy nearest-anchor assignment on vertical distance. Equidistant
/// anchors resolve to the one above the region; among anchors at the same
/// height the first in reading order wins.
pub fn correlate(
    regions: &[RegionPosition],
    anchors: &[AnchorPosition],
    tolerance_px: f64,
) -> Correlation {
    let mut correlation = Correlation::default();

    for region in regions {
        let mut best: Option<(&AnchorPosition, f64, bool)> = None;
        for anchor in anchors {
            let distance = (anchor.center_y - region.center_y).abs();
            if distance > tolerance_px {
                continue;
            }
            let above = anchor.center_y < region.center_y;

            let replace = match best {
                None => true,
                Some((_, best_distance, best_above)) => {
                    distance < best_distance - TIE_EPSILON
                        || ((distance - best_distance).abs() <= TIE_EPSILON && above && !best_above)
                }
            };
            if replace {
                best = Some((anchor, distance, above));
            }
        }

        match best {
            Some((anchor, _, _)) => {
                correlation
                    .assignments
                    .insert(region.region_id.clone(), anchor.code_id.clone());
            }
            None => correlation.unattributable.push(region.region_id.clone()),
        }
    }

    correlation
}
