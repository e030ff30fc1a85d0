use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use geoscan_core::{Position, SiteFeatures, Zoning};

/// What disagreed with what.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Terrain too steep for the zoned use.
    Slope,
    /// Restrictive zoning on land that looks developable.
    Zoning,
    /// Model prediction far from the rule-based score.
    Utility,
    /// Low-lying terrain with a low official flood rating.
    Flood,
}

impl MismatchKind {
    pub const ALL: [MismatchKind; 4] = [
        MismatchKind::Slope,
        MismatchKind::Zoning,
        MismatchKind::Utility,
        MismatchKind::Flood,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchKind::Slope => "slope",
            MismatchKind::Zoning => "zoning",
            MismatchKind::Utility => "utility",
            MismatchKind::Flood => "flood",
        }
    }
}

/// A flagged discrepancy at one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub position: Position,
    pub kind: MismatchKind,
    /// In \[0, 1\].
    pub severity: f64,
    pub description: String,
    /// The measured value (slope %, elevation ft, model score...).
    pub observed: f64,
    /// The value it was compared against (threshold, rule score...).
    pub reference: f64,
}

/// Compact form carried by scan events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MismatchSummary {
    pub kinds: Vec<MismatchKind>,
    pub count: usize,
    pub max_severity: f64,
}

impl MismatchSummary {
    pub fn from_mismatches(mismatches: &[Mismatch]) -> Self {
        let mut kinds: Vec<MismatchKind> = mismatches.iter().map(|m| m.kind).collect();
        kinds.sort();
        kinds.dedup();
        Self {
            kinds,
            count: mismatches.len(),
            max_severity: mismatches.iter().map(|m| m.severity).fold(0.0, f64::max),
        }
    }

    pub fn contains(&self, kind: MismatchKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MismatchError {
    #[error("{check}: invalid input: {reason}")]
    InvalidInput { check: &'static str, reason: String },
}

/// Everything a check may look at for one position.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub position: Position,
    pub features: &'a SiteFeatures,
    /// Ground-truth score from the rule engine.
    pub rule_score: f64,
    /// Model score, when one was made.
    pub predicted_score: Option<f64>,
}

/// Check thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MismatchThresholds {
    /// Industrial/commercial slope limit (%).
    pub industrial_slope: f64,
    /// Slope excess over which industrial severity reaches 1.0.
    pub industrial_slope_span: f64,
    /// Residential slope limit (%).
    pub residential_slope: f64,
    pub residential_slope_span: f64,
    /// Agricultural land flatter than this is an opportunity candidate.
    pub opportunity_max_slope: f64,
    /// Both utility lines must be closer than this (ft).
    pub opportunity_utility_distance_ft: f64,
    pub opportunity_severity: f64,
    /// Model-vs-rule gap that counts as a mismatch.
    pub utility_gap: f64,
    /// Gap at which utility severity reaches 1.0.
    pub utility_gap_span: f64,
    /// Elevation below which a site is low-lying (ft).
    pub flood_elevation_ft: f64,
    /// Official ratings below this are "low".
    pub flood_low_rating: f64,
    pub flood_severity: f64,
}

impl Default for MismatchThresholds {
    fn default() -> Self {
        Self {
            industrial_slope: 25.0,
            industrial_slope_span: 20.0,
            residential_slope: 30.0,
            residential_slope_span: 15.0,
            opportunity_max_slope: 15.0,
            opportunity_utility_distance_ft: 500.0,
            opportunity_severity: 0.7,
            utility_gap: 2.5,
            utility_gap_span: 5.0,
            flood_elevation_ft: 30.0,
            flood_low_rating: 4.0,
            flood_severity: 0.6,
        }
    }
}

type Check = fn(&MismatchDetector, &Sample<'_>) -> Result<Option<Mismatch>, MismatchError>;

/// Stateless rule evaluator. Cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct MismatchDetector {
    thresholds: MismatchThresholds,
}

fn finite(check: &'static str, name: &str, v: Option<f64>) -> Result<Option<f64>, MismatchError> {
    match v {
        Some(x) if !x.is_finite() => Err(MismatchError::InvalidInput {
            check,
            reason: format!("{name} is not finite ({x})"),
        }),
        other => Ok(other),
    }
}

fn severity(excess: f64, span: f64) -> f64 {
    if span <= 0.0 {
        return 1.0;
    }
    (excess / span).clamp(0.0, 1.0)
}

impl MismatchDetector {
    pub fn new(thresholds: MismatchThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &MismatchThresholds {
        &self.thresholds
    }

    /// Steep terrain zoned for uses that need flat land.
    pub fn check_slope(&self, s: &Sample<'_>) -> Result<Option<Mismatch>, MismatchError> {
        let Some(slope) = finite("slope", "slope_percent", s.features.slope_percent)? else {
            return Ok(None);
        };
        let t = &self.thresholds;
        let zoning = s.features.zoning();

        let (limit, span, label) = match zoning {
            Zoning::Industrial | Zoning::Commercial => {
                (t.industrial_slope, t.industrial_slope_span, zoning.as_str())
            }
            Zoning::Residential => (t.residential_slope, t.residential_slope_span, "residential"),
            _ => return Ok(None),
        };
        if slope <= limit {
            return Ok(None);
        }

        Ok(Some(Mismatch {
            position: s.position,
            kind: MismatchKind::Slope,
            severity: severity(slope - limit, span),
            description: format!("{label} zoning on {slope:.1}% slope (limit {limit:.0}%)"),
            observed: slope,
            reference: limit,
        }))
    }

    /// Flat, serviced agricultural land: a rezoning opportunity.
    pub fn check_zoning_opportunity(&self, s: &Sample<'_>) -> Result<Option<Mismatch>, MismatchError> {
        const CHECK: &str = "zoning";
        let t = &self.thresholds;
        if s.features.zoning() != Zoning::Agricultural {
            return Ok(None);
        }
        let slope = finite(CHECK, "slope_percent", s.features.slope_percent)?;
        let water = finite(CHECK, "water_main_distance_ft", s.features.water_main_distance_ft)?;
        let sewer = finite(CHECK, "sewer_distance_ft", s.features.sewer_distance_ft)?;
        let (Some(slope), Some(water), Some(sewer)) = (slope, water, sewer) else {
            return Ok(None);
        };

        let near = t.opportunity_utility_distance_ft;
        if slope >= t.opportunity_max_slope || water >= near || sewer >= near {
            return Ok(None);
        }

        Ok(Some(Mismatch {
            position: s.position,
            kind: MismatchKind::Zoning,
            severity: t.opportunity_severity.clamp(0.0, 1.0),
            description: format!(
                "agricultural zoning on {slope:.1}% slope with water {water:.0} ft / sewer {sewer:.0} ft"
            ),
            observed: slope,
            reference: t.opportunity_max_slope,
        }))
    }

    /// Model and rules disagree by more than the allowed gap.
    pub fn check_utility(&self, s: &Sample<'_>) -> Result<Option<Mismatch>, MismatchError> {
        let Some(predicted) = finite("utility", "predicted_score", s.predicted_score)? else {
            return Ok(None);
        };
        let Some(rule) = finite("utility", "rule_score", Some(s.rule_score))? else {
            return Ok(None);
        };
        let t = &self.thresholds;
        let gap = (predicted - rule).abs();
        if gap <= t.utility_gap {
            return Ok(None);
        }

        Ok(Some(Mismatch {
            position: s.position,
            kind: MismatchKind::Utility,
            severity: severity(gap, t.utility_gap_span),
            description: format!("model scored {predicted:.2}, rules scored {rule:.2}"),
            observed: predicted,
            reference: rule,
        }))
    }

    /// Low-lying ground the official rating calls safe.
    pub fn check_flood(&self, s: &Sample<'_>) -> Result<Option<Mismatch>, MismatchError> {
        let elevation = finite("flood", "elevation_ft", s.features.elevation_ft)?;
        let rating = finite("flood", "flood_risk_score", s.features.flood_risk_score)?;
        let (Some(elevation), Some(rating)) = (elevation, rating) else {
            return Ok(None);
        };
        let t = &self.thresholds;
        if elevation >= t.flood_elevation_ft || rating >= t.flood_low_rating {
            return Ok(None);
        }

        Ok(Some(Mismatch {
            position: s.position,
            kind: MismatchKind::Flood,
            severity: t.flood_severity.clamp(0.0, 1.0),
            description: format!(
                "elevation {elevation:.0} ft but official flood rating only {rating:.0}"
            ),
            observed: elevation,
            reference: rating,
        }))
    }

    /// Run every check. A failing check is logged and skipped.
    pub fn scan(&self, sample: &Sample<'_>) -> Vec<Mismatch> {
        const CHECKS: [(&str, Check); 4] = [
            ("slope", MismatchDetector::check_slope),
            ("zoning", MismatchDetector::check_zoning_opportunity),
            ("utility", MismatchDetector::check_utility),
            ("flood", MismatchDetector::check_flood),
        ];

        let mut found = Vec::new();
        for (name, check) in CHECKS {
            match check(self, sample) {
                Ok(Some(m)) => found.push(m),
                Ok(None) => {}
                Err(e) => debug!(check = name, position = %sample.position, error = %e, "mismatch check skipped"),
            }
        }
        found
    }

    /// Scan many samples, keep those at or above `min_severity`, most severe
    /// first.
    pub fn scan_region(&self, samples: &[Sample<'_>], min_severity: f64) -> Vec<Mismatch> {
        let mut all: Vec<Mismatch> = samples
            .iter()
            .flat_map(|s| self.scan(s))
            .filter(|m| m.severity >= min_severity)
            .collect();
        all.sort_by(|a, b| b.severity.total_cmp(&a.severity));
        all
    }
}

/// Plain-text report grouped by kind, top five per kind.
pub fn render_report(mismatches: &[Mismatch]) -> String {
    let mut out = String::new();
    if mismatches.is_empty() {
        out.push_str("No mismatches found.\n");
        return out;
    }

    let mut by_kind: BTreeMap<MismatchKind, Vec<&Mismatch>> = BTreeMap::new();
    for m in mismatches {
        by_kind.entry(m.kind).or_default().push(m);
    }

    let _ = writeln!(out, "Mismatch report: {} finding(s)", mismatches.len());
    for (kind, mut items) in by_kind {
        items.sort_by(|a, b| b.severity.total_cmp(&a.severity));
        let _ = writeln!(out, "\n[{}] {} finding(s)", kind.as_str(), items.len());
        for m in items.iter().take(5) {
            let _ = writeln!(
                out,
                "  {:.2}  {}  {}",
                m.severity, m.position, m.description
            );
        }
        if items.len() > 5 {
            let _ = writeln!(out, "  ... and {} more", items.len() - 5);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at() -> Position {
        Position::new(26.6, -81.9)
    }

    fn sample(features: &SiteFeatures, rule: f64, predicted: Option<f64>) -> Sample<'_> {
        Sample {
            position: at(),
            features,
            rule_score: rule,
            predicted_score: predicted,
        }
    }

    #[test]
    fn steep_industrial_is_one_slope_mismatch() {
        let f = SiteFeatures {
            zoning_code: Some("M-1".to_string()),
            slope_percent: Some(30.0),
            ..Default::default()
        };
        let found = MismatchDetector::default().scan(&sample(&f, 5.0, Some(5.0)));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, MismatchKind::Slope);
        assert!(found[0].severity > 0.0 && found[0].severity <= 1.0);
        assert!((found[0].severity - 0.25).abs() < 1e-12);
    }

    #[test]
    fn flat_residential_is_clean() {
        let f = SiteFeatures {
            zoning_code: Some("R-1".to_string()),
            slope_percent: Some(3.0),
            elevation_ft: Some(120.0),
            flood_risk_score: Some(1.0),
            water_main_distance_ft: Some(100.0),
            sewer_distance_ft: Some(100.0),
            ..Default::default()
        };
        assert!(MismatchDetector::default().scan(&sample(&f, 6.0, Some(6.5))).is_empty());
    }

    #[test]
    fn residential_uses_its_own_limit() {
        let d = MismatchDetector::default();
        let mut f = SiteFeatures {
            zoning_code: Some("R-2".to_string()),
            slope_percent: Some(28.0),
            ..Default::default()
        };
        assert!(d.check_slope(&sample(&f, 5.0, None)).unwrap().is_none());
        f.slope_percent = Some(60.0);
        let m = d.check_slope(&sample(&f, 5.0, None)).unwrap().unwrap();
        assert_eq!(m.severity, 1.0);
    }

    #[test]
    fn zoning_opportunity_needs_both_utilities() {
        let d = MismatchDetector::default();
        let mut f = SiteFeatures {
            zoning_code: Some("A-1".to_string()),
            slope_percent: Some(5.0),
            water_main_distance_ft: Some(200.0),
            sewer_distance_ft: Some(300.0),
            ..Default::default()
        };
        let m = d.check_zoning_opportunity(&sample(&f, 5.0, None)).unwrap().unwrap();
        assert_eq!(m.kind, MismatchKind::Zoning);
        assert_eq!(m.severity, 0.7);

        f.sewer_distance_ft = Some(900.0);
        assert!(d.check_zoning_opportunity(&sample(&f, 5.0, None)).unwrap().is_none());
    }

    #[test]
    fn utility_gap_scales_and_needs_prediction() {
        let d = MismatchDetector::default();
        let f = SiteFeatures::default();
        assert!(d.check_utility(&sample(&f, 9.0, None)).unwrap().is_none());
        assert!(d.check_utility(&sample(&f, 5.0, Some(7.0))).unwrap().is_none());
        let m = d.check_utility(&sample(&f, 2.0, Some(6.0))).unwrap().unwrap();
        assert!((m.severity - 0.8).abs() < 1e-12);
    }

    #[test]
    fn low_elevation_low_rating_is_flood_flag() {
        let f = SiteFeatures {
            elevation_ft: Some(12.0),
            flood_risk_score: Some(2.0),
            ..Default::default()
        };
        let m = MismatchDetector::default()
            .check_flood(&sample(&f, 5.0, None))
            .unwrap()
            .unwrap();
        assert_eq!(m.severity, 0.6);
    }

    #[test]
    fn broken_check_does_not_block_others() {
        let f = SiteFeatures {
            zoning_code: Some("C-1".to_string()),
            slope_percent: Some(f64::NAN),
            elevation_ft: Some(10.0),
            flood_risk_score: Some(0.0),
            ..Default::default()
        };
        let d = MismatchDetector::default();
        assert!(d.check_slope(&sample(&f, 5.0, None)).is_err());
        let found = d.scan(&sample(&f, 5.0, None));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, MismatchKind::Flood);
    }

    #[test]
    fn scan_region_filters_and_sorts() {
        let steep = SiteFeatures {
            zoning_code: Some("M-1".to_string()),
            slope_percent: Some(44.0),
            ..Default::default()
        };
        let mild = SiteFeatures {
            zoning_code: Some("M-1".to_string()),
            slope_percent: Some(27.0),
            ..Default::default()
        };
        let low = SiteFeatures {
            elevation_ft: Some(5.0),
            flood_risk_score: Some(1.0),
            ..Default::default()
        };
        let samples = [
            sample(&mild, 5.0, None),
            sample(&low, 5.0, None),
            sample(&steep, 5.0, None),
        ];
        let found = MismatchDetector::default().scan_region(&samples, 0.5);
        let kinds: Vec<_> = found.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MismatchKind::Slope, MismatchKind::Flood]);
        assert!(found[0].severity >= found[1].severity);
    }

    #[test]
    fn summary_and_report() {
        let f = SiteFeatures {
            zoning_code: Some("M-1".to_string()),
            slope_percent: Some(40.0),
            elevation_ft: Some(10.0),
            flood_risk_score: Some(1.0),
            ..Default::default()
        };
        let found = MismatchDetector::default().scan(&sample(&f, 1.0, Some(9.0)));
        let summary = MismatchSummary::from_mismatches(&found);
        assert_eq!(summary.count, 3);
        assert!(summary.contains(MismatchKind::Utility));
        assert_eq!(summary.max_severity, 1.0);

        let report = render_report(&found);
        assert!(report.contains("[slope] 1 finding(s)"));
        assert!(report.contains("[flood]"));
        assert_eq!(render_report(&[]), "No mismatches found.\n");
    }

    proptest! {
        #[test]
        fn severities_stay_in_unit_interval(
            slope in -10.0f64..200.0,
            elevation in -50.0f64..500.0,
            rating in 0.0f64..10.0,
            water in 0.0f64..5000.0,
            rule in 0.0f64..10.0,
            predicted in -50.0f64..50.0,
            zone in 0usize..5,
        ) {
            let codes = ["M-1", "C-1", "R-1", "A-1", "X"];
            let f = SiteFeatures {
                zoning_code: Some(codes[zone].to_string()),
                slope_percent: Some(slope),
                elevation_ft: Some(elevation),
                flood_risk_score: Some(rating),
                water_main_distance_ft: Some(water),
                sewer_distance_ft: Some(water / 2.0),
                ..Default::default()
            };
            for m in MismatchDetector::default().scan(&sample(&f, rule, Some(predicted))) {
                prop_assert!((0.0..=1.0).contains(&m.severity), "{m:?}");
            }
        }
    }
}
