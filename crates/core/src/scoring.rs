//! Rule-based ground truth.
//!
//! The rule engine is the independent signal the learner is trained against.
//! It must stay pure: same features in, same score out.

use serde::{Deserialize, Serialize};

use crate::features::SiteFeatures;

/// Neutral starting score on the 0-10 scale.
pub const BASE_SCORE: f64 = 5.0;

/// Penalty applied when a site carries the `flood_risk` flag.
pub const FLOOD_PENALTY: f64 = 2.0;

/// Score plus the rules that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleScore {
    /// Utility in \[0, 10\].
    pub score: f64,
    /// One line per rule that contributed points.
    pub trace: Vec<String>,
}

/// Scores a feature set.
pub trait RuleEngine: Send + Sync {
    fn score(&self, features: &SiteFeatures) -> RuleScore;
}

/// Single table entry keyed on a boolean feature flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub feature: String,
    pub points_when_true: f64,
    pub points_when_false: f64,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl Rule {
    pub fn new(feature: impl Into<String>, points_when_true: f64, points_when_false: f64) -> Self {
        Self {
            feature: feature.into(),
            points_when_true,
            points_when_false,
            enabled: true,
        }
    }
}

/// Additive rule table: base score, plus per-rule points, minus the flood
/// penalty, clamped to \[0, 10\].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    pub rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(vec![
            Rule::new("has_water", 1.5, -1.0),
            Rule::new("has_road", 1.0, -2.0),
            Rule::new("is_industrial", 2.0, 0.0),
            Rule::new("is_commercial", 1.5, 0.0),
            Rule::new("is_residential", -0.5, 0.5),
            Rule::new("is_agricultural", -1.5, 0.0),
            Rule::new("high_elevation", -2.0, 0.0),
            Rule::new("low_elevation", 1.0, 0.0),
        ])
    }
}

impl RuleEngine for RuleTable {
    fn score(&self, features: &SiteFeatures) -> RuleScore {
        let mut score = BASE_SCORE;
        let mut trace = Vec::new();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            let present = features.flag(&rule.feature);
            let points = if present {
                rule.points_when_true
            } else {
                rule.points_when_false
            };
            if points != 0.0 {
                trace.push(format!("{} = {}: {:+.1}", rule.feature, present, points));
            }
            score += points;
        }

        if features.flood_risk {
            score -= FLOOD_PENALTY;
            trace.push(format!("flood_risk penalty: -{FLOOD_PENALTY:.1}"));
        }

        RuleScore {
            score: score.clamp(0.0, 10.0),
            trace,
        }
    }
}

impl<T: RuleEngine + ?Sized> RuleEngine for std::sync::Arc<T> {
    fn score(&self, features: &SiteFeatures) -> RuleScore {
        (**self).score(features)
    }
}
