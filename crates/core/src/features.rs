//! Site features: what a fetcher knows about a single position.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::geo::Position;

/// Numeric feature vector handed to the learner (sorted, stable key order).
pub type FeatureMap = BTreeMap<String, f64>;

/// Where a feature set came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSource {
    /// Returned by a real data source.
    #[default]
    Fetched,
    /// Hash-derived stand-in produced when fetching failed.
    Synthetic,
}

/// Zoning class derived from a zoning code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zoning {
    Industrial,
    Commercial,
    Residential,
    Agricultural,
    Unknown,
}

impl Zoning {
    /// `M-*` industrial, `C-*` commercial, `R-*` residential, `A-*` agricultural.
    pub fn from_code(code: &str) -> Self {
        let code = code.trim().to_ascii_uppercase();
        match code.split('-').next() {
            Some("M") => Zoning::Industrial,
            Some("C") => Zoning::Commercial,
            Some("R") => Zoning::Residential,
            Some("A") => Zoning::Agricultural,
            _ => Zoning::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Zoning::Industrial => "industrial",
            Zoning::Commercial => "commercial",
            Zoning::Residential => "residential",
            Zoning::Agricultural => "agricultural",
            Zoning::Unknown => "unknown",
        }
    }
}

/// Typed result of a feature fetch.
///
/// Numeric measurements are optional: a source may know the zoning code but
/// not the slope. Boolean access flags default to `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteFeatures {
    pub zoning_code: Option<String>,
    pub slope_percent: Option<f64>,
    pub elevation_ft: Option<f64>,
    /// Official flood-risk rating, 0 (none) to 10 (severe).
    pub flood_risk_score: Option<f64>,
    pub water_main_distance_ft: Option<f64>,
    pub sewer_distance_ft: Option<f64>,

    pub has_water: bool,
    pub has_road: bool,
    pub is_industrial: bool,
    pub is_commercial: bool,
    pub is_residential: bool,
    pub is_agricultural: bool,
    pub high_elevation: bool,
    pub low_elevation: bool,
    pub flood_risk: bool,

    pub source: FeatureSource,
}

impl SiteFeatures {
    /// Deterministic stand-in for a failed fetch.
    ///
    /// Derived from a SHA-256 of the position rounded to 4 decimals, so the
    /// same spot always yields the same features. Tagged
    /// [`FeatureSource::Synthetic`].
    pub fn synthetic(position: Position) -> Self {
        let digest = Sha256::digest(format!("{:.4},{:.4}", position.lat, position.lon).as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        let h = u64::from_be_bytes(a);
        let h2 = u64::from_be_bytes(b);

        let class = h % 10;
        let is_industrial = class < 2;
        let is_commercial = class == 2;
        let is_agricultural = (3..5).contains(&class);
        let is_residential = class >= 5;
        let high_elevation = h % 20 == 0;

        let zoning_code = if is_industrial {
            "M-1"
        } else if is_commercial {
            "C-2"
        } else if is_agricultural {
            "A-1"
        } else {
            "R-1"
        };

        let elevation_ft = if high_elevation {
            200.0 + ((h2 >> 16) % 300) as f64
        } else {
            5.0 + ((h2 >> 16) % 150) as f64
        };

        Self {
            zoning_code: Some(zoning_code.to_string()),
            slope_percent: Some((h2 % 400) as f64 / 10.0),
            elevation_ft: Some(elevation_ft),
            flood_risk_score: Some(((h2 >> 32) % 11) as f64),
            water_main_distance_ft: Some(((h2 >> 40) % 2000) as f64),
            sewer_distance_ft: Some(((h2 >> 48) % 2000) as f64),
            has_water: h % 5 == 0,
            has_road: h % 3 != 0,
            is_industrial,
            is_commercial,
            is_residential,
            is_agricultural,
            high_elevation,
            low_elevation: elevation_ft < 30.0,
            flood_risk: false,
            source: FeatureSource::Synthetic,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.source == FeatureSource::Synthetic
    }

    /// Zoning class, from the code when present, otherwise from the flags.
    pub fn zoning(&self) -> Zoning {
        if let Some(code) = &self.zoning_code {
            return Zoning::from_code(code);
        }
        if self.is_industrial {
            Zoning::Industrial
        } else if self.is_commercial {
            Zoning::Commercial
        } else if self.is_residential {
            Zoning::Residential
        } else if self.is_agricultural {
            Zoning::Agricultural
        } else {
            Zoning::Unknown
        }
    }

    /// Look up a boolean flag by its rule key. Unknown keys read as `false`.
    pub fn flag(&self, key: &str) -> bool {
        match key {
            "has_water" => self.has_water,
            "has_road" => self.has_road,
            "is_industrial" => self.is_industrial,
            "is_commercial" => self.is_commercial,
            "is_residential" => self.is_residential,
            "is_agricultural" => self.is_agricultural,
            "high_elevation" => self.high_elevation,
            "low_elevation" => self.low_elevation,
            "flood_risk" => self.flood_risk,
            _ => false,
        }
    }

    /// Numeric view for the learner. Flags become 0/1; missing measurements
    /// are omitted.
    pub fn to_feature_map(&self) -> FeatureMap {
        let mut map = FeatureMap::new();
        for key in [
            "has_water",
            "has_road",
            "is_industrial",
            "is_commercial",
            "is_residential",
            "is_agricultural",
            "high_elevation",
            "low_elevation",
            "flood_risk",
        ] {
            map.insert(key.to_string(), if self.flag(key) { 1.0 } else { 0.0 });
        }

        let numeric = [
            ("slope_percent", self.slope_percent),
            ("elevation_ft", self.elevation_ft),
            ("flood_risk_score", self.flood_risk_score),
            ("water_main_distance_ft", self.water_main_distance_ft),
            ("sewer_distance_ft", self.sewer_distance_ft),
        ];
        for (key, value) in numeric {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                map.insert(key.to_string(), v);
            }
        }
        map
    }
}
