//! Pipeline configuration.
//!
//! Every field defaults to the values the Kaya / Wirong campaigns were run with,
//! so an empty JSON object is a complete configuration.

use crate::core::comparison::SamplingParams;
use crate::core::harmonize::HarmonizationParams;
use crate::core::indices::BiomassModel;
use crate::core::landcover::LandCoverParams;
use crate::core::source_select::SourceSelectionParams;
use crate::io::export::DEFAULT_MAX_PIXELS;
use crate::types::{calendar_date, CanopyError, CanopyResult, SensorFamily, TimeSpan};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Seasonal NDVI composites over several sensors, one per configured year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdviCampaign {
    pub sensors: Vec<SensorFamily>,
    /// First day of the season (month, day), inclusive
    pub season_start: (u32, u32),
    /// End of the season (month, day), exclusive
    pub season_end: (u32, u32),
    /// Earliest usable Landsat 8 acquisition for this campaign
    pub landsat8_start: NaiveDate,
    /// Compositing resolution in metres
    pub native_scale: f64,
    /// Export resolution in metres
    pub export_scale: f64,
    /// Asset name prefix, followed by the year
    pub prefix: String,
}

impl NdviCampaign {
    /// Landsat 5/7/8 May–June composites exported at 30 m
    pub fn may_june() -> Self {
        Self {
            sensors: vec![SensorFamily::Landsat5, SensorFamily::Landsat7, SensorFamily::Landsat8],
            season_start: (5, 1),
            season_end: (7, 1),
            landsat8_start: calendar_date(2013, 5, 1),
            native_scale: 30.0,
            export_scale: 30.0,
            prefix: "NDVI_".to_string(),
        }
    }

    /// Landsat 8/9 January–May composites exported at 100 m
    pub fn jan_may() -> Self {
        Self {
            sensors: vec![SensorFamily::Landsat8, SensorFamily::Landsat9],
            season_start: (1, 1),
            season_end: (5, 31),
            landsat8_start: calendar_date(2013, 1, 1),
            native_scale: 30.0,
            export_scale: 100.0,
            prefix: "NDVI_JanApr_".to_string(),
        }
    }

    /// Season of `year` as a half-open span
    pub fn window(&self, year: i32) -> CanopyResult<TimeSpan> {
        let date = |(month, day): (u32, u32)| {
            NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
                CanopyError::InvalidConfig(format!("Invalid season date {}-{}-{}", year, month, day))
            })
        };
        TimeSpan::from_dates(date(self.season_start)?, date(self.season_end)?)
    }

    pub fn asset_name(&self, year: i32) -> String {
        format!("{}{}", self.prefix, year)
    }
}

impl Default for NdviCampaign {
    fn default() -> Self {
        Self::may_june()
    }
}

/// Sentinel-2 biomass estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiomassCampaign {
    pub start: NaiveDate,
    /// Exclusive
    pub end: NaiveDate,
    /// Year the estimate is filed under
    pub year: i32,
    pub native_scale: f64,
    pub export_scale: f64,
    pub asset_id: String,
    pub description: String,
    pub model: BiomassModel,
    /// Export every intermediate index next to `AGB_MgHa`
    pub with_components: bool,
}

impl Default for BiomassCampaign {
    fn default() -> Self {
        Self {
            start: calendar_date(2024, 1, 1),
            end: calendar_date(2024, 3, 1),
            year: 2021,
            native_scale: 20.0,
            // matches the 1 ha reference pixels
            export_scale: 100.0,
            asset_id: "projects/ee-komba/assets/AGB_2021".to_string(),
            description: "AGB_2021_export".to_string(),
            model: BiomassModel::default(),
            with_components: false,
        }
    }
}

/// Model versus reference biomass comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonCampaign {
    pub model_asset: String,
    pub reference_collection: String,
    pub reference_band: String,
    pub reference_start: NaiveDate,
    /// Exclusive
    pub reference_end: NaiveDate,
    pub sampling: SamplingParams,
    pub description: String,
    /// Also export the model - reference difference raster under this id
    pub difference_asset: Option<String>,
}

impl Default for ComparisonCampaign {
    fn default() -> Self {
        Self {
            model_asset: "projects/ee-komba/assets/AGB_2021".to_string(),
            reference_collection: "projects/sat-io/open-datasets/ESA/ESA_CCI_AGB".to_string(),
            reference_band: "AGB".to_string(),
            reference_start: calendar_date(2021, 1, 1),
            reference_end: calendar_date(2021, 12, 31),
            sampling: SamplingParams::default(),
            description: "AGB_Model_vs_CCI_SamplePoints".to_string(),
            difference_asset: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub years: Vec<i32>,
    /// Prefix of every NDVI asset id
    pub asset_path: String,
    /// Catalog id of the region of interest
    pub region_id: String,
    pub max_pixels: f64,
    pub selection: SourceSelectionParams,
    pub harmonization: HarmonizationParams,
    pub may_june: NdviCampaign,
    pub jan_may: NdviCampaign,
    pub biomass: BiomassCampaign,
    pub comparison: ComparisonCampaign,
    pub landcover: LandCoverParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            years: vec![2013, 2015, 2017, 2019, 2021, 2023],
            asset_path: "projects/ee-komba/assets/kaya/".to_string(),
            region_id: "projects/ee-komba/assets/bbox_wirong".to_string(),
            max_pixels: DEFAULT_MAX_PIXELS,
            selection: SourceSelectionParams::default(),
            harmonization: HarmonizationParams::default(),
            may_june: NdviCampaign::may_june(),
            jan_may: NdviCampaign::jan_may(),
            biomass: BiomassCampaign::default(),
            comparison: ComparisonCampaign::default(),
            landcover: LandCoverParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> CanopyResult<Self> {
        let config: PipelineConfig = serde_json::from_str(json)
            .map_err(|e| CanopyError::InvalidConfig(format!("Bad configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CanopyResult<Self> {
        let json = std::fs::read_to_string(path)?;
        log::info!("Loading configuration from {}", path.display());
        Self::from_json_str(&json)
    }

    /// Reject values no campaign can run with
    pub fn validate(&self) -> CanopyResult<()> {
        if self.years.is_empty() {
            return Err(CanopyError::InvalidConfig("No years configured".to_string()));
        }
        if !(self.max_pixels > 0.0) {
            return Err(CanopyError::InvalidConfig(format!("max_pixels must be positive, got {}", self.max_pixels)));
        }
        let scales = [
            ("may_june.native_scale", self.may_june.native_scale),
            ("may_june.export_scale", self.may_june.export_scale),
            ("jan_may.native_scale", self.jan_may.native_scale),
            ("jan_may.export_scale", self.jan_may.export_scale),
            ("biomass.native_scale", self.biomass.native_scale),
            ("biomass.export_scale", self.biomass.export_scale),
            ("comparison.sampling.scale", self.comparison.sampling.scale),
            ("landcover.scale", self.landcover.scale),
        ];
        for (name, scale) in scales {
            if !(scale > 0.0) || !scale.is_finite() {
                return Err(CanopyError::InvalidConfig(format!("{} must be positive, got {}", name, scale)));
            }
        }
        for campaign in [&self.may_june, &self.jan_may] {
            for &year in &self.years {
                campaign.window(year)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.years, vec![2013, 2015, 2017, 2019, 2021, 2023]);
        assert_eq!(config.selection.max_wrs_row, 122.0);
        assert_eq!(config.comparison.sampling.seed, 42);
        assert_eq!(config.max_pixels, 1e13);
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "years": [2021],
            "jan_may": {
                "sensors": ["Landsat9"],
                "season_start": [2, 1],
                "season_end": [4, 1],
                "landsat8_start": "2013-01-01",
                "native_scale": 30.0,
                "export_scale": 250.0,
                "prefix": "NDVI_FebMar_"
            },
            "comparison": {"sampling": {"num_pixels": 50}}
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();
        assert_eq!(config.years, vec![2021]);
        assert_eq!(config.jan_may.asset_name(2021), "NDVI_FebMar_2021");
        assert_eq!(config.comparison.sampling.num_pixels, 50);
        assert_eq!(config.comparison.sampling.seed, 42);
        assert_eq!(config.may_june, NdviCampaign::may_june());
    }

    #[test]
    fn test_season_windows() {
        let window = NdviCampaign::may_june().window(2019).unwrap();
        assert_eq!(window.start.format("%Y-%m-%d").to_string(), "2019-05-01");
        assert_eq!(window.end.format("%Y-%m-%d").to_string(), "2019-07-01");

        let window = NdviCampaign::jan_may().window(2023).unwrap();
        assert_eq!(window.end.format("%Y-%m-%d").to_string(), "2023-05-31");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{"years": []}"#),
            Err(CanopyError::InvalidConfig(_))
        ));
        assert!(PipelineConfig::from_json_str(r#"{"landcover": {"scale": 0}}"#).is_err());
        assert!(PipelineConfig::from_json_str("not json").is_err());

        let mut campaign = NdviCampaign::may_june();
        campaign.season_end = (2, 30);
        assert!(campaign.window(2021).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy.json");
        std::fs::write(&path, r#"{"region_id": "projects/demo/assets/aoi"}"#).unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.region_id, "projects/demo/assets/aoi");
    }
}
