//! Quality masking, radiometric rescaling and band harmonization.
//!
//! Landsat Collection 2 Level-2 scenes carry bit-packed `QA_PIXEL` flags and a
//! `QA_RADSAT` saturation band. Both are turned into a quality mask, digital
//! numbers are rescaled to reflectance (and Kelvin for thermal bands), and the
//! sensor-native band names are mapped onto the shared semantic set so scenes
//! from Landsat 5, 7, 8 and 9 can be merged into one collection.

use crate::types::{CanopyError, CanopyResult, QualityMask, Raster, SensorFamily};
use ndarray::Zip;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Semantic band names every harmonized scene exposes
pub const SEMANTIC_BANDS: [&str; 6] = ["blue", "green", "red", "nir", "swir1", "swir2"];

/// Sentinel-2 red-edge bands kept in addition to the semantic set
pub const RED_EDGE_BANDS: [&str; 3] = ["re1", "re2", "re3"];

/// Name of the harmonized thermal band when it is kept
pub const THERMAL_BAND: &str = "thermal";

const LANDSAT_457_BANDS: [(&str, &str); 6] = [
    ("SR_B1", "blue"),
    ("SR_B2", "green"),
    ("SR_B3", "red"),
    ("SR_B4", "nir"),
    ("SR_B5", "swir1"),
    ("SR_B7", "swir2"),
];

const LANDSAT_89_BANDS: [(&str, &str); 6] = [
    ("SR_B2", "blue"),
    ("SR_B3", "green"),
    ("SR_B4", "red"),
    ("SR_B5", "nir"),
    ("SR_B6", "swir1"),
    ("SR_B7", "swir2"),
];

const SENTINEL2_BANDS: [(&str, &str); 9] = [
    ("B2", "blue"),
    ("B3", "green"),
    ("B4", "red"),
    ("B5", "re1"),
    ("B6", "re2"),
    ("B7", "re3"),
    ("B8", "nir"),
    ("B11", "swir1"),
    ("B12", "swir2"),
];

/// Native to semantic band mapping for a sensor
pub fn band_mapping(sensor: SensorFamily) -> &'static [(&'static str, &'static str)] {
    match sensor {
        SensorFamily::Landsat5 | SensorFamily::Landsat7 => &LANDSAT_457_BANDS,
        SensorFamily::Landsat8 | SensorFamily::Landsat9 => &LANDSAT_89_BANDS,
        SensorFamily::Sentinel2 => &SENTINEL2_BANDS,
    }
}

/// Native thermal band of a Landsat sensor
fn thermal_band(sensor: SensorFamily) -> Option<&'static str> {
    match sensor {
        SensorFamily::Landsat5 | SensorFamily::Landsat7 => Some("ST_B6"),
        SensorFamily::Landsat8 | SensorFamily::Landsat9 => Some("ST_B10"),
        SensorFamily::Sentinel2 => None,
    }
}

/// Linear rescaling `value * multiply + add`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiometricScale {
    pub multiply: f64,
    pub add: f64,
}

impl RadiometricScale {
    pub fn apply(&self, value: f64) -> f64 {
        value * self.multiply + self.add
    }
}

/// Harmonization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonizationParams {
    /// QA_PIXEL bits that reject a pixel (fill, dilated cloud, cirrus, cloud, shadow)
    pub qa_reject_bits: u32,
    /// Landsat surface reflectance scaling
    pub optical: RadiometricScale,
    /// Landsat surface temperature scaling (Kelvin)
    pub thermal: RadiometricScale,
    /// Sentinel-2 digital number to reflectance factor
    pub sentinel2_reflectance_factor: f64,
    /// Keep the rescaled thermal band as `thermal`
    pub keep_thermal: bool,
}

impl Default for HarmonizationParams {
    fn default() -> Self {
        Self {
            qa_reject_bits: 0b11111,
            optical: RadiometricScale { multiply: 0.0000275, add: -0.2 },
            thermal: RadiometricScale { multiply: 0.00341802, add: 149.0 },
            sentinel2_reflectance_factor: 0.0001,
            keep_thermal: false,
        }
    }
}

/// Quality filter and band harmonizer for one sensor family
#[derive(Debug, Clone)]
pub struct BandHarmonizer {
    params: HarmonizationParams,
    optical_pattern: Regex,
    thermal_pattern: Regex,
}

impl PartialEq for BandHarmonizer {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl BandHarmonizer {
    pub fn new(params: HarmonizationParams) -> CanopyResult<Self> {
        let optical_pattern = Regex::new(r"^SR_B.$")
            .map_err(|e| CanopyError::InvalidConfig(format!("Regex error: {}", e)))?;
        let thermal_pattern = Regex::new(r"^ST_B.*")
            .map_err(|e| CanopyError::InvalidConfig(format!("Regex error: {}", e)))?;
        Ok(Self { params, optical_pattern, thermal_pattern })
    }

    pub fn params(&self) -> &HarmonizationParams {
        &self.params
    }

    /// Bands a harmonized scene of `sensor` exposes
    pub fn output_bands(&self, sensor: SensorFamily) -> Vec<String> {
        let mut bands: Vec<String> = band_mapping(sensor).iter().map(|(_, to)| to.to_string()).collect();
        if self.params.keep_thermal && thermal_band(sensor).is_some() {
            bands.push(THERMAL_BAND.to_string());
        }
        bands
    }

    /// Landsat quality mask: no rejected QA bits and no saturated channel.
    /// A QA pixel without a value rejects the pixel.
    pub fn quality_mask(&self, scene: &Raster) -> CanopyResult<QualityMask> {
        let qa = scene.band("QA_PIXEL")?;
        let radsat = scene.band("QA_RADSAT")?;
        let reject = self.params.qa_reject_bits;

        let mask = Zip::from(qa).and(radsat).map_collect(|&qa, &sat| match (qa, sat) {
            (Some(qa), Some(sat)) => {
                let clear = qa >= 0.0 && (qa as u32) & reject == 0;
                clear && sat == 0.0
            }
            _ => false,
        });
        Ok(mask)
    }

    /// Rescale `SR_B*` to reflectance and `ST_B*` to Kelvin, replacing the native bands
    pub fn rescale_landsat(&self, scene: &Raster) -> CanopyResult<Raster> {
        let optical_scale = self.params.optical;
        let thermal_scale = self.params.thermal;
        let optical = scene
            .select_matching(&self.optical_pattern)
            .map_values(|v| optical_scale.apply(v));
        let thermal = scene
            .select_matching(&self.thermal_pattern)
            .map_values(|v| thermal_scale.apply(v));
        scene.add_bands(&optical, true)?.add_bands(&thermal, true)
    }

    /// Mask, rescale and rename one scene. Timestamps and properties are preserved.
    pub fn harmonize(&self, scene: &Raster, sensor: SensorFamily) -> CanopyResult<Raster> {
        let mut mapping: Vec<(&str, &str)> = band_mapping(sensor).to_vec();

        let prepared = if sensor.is_landsat() {
            let mask = self.quality_mask(scene)?;
            if self.params.keep_thermal {
                if let Some(native) = thermal_band(sensor) {
                    mapping.push((native, THERMAL_BAND));
                }
            }
            self.rescale_landsat(scene)?.update_mask(&mask)?
        } else {
            let factor = self.params.sentinel2_reflectance_factor;
            let natives: Vec<&str> = mapping.iter().map(|(from, _)| *from).collect();
            scene.select(&natives)?.map_values(|v| v * factor)
        };

        let harmonized = prepared.select_renamed(&mapping)?;
        log::debug!(
            "Harmonized {} scene ({} of {} pixels valid)",
            sensor,
            harmonized.valid_count("red")?,
            harmonized.pixel_count()
        );
        Ok(harmonized)
    }
}
