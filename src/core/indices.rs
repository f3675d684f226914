//! Vegetation indices and the above-ground biomass regression.
//!
//! Inputs are harmonized reflectance fractions. Every function takes `Pixel`
//! values so a no-data input yields a no-data output, and anything that would
//! come out non-finite is reported as no-data instead.

use crate::types::{BandGrid, CanopyError, CanopyResult, Pixel, Raster, Sample};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Guard added to the IRECI red-edge ratio and its denominator
pub const IRECI_EPSILON: f64 = 0.0001;

/// Smallest EVI denominator allowed
pub const EVI_DENOMINATOR_FLOOR: f64 = 0.0001;

/// Band name of the biomass estimate in Mg/ha
pub const AGB_MGHA_BAND: &str = "AGB_MgHa";

fn finite(value: Sample) -> Pixel {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// (nir - red) / (nir + red); no-data when the sum is zero
pub fn ndvi(nir: Pixel, red: Pixel) -> Pixel {
    let (nir, red) = (nir?, red?);
    let sum = nir + red;
    if sum == 0.0 {
        return None;
    }
    finite((nir - red) / sum)
}

/// 2.5 (nir - red) / max(nir + 6 red - 7.5 blue + 1, floor), clamped to [0, 1].
///
/// Terms are divided by the largest input magnitude first, so extreme finite
/// reflectances saturate at 0 or 1 instead of overflowing.
pub fn evi(nir: Pixel, red: Pixel, blue: Pixel) -> Pixel {
    let (nir, red, blue) = (nir?, red?, blue?);
    let scale = nir.abs().max(red.abs()).max(blue.abs()).max(1.0);
    let (n, r, b) = (nir / scale, red / scale, blue / scale);
    let denominator = (n + 6.0 * r - 7.5 * b + 1.0 / scale).max(EVI_DENOMINATOR_FLOOR / scale);
    finite(num_traits::clamp(2.5 * (n - r) / denominator, 0.0, 1.0))
}

/// (re3 - red) / ((re1 / (re2 + eps)) + eps)
pub fn ireci(re3: Pixel, red: Pixel, re1: Pixel, re2: Pixel) -> Pixel {
    let (re3, red, re1, re2) = (re3?, red?, re1?, re2?);
    let ratio = re1 / (re2 + IRECI_EPSILON);
    finite((re3 - red) / (ratio + IRECI_EPSILON))
}

/// Leaf area index from EVI
pub fn lai(evi: Pixel) -> Pixel {
    finite(evi? * 3.618 - 0.118)
}

pub fn fapar(ndvi: Pixel) -> Pixel {
    finite(ndvi? * 1.24 - 0.168)
}

pub fn fcover(ndvi: Pixel) -> Pixel {
    finite(ndvi? * 1.26 - 0.18)
}

/// Single-band indices the engine can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralIndex {
    Ndvi,
    Evi,
    Ireci,
    Lai,
    Fapar,
    Fcover,
}

impl SpectralIndex {
    /// Output band name
    pub fn band_name(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "NDVI",
            SpectralIndex::Evi => "EVI",
            SpectralIndex::Ireci => "IRECI",
            SpectralIndex::Lai => "LAI",
            SpectralIndex::Fapar => "FAPAR",
            SpectralIndex::Fcover => "FCOVER",
        }
    }

    /// Harmonized bands read by the index, in evaluation order
    pub fn inputs(&self) -> &'static [&'static str] {
        match self {
            SpectralIndex::Ndvi | SpectralIndex::Fapar | SpectralIndex::Fcover => &["nir", "red"],
            SpectralIndex::Evi | SpectralIndex::Lai => &["nir", "red", "blue"],
            SpectralIndex::Ireci => &["re3", "red", "re1", "re2"],
        }
    }

    /// Evaluate at one pixel; `values` follow `inputs()`
    pub fn evaluate(&self, values: &[Pixel]) -> Pixel {
        let at = |i: usize| values.get(i).copied().flatten();
        match self {
            SpectralIndex::Ndvi => ndvi(at(0), at(1)),
            SpectralIndex::Evi => evi(at(0), at(1), at(2)),
            SpectralIndex::Ireci => ireci(at(0), at(1), at(2), at(3)),
            SpectralIndex::Lai => lai(evi(at(0), at(1), at(2))),
            SpectralIndex::Fapar => fapar(ndvi(at(0), at(1))),
            SpectralIndex::Fcover => fcover(ndvi(at(0), at(1))),
        }
    }
}

/// Coefficients of the linear biomass regression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiomassModel {
    pub red: f64,
    pub fcover: f64,
    pub fapar: f64,
    pub lai: f64,
    pub ireci: f64,
    pub intercept: f64,
    /// Multiplier turning the clamped estimate into Mg/ha
    pub unit_scale: f64,
}

impl Default for BiomassModel {
    fn default() -> Self {
        Self {
            red: 20.176,
            fcover: 6.633,
            fapar: 6.180,    // subtracted
            lai: 13.452,
            ireci: 6.307,    // subtracted
            intercept: 2.282, // subtracted
            unit_scale: 25.0,
        }
    }
}

/// Every intermediate of the biomass estimate at one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomassComponents {
    pub ndvi: Pixel,
    pub ireci: Pixel,
    pub evi: Pixel,
    pub lai: Pixel,
    pub fapar: Pixel,
    pub fcover: Pixel,
    pub agb: Pixel,
    pub agb_mg_ha: Pixel,
}

/// Reflectances feeding the biomass model at one pixel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reflectance {
    pub blue: Pixel,
    pub red: Pixel,
    pub nir: Pixel,
    pub re1: Pixel,
    pub re2: Pixel,
    pub re3: Pixel,
}

impl BiomassModel {
    /// Unclamped regression output
    pub fn agb_raw(&self, red: Pixel, fcover: Pixel, fapar: Pixel, lai: Pixel, ireci: Pixel) -> Pixel {
        finite(
            red? * self.red + fcover? * self.fcover - fapar? * self.fapar + lai? * self.lai
                - ireci? * self.ireci
                - self.intercept,
        )
    }

    /// Clamp at zero, then scale to Mg/ha
    pub fn agb_mg_ha(&self, agb: Pixel) -> Pixel {
        finite(agb?.max(0.0) * self.unit_scale)
    }

    pub fn estimate_pixel(&self, r: &Reflectance) -> BiomassComponents {
        let ndvi = ndvi(r.nir, r.red);
        let ireci = ireci(r.re3, r.red, r.re1, r.re2);
        let evi = evi(r.nir, r.red, r.blue);
        let lai = lai(evi);
        let fapar = fapar(ndvi);
        let fcover = fcover(ndvi);
        let agb = self.agb_raw(r.red, fcover, fapar, lai, ireci);
        BiomassComponents {
            ndvi,
            ireci,
            evi,
            lai,
            fapar,
            fcover,
            agb,
            agb_mg_ha: self.agb_mg_ha(agb),
        }
    }

    fn reflectance_grids<'a>(composite: &'a Raster) -> CanopyResult<[&'a BandGrid; 6]> {
        Ok([
            composite.band("blue")?,
            composite.band("red")?,
            composite.band("nir")?,
            composite.band("re1")?,
            composite.band("re2")?,
            composite.band("re3")?,
        ])
    }

    fn components_grid(&self, composite: &Raster) -> CanopyResult<Array2<BiomassComponents>> {
        let [blue, red, nir, re1, re2, re3] = Self::reflectance_grids(composite)?;
        Ok(Array2::from_shape_fn(composite.shape(), |idx| {
            self.estimate_pixel(&Reflectance {
                blue: blue[idx],
                red: red[idx],
                nir: nir[idx],
                re1: re1[idx],
                re2: re2[idx],
                re3: re3[idx],
            })
        }))
    }

    /// Single-band `AGB_MgHa` raster from a harmonized Sentinel-2 composite
    pub fn estimate(&self, composite: &Raster) -> CanopyResult<Raster> {
        let components = self.components_grid(composite)?;
        let out = Raster::new(composite.shape(), composite.geo_transform)
            .with_band(AGB_MGHA_BAND, components.mapv(|c| c.agb_mg_ha))?
            .copy_metadata_from(composite);
        log::info!(
            "Biomass estimated for {} of {} pixels",
            out.valid_count(AGB_MGHA_BAND)?,
            out.pixel_count()
        );
        Ok(out)
    }

    /// Every intermediate index as its own band, followed by `AGB` and `AGB_MgHa`
    pub fn estimate_with_components(&self, composite: &Raster) -> CanopyResult<Raster> {
        let c = self.components_grid(composite)?;
        Raster::new(composite.shape(), composite.geo_transform)
            .with_band("NDVI", c.mapv(|c| c.ndvi))?
            .with_band("IRECI", c.mapv(|c| c.ireci))?
            .with_band("EVI", c.mapv(|c| c.evi))?
            .with_band("LAI", c.mapv(|c| c.lai))?
            .with_band("FAPAR", c.mapv(|c| c.fapar))?
            .with_band("FCOVER", c.mapv(|c| c.fcover))?
            .with_band("AGB", c.mapv(|c| c.agb))?
            .with_band(AGB_MGHA_BAND, c.mapv(|c| c.agb_mg_ha))
            .map(|r| r.copy_metadata_from(composite))
    }
}

/// Index computation over harmonized composites
pub struct IndexEngine;

impl IndexEngine {
    /// Single-band raster named after the index, carrying the composite's metadata
    pub fn compute(composite: &Raster, index: SpectralIndex) -> CanopyResult<Raster> {
        let grids = index
            .inputs()
            .iter()
            .map(|band| composite.band(band))
            .collect::<CanopyResult<Vec<_>>>()?;
        let mut values = Vec::with_capacity(grids.len());
        let out = Array2::from_shape_fn(composite.shape(), |idx| {
            values.clear();
            values.extend(grids.iter().map(|g| g[idx]));
            index.evaluate(&values)
        });
        log::debug!("Computed {} over {:?}", index.band_name(), composite.shape());
        Ok(Raster::new(composite.shape(), composite.geo_transform)
            .with_band(index.band_name(), out)?
            .copy_metadata_from(composite))
    }

    /// (a - b) / (a + b) over two named bands, written to `output`
    pub fn normalized_difference(composite: &Raster, a: &str, b: &str, output: &str) -> CanopyResult<Raster> {
        if output.is_empty() {
            return Err(CanopyError::InvalidConfig("Output band name is empty".to_string()));
        }
        let (first, second) = (composite.band(a)?, composite.band(b)?);
        let out = ndarray::Zip::from(first).and(second).map_collect(|&x, &y| ndvi(x, y));
        Ok(Raster::new(composite.shape(), composite.geo_transform)
            .with_band(output, out)?
            .copy_metadata_from(composite))
    }
}
