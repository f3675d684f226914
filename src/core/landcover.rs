use crate::core::resample::{resample, Resampling};
use crate::types::{CanopyResult, QualityMask, Raster};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Land-cover masking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandCoverParams {
    /// Catalog id of the land-cover collection (first image is used)
    pub collection: String,
    /// Band carrying the class codes
    pub band: String,
    /// Classes kept by the mask
    pub classes: Vec<i64>,
    /// Export scale of masked rasters in metres
    pub scale: f64,
}

impl Default for LandCoverParams {
    fn default() -> Self {
        Self {
            collection: "ESA/WorldCover/v200".to_string(),
            band: "Map".to_string(),
            // tree cover, shrubland, grassland, bare / sparse vegetation
            classes: vec![10, 20, 30, 60],
            scale: 100.0,
        }
    }
}

/// Keeps pixels whose land-cover class is in a fixed set
#[derive(Debug, Clone, PartialEq)]
pub struct LandCoverMask {
    classes: BTreeSet<i64>,
    band: String,
}

impl LandCoverMask {
    pub fn new(classes: impl IntoIterator<Item = i64>, band: &str) -> Self {
        Self { classes: classes.into_iter().collect(), band: band.to_string() }
    }

    /// WorldCover vegetated classes
    pub fn vegetated() -> Self {
        Self::from_params(&LandCoverParams::default())
    }

    pub fn from_params(params: &LandCoverParams) -> Self {
        Self::new(params.classes.iter().copied(), &params.band)
    }

    pub fn classes(&self) -> &BTreeSet<i64> {
        &self.classes
    }

    /// True where the class code is kept; no-data class pixels are masked
    pub fn mask(&self, landcover: &Raster) -> CanopyResult<QualityMask> {
        let codes = landcover.band(&self.band)?;
        Ok(codes.mapv(|code| code.map_or(false, |c| self.classes.contains(&(c.round() as i64)))))
    }

    /// Mask `image` by land cover. A land-cover raster on another grid is
    /// brought onto the image grid by nearest neighbour first.
    pub fn apply(&self, image: &Raster, landcover: &Raster) -> CanopyResult<Raster> {
        let landcover = resample(landcover, &image.grid(), Resampling::Nearest)?;
        let mask = self.mask(&landcover)?;
        log::debug!(
            "Land-cover mask keeps {} of {} pixels",
            mask.iter().filter(|&&keep| keep).count(),
            mask.len()
        );
        image.update_mask(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::array;

    fn worldcover(gt: GeoTransform) -> Raster {
        Raster::new((2, 2), gt)
            .with_band("Map", array![[Some(10.0), Some(50.0)], [Some(60.0), None]])
            .unwrap()
    }

    #[test]
    fn test_vegetated_classes() {
        let mask = LandCoverMask::vegetated()
            .mask(&worldcover(GeoTransform::north_up(0.0, 20.0, 10.0)))
            .unwrap();
        assert_eq!(mask, array![[true, false], [true, false]]);
    }

    #[test]
    fn test_apply_resamples_finer_landcover() {
        // 2x2 NDVI at 20 m over a 4x4 map at 10 m: nearest picks the class under each centre
        let ndvi = Raster::new((2, 2), GeoTransform::north_up(0.0, 40.0, 20.0))
            .with_constant_band("NDVI", Some(0.6))
            .unwrap()
            .with_property("year", 2021);
        let codes = array![
            [Some(10.0), Some(10.0), Some(80.0), Some(80.0)],
            [Some(10.0), Some(10.0), Some(80.0), Some(80.0)],
            [Some(30.0), Some(30.0), Some(20.0), Some(20.0)],
            [Some(30.0), Some(30.0), Some(20.0), Some(20.0)]
        ];
        let landcover = Raster::new((4, 4), GeoTransform::north_up(0.0, 40.0, 10.0))
            .with_band("Map", codes)
            .unwrap();
        let masked = LandCoverMask::vegetated().apply(&ndvi, &landcover).unwrap();
        let values = masked.band("NDVI").unwrap();
        assert_eq!(values, &array![[Some(0.6), None], [Some(0.6), Some(0.6)]]);
        assert_eq!(masked.property("year"), ndvi.property("year"));
    }
}
