use crate::core::collection::ImageCollection;
use crate::core::region::Region;
use crate::core::resample::{resample, Resampling};
use crate::types::{BandGrid, CanopyError, CanopyResult, OutputGrid, Pixel, Raster, TimeSpan};
use ndarray::Array2;
use std::borrow::Cow;
use std::sync::Arc;

/// Median of the values, `None` when empty. Even counts average the two middle values.
///
/// Values are put in total order first, so the result does not depend on the
/// order they were observed in.
pub fn median(values: &mut [f64]) -> Pixel {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Per-pixel median across `grids`, skipping no-data observations
pub fn median_band(grids: &[&BandGrid], shape: (usize, usize)) -> CanopyResult<BandGrid> {
    let (rows, cols) = shape;
    if let Some(bad) = grids.iter().find(|g| g.dim() != shape) {
        return Err(CanopyError::GridMismatch(format!(
            "Band of shape {:?} cannot join a {:?} composite",
            bad.dim(),
            shape
        )));
    }

    let compute_row = |row: usize| -> Vec<Pixel> {
        let mut values = Vec::with_capacity(grids.len());
        (0..cols)
            .map(|col| {
                values.clear();
                values.extend(grids.iter().filter_map(|g| g[[row, col]]));
                median(&mut values)
            })
            .collect()
    };

    #[cfg(feature = "parallel")]
    let row_values: Vec<Vec<Pixel>> = {
        use rayon::prelude::*;
        (0..rows).into_par_iter().map(compute_row).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let row_values: Vec<Vec<Pixel>> = (0..rows).map(compute_row).collect();

    let data: Vec<Pixel> = row_values.into_iter().flatten().collect();
    Array2::from_shape_vec(shape, data)
        .map_err(|e| CanopyError::GridMismatch(format!("Shape error: {}", e)))
}

/// Median compositor for one period over one region.
///
/// Contributing images must already be filtered to the period. Scenes that only
/// partly overlap the compositor's grid contribute where they cover it. The
/// composite carries the period as its time span.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalCompositor {
    period: TimeSpan,
    region: Arc<Region>,
    grid: OutputGrid,
    bands: Vec<String>,
    year: Option<i32>,
}

impl TemporalCompositor {
    pub fn new(period: TimeSpan, region: Arc<Region>, grid: OutputGrid, bands: Vec<String>) -> Self {
        Self { period, region, grid, bands, year: None }
    }

    /// Tag the composite with a `year` property
    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn period(&self) -> &TimeSpan {
        &self.period
    }

    pub fn grid(&self) -> &OutputGrid {
        &self.grid
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    /// Scenes off the composite grid are resampled onto it by nearest neighbour
    fn align<'a>(&self, image: &'a Raster) -> CanopyResult<Cow<'a, Raster>> {
        if image.shape() == self.grid.shape() && image.geo_transform.approx_eq(&self.grid.geo_transform) {
            return Ok(Cow::Borrowed(image));
        }
        log::debug!(
            "Scene of shape {:?} at ({}, {}) is off the composite grid, resampling",
            image.shape(),
            image.geo_transform.top_left_x,
            image.geo_transform.top_left_y
        );
        Ok(Cow::Owned(resample(image, &self.grid, Resampling::Nearest)?))
    }

    /// Reduce `collection` to one raster. An empty collection gives an all no-data composite.
    pub fn composite(&self, collection: &ImageCollection) -> CanopyResult<Raster> {
        log::info!(
            "Compositing {} images for {} .. {} on a {}x{} grid",
            collection.len(),
            self.period.start.format("%Y-%m-%d"),
            self.period.end.format("%Y-%m-%d"),
            self.grid.rows,
            self.grid.cols
        );
        if collection.is_empty() {
            log::warn!(
                "No images contribute to the {} composite; output is entirely no-data",
                self.period.start.format("%Y-%m-%d")
            );
        }

        let aligned = collection
            .iter()
            .map(|image| self.align(image))
            .collect::<CanopyResult<Vec<_>>>()?;

        let mut composite = self.grid.empty_raster();
        for band in &self.bands {
            let grids = aligned
                .iter()
                .map(|image| image.band(band))
                .collect::<CanopyResult<Vec<_>>>()?;
            composite = composite.with_band(band, median_band(&grids, self.grid.shape())?)?;
        }

        let mut composite = self
            .region
            .clip(&composite)?
            .with_time_span(&self.period)
            .with_property("image_count", collection.len() as f64);
        if let Some(year) = self.year {
            composite = composite.with_property("year", year);
        }
        Ok(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn grid() -> OutputGrid {
        OutputGrid::new(GeoTransform::north_up(0.0, 90.0, 30.0), 3, 3)
    }

    fn period() -> TimeSpan {
        TimeSpan::new(
            Utc.with_ymd_and_hms(2021, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn compositor(region: Region) -> TemporalCompositor {
        TemporalCompositor::new(period(), Arc::new(region), grid(), vec!["red".into(), "nir".into()])
            .with_year(2021)
    }

    fn image(red: Pixel, nir: Pixel, day: u32) -> Raster {
        grid()
            .empty_raster()
            .with_constant_band("red", red)
            .unwrap()
            .with_constant_band("nir", nir)
            .unwrap()
            .with_time_start(Utc.with_ymd_and_hms(2021, 5, day, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_median_odd_even_empty() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn test_composite_skips_no_data() {
        let region = Region::rectangle(0.0, 0.0, 90.0, 90.0).unwrap();
        let images = ImageCollection::new(vec![
            image(Some(0.1), Some(0.3), 2),
            image(None, Some(0.5), 3),
            image(Some(0.3), None, 4),
        ]);
        let out = compositor(region).composite(&images).unwrap();
        assert_eq!(out.band("red").unwrap()[[1, 1]], Some(0.2));
        assert_eq!(out.band("nir").unwrap()[[1, 1]], Some(0.4));
        assert_eq!(out.time_start, Some(period().start));
        assert_eq!(out.time_end, Some(period().end));
        assert_eq!(out.property("year").and_then(|p| p.as_f64()), Some(2021.0));
    }

    #[test]
    fn test_composite_is_order_invariant() {
        let region = Region::rectangle(0.0, 0.0, 90.0, 90.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        // same acquisition time everywhere so the collection keeps the shuffled order
        let mut images: Vec<Raster> = (0..9)
            .map(|_| {
                let red = if rng.gen_bool(0.2) { None } else { Some(rng.gen_range(0.0..0.5)) };
                image(red, Some(rng.gen_range(0.0..1.0)), 5)
            })
            .collect();
        let compositor = compositor(region);
        let reference = compositor.composite(&ImageCollection::new(images.clone())).unwrap();
        for _ in 0..5 {
            images.shuffle(&mut rng);
            let shuffled = compositor.composite(&ImageCollection::new(images.clone())).unwrap();
            assert_eq!(shuffled.band("red").unwrap(), reference.band("red").unwrap());
            assert_eq!(shuffled.band("nir").unwrap(), reference.band("nir").unwrap());
        }
    }

    #[test]
    fn test_empty_collection_gives_no_data() {
        let region = Region::rectangle(0.0, 0.0, 90.0, 90.0).unwrap();
        let out = compositor(region).composite(&ImageCollection::empty()).unwrap();
        assert_eq!(out.band_names(), vec!["red", "nir"]);
        assert_eq!(out.valid_count("red").unwrap(), 0);
        assert_eq!(out.valid_count("nir").unwrap(), 0);
    }

    #[test]
    fn test_composite_is_clipped() {
        let region = Region::rectangle(0.0, 30.0, 60.0, 90.0).unwrap();
        let images = ImageCollection::new(vec![image(Some(0.1), Some(0.3), 2)]);
        let out = compositor(region).composite(&images).unwrap();
        let red = out.band("red").unwrap();
        assert_eq!(red[[0, 0]], Some(0.1));
        assert_eq!(red[[0, 2]], None);
        assert_eq!(red[[2, 0]], None);
        assert_eq!(out.valid_count("red").unwrap(), 4);
    }

    #[test]
    fn test_shifted_scene_contributes_where_it_overlaps() {
        let region = Region::rectangle(0.0, 0.0, 90.0, 90.0).unwrap();
        // one pixel east of the composite grid
        let shifted = Raster::new((3, 3), GeoTransform::north_up(30.0, 90.0, 30.0))
            .with_constant_band("red", Some(0.3))
            .unwrap()
            .with_constant_band("nir", Some(0.5))
            .unwrap()
            .with_time_start(Utc.with_ymd_and_hms(2021, 5, 9, 0, 0, 0).unwrap());
        let images = ImageCollection::new(vec![image(Some(0.1), Some(0.3), 2), shifted]);
        let out = compositor(region).composite(&images).unwrap();
        let red = out.band("red").unwrap();
        assert_eq!(red[[1, 0]], Some(0.1));
        assert_eq!(red[[1, 1]], Some(0.2));
        assert_eq!(red[[1, 2]], Some(0.2));
        assert_eq!(out.property("image_count").and_then(|p| p.as_f64()), Some(2.0));
    }

    #[test]
    fn test_rotated_scene_is_rejected() {
        let region = Region::rectangle(0.0, 0.0, 90.0, 90.0).unwrap();
        let mut rotated = image(Some(0.1), Some(0.2), 2);
        rotated.geo_transform.rotation_x = 0.5;
        let result = compositor(region).composite(&ImageCollection::new(vec![rotated]));
        assert!(matches!(result, Err(CanopyError::GridMismatch(_))));
    }
}
