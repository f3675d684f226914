//! Model versus reference biomass comparison: stacking, seeded pixel sampling
//! and summary statistics of the sampled pairs.

use crate::core::indices::AGB_MGHA_BAND;
use crate::core::region::Region;
use crate::core::resample::{resample, Resampling};
use crate::types::{CanopyError, CanopyResult, Cell, OutputGrid, Raster, Table};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Band name of the model estimate in a comparison stack
pub const MODEL_BAND: &str = "Model_AGB";

/// Band name of the reference estimate in a comparison stack
pub const REFERENCE_BAND: &str = "CCI_AGB";

/// Band carrying biomass in the reference dataset
pub const REFERENCE_SOURCE_BAND: &str = "AGB";

/// Random pixel sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Number of pixels drawn (fewer when the region has fewer valid pixels)
    pub num_pixels: usize,
    pub seed: u64,
    /// Sampling grid resolution in metres
    pub scale: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            num_pixels: 1000,
            seed: 42,
            scale: 100.0,
        }
    }
}

/// Rename `AGB_MgHa` / `AGB` to `Model_AGB` / `CCI_AGB` and stack them on the model grid.
///
/// A reference on a different grid is averaged onto the model grid first.
pub fn stack_for_comparison(model: &Raster, reference: &Raster) -> CanopyResult<Raster> {
    let model = model.select_renamed(&[(AGB_MGHA_BAND, MODEL_BAND)])?;
    let reference = resample(
        &reference.select_renamed(&[(REFERENCE_SOURCE_BAND, REFERENCE_BAND)])?,
        &model.grid(),
        Resampling::Mean,
    )?;
    model.add_bands(&reference, false)
}

/// Single-band difference `model - reference`, no-data where either is missing
pub fn difference(model: &Raster, reference: &Raster, output: &str) -> CanopyResult<Raster> {
    for (label, raster) in [("model", model), ("reference", reference)] {
        if raster.band_count() != 1 {
            return Err(CanopyError::SchemaMismatch(format!(
                "Difference needs a single-band {} raster, got bands {:?}",
                label,
                raster.band_names()
            )));
        }
    }
    let reference = resample(reference, &model.grid(), Resampling::Mean)?;
    let (_, a) = model
        .bands()
        .next()
        .ok_or_else(|| CanopyError::MissingBand("model".to_string()))?;
    let (_, b) = reference
        .bands()
        .next()
        .ok_or_else(|| CanopyError::MissingBand("reference".to_string()))?;
    let diff = ndarray::Zip::from(a).and(b).map_collect(|&m, &r| Some(m? - r?));
    Ok(Raster::new(model.shape(), model.geo_transform)
        .with_band(output, diff)?
        .copy_metadata_from(model))
}

/// One sampled pixel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Row-major pixel index in the sampling grid
    pub pixel_id: usize,
    /// Pixel centre in map coordinates
    pub x: f64,
    pub y: f64,
    pub model: f64,
    pub reference: f64,
}

/// Sampled model/reference pairs, ordered by pixel index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    pub points: Vec<SamplePoint>,
}

impl SampleSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Values of `Model_AGB` or `CCI_AGB`
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        match name {
            MODEL_BAND => Some(self.points.iter().map(|p| p.model).collect()),
            REFERENCE_BAND => Some(self.points.iter().map(|p| p.reference).collect()),
            _ => None,
        }
    }

    /// `pixel_id, x, y, Model_AGB, CCI_AGB`
    pub fn to_table(&self) -> Table {
        let mut table = Table::new(
            ["pixel_id", "x", "y", MODEL_BAND, REFERENCE_BAND]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        );
        table.rows = self
            .points
            .iter()
            .map(|p| {
                vec![
                    Cell::Int(p.pixel_id as i64),
                    Cell::Float(p.x),
                    Cell::Float(p.y),
                    Cell::Float(p.model),
                    Cell::Float(p.reference),
                ]
            })
            .collect();
        table
    }
}

/// Draw up to `num_pixels` pixels of `stack` inside `region` where both bands
/// carry a value. The draw is without replacement and reproducible for a seed.
pub fn sample_pixels(stack: &Raster, region: &Region, params: &SamplingParams) -> CanopyResult<SampleSet> {
    let grid = if (stack.geo_transform.pixel_width - params.scale).abs() > 1e-9 {
        OutputGrid::covering(&region.bounding_box(), params.scale)?
    } else {
        stack.grid()
    };
    let stack = resample(stack, &grid, Resampling::Mean)?;
    let model = stack.band(MODEL_BAND)?;
    let reference = stack.band(REFERENCE_BAND)?;
    let inside = region.mask_for(&stack.geo_transform, stack.shape());
    let cols = stack.shape().1;

    let mut candidates: Vec<(usize, f64, f64)> = Vec::new();
    for ((row, col), m) in model.indexed_iter() {
        if let (true, Some(m), Some(r)) = (inside[[row, col]], *m, reference[[row, col]]) {
            candidates.push((row * cols + col, m, r));
        }
    }

    let amount = params.num_pixels.min(candidates.len());
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut picked = rand::seq::index::sample(&mut rng, candidates.len(), amount).into_vec();
    picked.sort_unstable();

    let points = picked
        .into_iter()
        .map(|i| {
            let (pixel_id, model, reference) = candidates[i];
            let (x, y) = stack.geo_transform.pixel_center(pixel_id / cols, pixel_id % cols);
            SamplePoint { pixel_id, x, y, model, reference }
        })
        .collect::<Vec<_>>();

    log::info!(
        "Sampled {} of {} candidate pixels (seed {})",
        points.len(),
        candidates.len(),
        params.seed
    );
    if points.len() < params.num_pixels {
        log::warn!(
            "Requested {} samples but only {} valid pixels in region",
            params.num_pixels,
            points.len()
        );
    }
    Ok(SampleSet { points })
}

/// Least-squares fit of reference against model plus agreement measures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonStats {
    pub n: usize,
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    /// Mean of model - reference
    pub mean_bias: f64,
    pub rmse: f64,
}

impl ComparisonStats {
    /// `None` with fewer than two samples or constant model values
    pub fn from_samples(samples: &SampleSet) -> Option<Self> {
        let n = samples.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let mean_x = samples.points.iter().map(|p| p.model).sum::<f64>() / nf;
        let mean_y = samples.points.iter().map(|p| p.reference).sum::<f64>() / nf;

        let (mut sxx, mut sxy, mut syy, mut bias, mut sq) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for p in &samples.points {
            let (dx, dy) = (p.model - mean_x, p.reference - mean_y);
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
            let err = p.model - p.reference;
            bias += err;
            sq += err * err;
        }
        if sxx == 0.0 {
            return None;
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };
        Some(Self {
            n,
            slope,
            intercept,
            r_squared,
            mean_bias: bias / nf,
            rmse: (sq / nf).sqrt(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn model(rows: usize, cols: usize) -> Raster {
        let values = Array2::from_shape_fn((rows, cols), |(r, c)| Some((r * cols + c) as f64));
        Raster::new((rows, cols), GeoTransform::north_up(0.0, rows as f64 * 100.0, 100.0))
            .with_band(AGB_MGHA_BAND, values)
            .unwrap()
    }

    fn reference(rows: usize, cols: usize) -> Raster {
        let values = Array2::from_shape_fn((rows, cols), |(r, c)| {
            if (r + c) % 7 == 0 {
                None
            } else {
                Some(2.0 * (r * cols + c) as f64 + 1.0)
            }
        });
        Raster::new((rows, cols), GeoTransform::north_up(0.0, rows as f64 * 100.0, 100.0))
            .with_band(REFERENCE_SOURCE_BAND, values)
            .unwrap()
    }

    #[test]
    fn test_stack_renames() {
        let stack = stack_for_comparison(&model(3, 3), &reference(3, 3)).unwrap();
        assert_eq!(stack.band_names(), vec![MODEL_BAND, REFERENCE_BAND]);
        assert!(stack_for_comparison(&reference(3, 3), &model(3, 3)).is_err());
    }

    #[test]
    fn test_sampling_is_reproducible_and_valid() {
        let stack = stack_for_comparison(&model(40, 40), &reference(40, 40)).unwrap();
        let region = Region::rectangle(0.0, 0.0, 4000.0, 4000.0).unwrap();
        let params = SamplingParams::default();

        let first = sample_pixels(&stack, &region, &params).unwrap();
        let second = sample_pixels(&stack, &region, &params).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1000);
        assert!(first.points.windows(2).all(|w| w[0].pixel_id < w[1].pixel_id));
        assert!(first.points.iter().all(|p| p.reference == 2.0 * p.model + 1.0));

        let other = sample_pixels(&stack, &region, &SamplingParams { seed: 7, ..params }).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_sampling_caps_at_available_pixels() {
        let stack = stack_for_comparison(&model(5, 5), &reference(5, 5)).unwrap();
        // covers the left two columns only
        let region = Region::rectangle(0.0, 0.0, 200.0, 500.0).unwrap();
        let samples = sample_pixels(&stack, &region, &SamplingParams::default()).unwrap();
        let valid_in_region = (0..5)
            .flat_map(|r| (0..2).map(move |c| (r, c)))
            .filter(|(r, c)| (r + c) % 7 != 0)
            .count();
        assert_eq!(samples.len(), valid_in_region);
        assert!(samples.points.iter().all(|p| p.x < 200.0));
    }

    #[test]
    fn test_table_and_stats() {
        let stack = stack_for_comparison(&model(10, 10), &reference(10, 10)).unwrap();
        let region = Region::rectangle(0.0, 0.0, 1000.0, 1000.0).unwrap();
        let samples = sample_pixels(&stack, &region, &SamplingParams { num_pixels: 20, ..Default::default() }).unwrap();

        let table = samples.to_table();
        assert_eq!(table.columns, vec!["pixel_id", "x", "y", "Model_AGB", "CCI_AGB"]);
        assert_eq!(table.len(), 20);

        let stats = ComparisonStats::from_samples(&samples).unwrap();
        assert_eq!(stats.n, 20);
        assert_relative_eq!(stats.slope, 2.0, epsilon = 1e-9);
        assert_relative_eq!(stats.intercept, 1.0, epsilon = 1e-9);
        assert_relative_eq!(stats.r_squared, 1.0, epsilon = 1e-9);
        let model = samples.column(MODEL_BAND).unwrap();
        let expected_bias = model.iter().map(|m| -(m + 1.0)).sum::<f64>() / 20.0;
        assert_relative_eq!(stats.mean_bias, expected_bias, epsilon = 1e-9);
    }

    #[test]
    fn test_stats_need_spread() {
        assert!(ComparisonStats::from_samples(&SampleSet::default()).is_none());
        let flat = SampleSet {
            points: vec![
                SamplePoint { pixel_id: 0, x: 0.0, y: 0.0, model: 5.0, reference: 1.0 },
                SamplePoint { pixel_id: 1, x: 1.0, y: 0.0, model: 5.0, reference: 3.0 },
            ],
        };
        assert!(ComparisonStats::from_samples(&flat).is_none());
    }

    #[test]
    fn test_difference() {
        let m = model(2, 2);
        let r = reference(2, 2);
        let diff = difference(&m, &r, "Difference").unwrap();
        let values = diff.band("Difference").unwrap();
        assert_eq!(values[[0, 0]], None);
        assert_eq!(values[[0, 1]], Some(1.0 - 3.0));
        let stack = stack_for_comparison(&m, &r).unwrap();
        assert!(matches!(
            difference(&stack, &r, "Difference"),
            Err(CanopyError::SchemaMismatch(_))
        ));
    }
}
