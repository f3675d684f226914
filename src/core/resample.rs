use crate::types::{BandGrid, CanopyError, CanopyResult, GeoTransform, OutputGrid, Pixel, Raster};
use ndarray::Array2;

/// How source pixels are combined onto a target grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Source pixel containing the target centre (categorical data)
    Nearest,
    /// Mean of the valid source pixels whose centres fall in the target pixel,
    /// falling back to nearest when the target is finer than the source
    Mean,
}

/// Fractional (row, col) of a map coordinate in a north-up grid
fn fractional_index(gt: &GeoTransform, x: f64, y: f64) -> (f64, f64) {
    ((y - gt.top_left_y) / gt.pixel_height, (x - gt.top_left_x) / gt.pixel_width)
}

fn nearest_value(grid: &BandGrid, gt: &GeoTransform, x: f64, y: f64) -> Pixel {
    let (rows, cols) = grid.dim();
    let (row, col) = fractional_index(gt, x, y);
    if row < 0.0 || col < 0.0 {
        return None;
    }
    let (row, col) = (row.floor() as usize, col.floor() as usize);
    if row >= rows || col >= cols {
        return None;
    }
    grid[[row, col]]
}

/// Source indices whose pixel centre lies in `[lo, hi)` (fractional coordinates)
fn centre_range(lo: f64, hi: f64, len: usize) -> std::ops::Range<usize> {
    const EPS: f64 = 1e-9;
    let first = (lo - 0.5 - EPS).ceil().max(0.0) as usize;
    let last = ((hi - 0.5 - EPS).ceil().max(0.0) as usize).min(len);
    first..last.max(first)
}

fn resample_band(
    grid: &BandGrid,
    source: &GeoTransform,
    target: &OutputGrid,
    method: Resampling,
) -> BandGrid {
    let (rows, cols) = grid.dim();
    let gt = target.geo_transform;
    Array2::from_shape_fn(target.shape(), |(row, col)| {
        let (cx, cy) = gt.pixel_center(row, col);
        match method {
            Resampling::Nearest => nearest_value(grid, source, cx, cy),
            Resampling::Mean => {
                let (x0, y0) = gt.pixel_corner(row as f64, col as f64);
                let (x1, y1) = gt.pixel_corner(row as f64 + 1.0, col as f64 + 1.0);
                let (r0, c0) = fractional_index(source, x0, y0);
                let (r1, c1) = fractional_index(source, x1, y1);
                let row_range = centre_range(r0.min(r1), r0.max(r1), rows);
                let col_range = centre_range(c0.min(c1), c0.max(c1), cols);
                if row_range.is_empty() || col_range.is_empty() {
                    return nearest_value(grid, source, cx, cy);
                }
                let mut sum = 0.0;
                let mut count = 0usize;
                for r in row_range {
                    for c in col_range.clone() {
                        if let Some(v) = grid[[r, c]] {
                            sum += v;
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    Some(sum / count as f64)
                } else {
                    None
                }
            }
        }
    })
}

/// Resample every band of `raster` onto `target`. Both grids must be north-up.
///
/// Pixels of the target that fall outside the source become no-data.
/// Metadata is carried over unchanged.
pub fn resample(raster: &Raster, target: &OutputGrid, method: Resampling) -> CanopyResult<Raster> {
    if raster.shape() == target.shape() && raster.geo_transform.approx_eq(&target.geo_transform) {
        return Ok(raster.clone());
    }
    if !raster.geo_transform.is_north_up() || !target.geo_transform.is_north_up() {
        return Err(CanopyError::GridMismatch(
            "Resampling requires north-up grids".to_string(),
        ));
    }
    log::debug!(
        "Resampling {:?} raster ({} m) onto {:?} grid ({} m) with {:?}",
        raster.shape(),
        raster.geo_transform.pixel_width,
        target.shape(),
        target.geo_transform.pixel_width,
        method
    );

    let mut out = target.empty_raster();
    for (name, grid) in raster.bands() {
        out = out.with_band(name, resample_band(grid, &raster.geo_transform, target, method))?;
    }
    Ok(out.copy_metadata_from(raster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn source() -> Raster {
        // 4x4 at 30 m, values = row * 4 + col, one hole
        let mut values = Array2::from_shape_fn((4, 4), |(r, c)| Some((r * 4 + c) as f64));
        values[[0, 1]] = None;
        Raster::new((4, 4), GeoTransform::north_up(0.0, 120.0, 30.0))
            .with_band("NDVI", values)
            .unwrap()
            .with_property("year", 2019)
    }

    #[test]
    fn test_identity_is_a_copy() {
        let raster = source();
        let out = resample(&raster, &raster.grid(), Resampling::Mean).unwrap();
        assert_eq!(out, raster);
    }

    #[test]
    fn test_mean_aggregates_blocks() {
        let target = OutputGrid::new(GeoTransform::north_up(0.0, 120.0, 60.0), 2, 2);
        let out = resample(&source(), &target, Resampling::Mean).unwrap();
        let ndvi = out.band("NDVI").unwrap();
        // block {0, hole, 4, 5} averages the three valid pixels
        assert_eq!(ndvi[[0, 0]], Some(3.0));
        assert_eq!(ndvi[[1, 1]], Some((10.0 + 11.0 + 14.0 + 15.0) / 4.0));
        assert_eq!(out.property("year"), source().property("year"));
    }

    #[test]
    fn test_nearest_and_outside() {
        let target = OutputGrid::new(GeoTransform::north_up(-10.0, 120.0, 30.0), 1, 5);
        let out = resample(&source(), &target, Resampling::Nearest).unwrap();
        let ndvi = out.band("NDVI").unwrap();
        assert_eq!(ndvi, &array![[Some(0.0), None, Some(2.0), Some(3.0), None]]);
    }

    #[test]
    fn test_finer_target_falls_back_to_nearest() {
        let target = OutputGrid::new(GeoTransform::north_up(0.0, 120.0, 10.0), 3, 3);
        let out = resample(&source(), &target, Resampling::Mean).unwrap();
        assert!(out.band("NDVI").unwrap().iter().all(|p| *p == Some(0.0)));
    }
}
