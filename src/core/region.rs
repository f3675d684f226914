use crate::types::{BoundingBox, CanopyError, CanopyResult, GeoTransform, QualityMask, Raster};
use geo::{Area, BoundingRect, Contains, Coord, Intersects, LineString, Point, Polygon, Rect};
use ndarray::Array2;
use serde::Deserialize;

/// Region of interest: a simple polygon in map coordinates.
///
/// Shared read-only by every stage (wrap it in an `Arc`). Pixels belong to the
/// region when their centre lies inside the exterior ring.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    polygon: Polygon<f64>,
    bbox: BoundingBox,
}

#[derive(Deserialize)]
struct GeoJsonGeometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: serde_json::Value,
}

impl Region {
    /// Build a region from its exterior ring. The ring is closed if needed.
    pub fn new(exterior: Vec<(f64, f64)>) -> CanopyResult<Self> {
        let mut distinct = exterior.clone();
        if distinct.len() > 1 && distinct.first() == distinct.last() {
            distinct.pop();
        }
        if distinct.len() < 3 {
            return Err(CanopyError::InvalidGeometry(format!(
                "Polygon needs at least 3 vertices, got {}",
                distinct.len()
            )));
        }
        if distinct.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(CanopyError::InvalidGeometry(
                "Polygon has non-finite coordinates".to_string(),
            ));
        }

        let polygon = Polygon::new(LineString::from(distinct), vec![]);
        if polygon.unsigned_area() <= 0.0 {
            return Err(CanopyError::InvalidGeometry("Polygon has zero area".to_string()));
        }
        let rect = polygon
            .bounding_rect()
            .ok_or_else(|| CanopyError::InvalidGeometry("Polygon has no extent".to_string()))?;
        let bbox = BoundingBox {
            min_x: rect.min().x,
            max_x: rect.max().x,
            min_y: rect.min().y,
            max_y: rect.max().y,
        };
        Ok(Self { polygon, bbox })
    }

    /// Axis-aligned rectangle
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> CanopyResult<Self> {
        Self::new(vec![(min_x, min_y), (max_x, min_y), (max_x, max_y), (min_x, max_y)])
    }

    /// Parse a GeoJSON `Polygon` geometry (or a `Feature` wrapping one). Holes are ignored.
    pub fn from_geojson_str(json: &str) -> CanopyResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let geometry = match value.get("geometry") {
            Some(inner) => inner.clone(),
            None => value,
        };
        let geometry: GeoJsonGeometry = serde_json::from_value(geometry)?;
        if geometry.kind != "Polygon" {
            return Err(CanopyError::InvalidGeometry(format!(
                "Expected a Polygon geometry, got {}",
                geometry.kind
            )));
        }
        let rings: Vec<Vec<Vec<f64>>> = serde_json::from_value(geometry.coordinates)?;
        let exterior = rings
            .into_iter()
            .next()
            .ok_or_else(|| CanopyError::InvalidGeometry("Polygon has no rings".to_string()))?;
        let vertices = exterior
            .into_iter()
            .map(|pos| match pos.as_slice() {
                [x, y, ..] => Ok((*x, *y)),
                _ => Err(CanopyError::InvalidGeometry(
                    "Position needs two coordinates".to_string(),
                )),
            })
            .collect::<CanopyResult<Vec<_>>>()?;
        Self::new(vertices)
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    /// Exterior ring without its closing vertex
    pub fn vertices(&self) -> Vec<(f64, f64)> {
        let ring = &self.polygon.exterior().0;
        ring[..ring.len().saturating_sub(1)].iter().map(|c| (c.x, c.y)).collect()
    }

    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.bbox
    }

    /// Whether the point lies in the interior of the polygon
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygon.contains(&Point::new(x, y))
    }

    /// Whether the polygon and the box share any area or boundary
    pub fn intersects_box(&self, bbox: &BoundingBox) -> bool {
        if !self.bbox.intersects(bbox) {
            return false;
        }
        let rect = Rect::new(
            Coord { x: bbox.min_x, y: bbox.min_y },
            Coord { x: bbox.max_x, y: bbox.max_y },
        );
        self.polygon.intersects(&rect)
    }

    /// Mask of pixels whose centre lies inside the region
    pub fn mask_for(&self, geo_transform: &GeoTransform, shape: (usize, usize)) -> QualityMask {
        Array2::from_shape_fn(shape, |(row, col)| {
            let (x, y) = geo_transform.pixel_center(row, col);
            self.bbox.contains(x, y) && self.contains(x, y)
        })
    }

    /// Pixels outside the region become no-data
    pub fn clip(&self, raster: &Raster) -> CanopyResult<Raster> {
        let mask = self.mask_for(&raster.geo_transform, raster.shape());
        log::debug!(
            "Clipping {}x{} raster to region: {} pixels inside",
            raster.shape().0,
            raster.shape().1,
            mask.iter().filter(|&&inside| inside).count()
        );
        raster.update_mask(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Region {
        Region::new(vec![(0.0, 0.0), (100.0, 0.0), (0.0, 100.0), (0.0, 0.0)]).unwrap()
    }

    #[test]
    fn test_rejects_degenerate_polygons() {
        assert!(Region::new(vec![(0.0, 0.0), (1.0, 1.0)]).is_err());
        assert!(Region::new(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]).is_err());
    }

    #[test]
    fn test_contains_and_area() {
        let region = triangle();
        assert_eq!(region.vertices().len(), 3);
        assert!((region.area() - 5000.0).abs() < 1e-9);
        assert!(region.contains(10.0, 10.0));
        assert!(!region.contains(80.0, 80.0));
        assert_eq!(region.polygon().exterior().0.len(), 4);
    }

    #[test]
    fn test_intersects_box() {
        let region = triangle();
        let overlapping = BoundingBox { min_x: 40.0, max_x: 200.0, min_y: 40.0, max_y: 200.0 };
        let beyond_hypotenuse = BoundingBox { min_x: 60.0, max_x: 200.0, min_y: 60.0, max_y: 200.0 };
        let enclosing = BoundingBox { min_x: -10.0, max_x: 500.0, min_y: -10.0, max_y: 500.0 };
        assert!(region.intersects_box(&overlapping));
        assert!(!region.intersects_box(&beyond_hypotenuse));
        assert!(region.intersects_box(&enclosing));
    }

    #[test]
    fn test_clip_uses_pixel_centres() {
        let region = Region::rectangle(0.0, 0.0, 20.0, 20.0).unwrap();
        let raster = Raster::new((2, 2), GeoTransform::north_up(0.0, 20.0, 15.0))
            .with_constant_band("nir", Some(0.4))
            .unwrap();
        let clipped = region.clip(&raster).unwrap();
        let nir = clipped.band("nir").unwrap();
        assert_eq!(nir[[0, 0]], Some(0.4));
        // centre (22.5, 12.5) lies outside the rectangle
        assert_eq!(nir[[0, 1]], None);
        assert_eq!(nir[[1, 1]], None);
    }

    #[test]
    fn test_geojson_polygon() {
        let json = r#"{
            "type": "Feature",
            "properties": {"name": "bbox_wirong"},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[0, 0], [30, 0], [30, 30], [0, 30], [0, 0]]]
            }
        }"#;
        let region = Region::from_geojson_str(json).unwrap();
        assert_eq!(region.vertices().len(), 4);
        assert!((region.area() - 900.0).abs() < 1e-9);

        let point = r#"{"type": "Point", "coordinates": [1, 2]}"#;
        assert!(matches!(
            Region::from_geojson_str(point),
            Err(CanopyError::InvalidGeometry(_))
        ));
    }
}
