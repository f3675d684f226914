use chrono::{DateTime, Utc};
use ndarray::Array2;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Per-pixel sample value (reflectance, index or biomass)
pub type Sample = f64;

/// A pixel value, `None` meaning "no data"
pub type Pixel = Option<Sample>;

/// 2D grid of pixel values for one band (rows x cols)
pub type BandGrid = Array2<Pixel>;

/// Per-pixel validity flags, `true` = keep
pub type QualityMask = Array2<bool>;

/// Satellite sensor generations understood by the selector and harmonizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorFamily {
    Landsat5,
    Landsat7,
    Landsat8,
    Landsat9,
    Sentinel2,
}

impl SensorFamily {
    /// Catalog identifier of the surface reflectance collection
    pub fn catalog_id(&self) -> &'static str {
        match self {
            SensorFamily::Landsat5 => "LANDSAT/LT05/C02/T1_L2",
            SensorFamily::Landsat7 => "LANDSAT/LE07/C02/T1_L2",
            SensorFamily::Landsat8 => "LANDSAT/LC08/C02/T1_L2",
            SensorFamily::Landsat9 => "LANDSAT/LC09/C02/T1_L2",
            SensorFamily::Sentinel2 => "COPERNICUS/S2_SR_HARMONIZED",
        }
    }

    pub fn is_landsat(&self) -> bool {
        !matches!(self, SensorFamily::Sentinel2)
    }
}

impl fmt::Display for SensorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorFamily::Landsat5 => write!(f, "Landsat 5"),
            SensorFamily::Landsat7 => write!(f, "Landsat 7"),
            SensorFamily::Landsat8 => write!(f, "Landsat 8"),
            SensorFamily::Landsat9 => write!(f, "Landsat 9"),
            SensorFamily::Sentinel2 => write!(f, "Sentinel-2"),
        }
    }
}

/// Axis-aligned bounding box in map coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels of `pixel_size` map units
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.pixel_corner(row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Map coordinates at fractional pixel position (row, col)
    pub fn pixel_corner(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    pub fn is_north_up(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0
    }

    /// Extent covered by a grid of `shape` (rows, cols)
    pub fn bounds(&self, shape: (usize, usize)) -> BoundingBox {
        let (rows, cols) = (shape.0 as f64, shape.1 as f64);
        let corners = [
            self.pixel_corner(0.0, 0.0),
            self.pixel_corner(0.0, cols),
            self.pixel_corner(rows, 0.0),
            self.pixel_corner(rows, cols),
        ];
        let mut bbox = BoundingBox {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            bbox.min_x = bbox.min_x.min(x);
            bbox.max_x = bbox.max_x.max(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }

    /// Equality within a relative tolerance, used to decide whether two rasters share a grid
    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0);
        close(self.top_left_x, other.top_left_x)
            && close(self.pixel_width, other.pixel_width)
            && close(self.rotation_x, other.rotation_x)
            && close(self.top_left_y, other.top_left_y)
            && close(self.rotation_y, other.rotation_y)
            && close(self.pixel_height, other.pixel_height)
    }
}

/// Grid a raster is produced on: transform plus (rows, cols)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputGrid {
    pub geo_transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

impl OutputGrid {
    pub fn new(geo_transform: GeoTransform, rows: usize, cols: usize) -> Self {
        Self { geo_transform, rows, cols }
    }

    /// North-up grid of `scale`-sized pixels covering `bbox`
    pub fn covering(bbox: &BoundingBox, scale: f64) -> CanopyResult<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CanopyError::InvalidConfig(format!(
                "Scale must be a positive number of metres, got {}",
                scale
            )));
        }
        let cols = ((bbox.width() / scale).ceil() as usize).max(1);
        let rows = ((bbox.height() / scale).ceil() as usize).max(1);
        Ok(Self {
            geo_transform: GeoTransform::north_up(bbox.min_x, bbox.max_y, scale),
            rows,
            cols,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of pixels, `None` when it does not fit in `usize`
    pub fn pixel_count(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    /// Raster on this grid with no bands
    pub fn empty_raster(&self) -> Raster {
        Raster::new(self.shape(), self.geo_transform)
    }

    /// Band grid on this grid filled with `value`
    pub fn filled(&self, value: Pixel) -> BandGrid {
        Array2::from_elem(self.shape(), value)
    }
}

/// Half-open UTC interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CanopyResult<Self> {
        if end <= start {
            return Err(CanopyError::InvalidConfig(format!(
                "Empty time window: {} .. {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Window between two calendar dates (midnight UTC)
    pub fn from_dates(start: chrono::NaiveDate, end: chrono::NaiveDate) -> CanopyResult<Self> {
        Self::new(date_to_utc(start), date_to_utc(end))
    }

    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        *instant >= self.start && *instant < self.end
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Midnight UTC of a calendar date
pub fn date_to_utc(date: chrono::NaiveDate) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(date.and_time(chrono::NaiveTime::MIN), Utc)
}

/// Calendar date for parameter defaults; out-of-range input collapses to `NaiveDate::MIN`
pub fn calendar_date(year: i32, month: u32, day: u32) -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(year, month, day).unwrap_or(chrono::NaiveDate::MIN)
}

/// Scene or asset metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(v) => Some(*v),
            PropertyValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Number(_) => None,
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Number(v as f64)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Number(v) => write!(f, "{}", v),
            PropertyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Multi-band raster with per-pixel no-data.
///
/// Bands are addressed by name and all share one grid. Every transform returns a
/// new raster; nothing is modified in place once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    bands: Vec<(String, BandGrid)>,
    shape: (usize, usize),
    pub geo_transform: GeoTransform,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Raster {
    /// Create a raster with no bands
    pub fn new(shape: (usize, usize), geo_transform: GeoTransform) -> Self {
        Self {
            bands: Vec::new(),
            shape,
            geo_transform,
            time_start: None,
            time_end: None,
            properties: BTreeMap::new(),
        }
    }

    /// Append a band, rejecting duplicate names and foreign shapes
    pub fn with_band(mut self, name: &str, grid: BandGrid) -> CanopyResult<Self> {
        if self.has_band(name) {
            return Err(CanopyError::SchemaMismatch(format!(
                "Band '{}' already exists",
                name
            )));
        }
        if grid.dim() != self.shape {
            return Err(CanopyError::GridMismatch(format!(
                "Band '{}' has shape {:?}, raster is {:?}",
                name,
                grid.dim(),
                self.shape
            )));
        }
        self.bands.push((name.to_string(), grid));
        Ok(self)
    }

    /// Append a band holding the same value everywhere
    pub fn with_constant_band(self, name: &str, value: Pixel) -> CanopyResult<Self> {
        let grid = Array2::from_elem(self.shape, value);
        self.with_band(name, grid)
    }

    pub fn with_time_start(mut self, instant: DateTime<Utc>) -> Self {
        self.time_start = Some(instant);
        self
    }

    pub fn with_time_span(mut self, span: &TimeSpan) -> Self {
        self.time_start = Some(span.start);
        self.time_end = Some(span.end);
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn pixel_count(&self) -> usize {
        self.shape.0 * self.shape.1
    }

    pub fn grid(&self) -> OutputGrid {
        OutputGrid::new(self.geo_transform, self.shape.0, self.shape.1)
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn band_set(&self) -> BTreeSet<String> {
        self.bands.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.iter().any(|(n, _)| n == name)
    }

    pub fn band(&self, name: &str) -> CanopyResult<&BandGrid> {
        self.bands
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, grid)| grid)
            .ok_or_else(|| CanopyError::MissingBand(name.to_string()))
    }

    pub fn bands(&self) -> impl Iterator<Item = (&str, &BandGrid)> {
        self.bands.iter().map(|(name, grid)| (name.as_str(), grid))
    }

    /// Number of pixels carrying a value in `band`
    pub fn valid_count(&self, band: &str) -> CanopyResult<usize> {
        Ok(self.band(band)?.iter().filter(|p| p.is_some()).count())
    }

    /// Whether `other` lives on the same grid
    pub fn same_grid(&self, other: &Raster) -> bool {
        self.shape == other.shape && self.geo_transform.approx_eq(&other.geo_transform)
    }

    /// Copy of this raster's metadata with no bands
    fn empty_like(&self) -> Raster {
        Raster {
            bands: Vec::new(),
            shape: self.shape,
            geo_transform: self.geo_transform,
            time_start: self.time_start,
            time_end: self.time_end,
            properties: self.properties.clone(),
        }
    }

    /// Keep the named bands in the given order
    pub fn select(&self, names: &[&str]) -> CanopyResult<Raster> {
        let pairs: Vec<(&str, &str)> = names.iter().map(|n| (*n, *n)).collect();
        self.select_renamed(&pairs)
    }

    /// Keep bands `(from, to)`, renaming `from` to `to`
    pub fn select_renamed(&self, mapping: &[(&str, &str)]) -> CanopyResult<Raster> {
        let mut out = self.empty_like();
        for (from, to) in mapping {
            out = out.with_band(to, self.band(from)?.clone())?;
        }
        Ok(out)
    }

    /// Keep every band whose name matches `pattern`
    pub fn select_matching(&self, pattern: &Regex) -> Raster {
        let mut out = self.empty_like();
        out.bands = self
            .bands
            .iter()
            .filter(|(name, _)| pattern.is_match(name))
            .cloned()
            .collect();
        out
    }

    /// Rename a single band, keeping its position
    pub fn rename_band(&self, from: &str, to: &str) -> CanopyResult<Raster> {
        self.band(from)?;
        if from != to && self.has_band(to) {
            return Err(CanopyError::SchemaMismatch(format!(
                "Cannot rename '{}' to existing band '{}'",
                from, to
            )));
        }
        let mut out = self.clone();
        for (name, _) in out.bands.iter_mut() {
            if name == from {
                *name = to.to_string();
            }
        }
        Ok(out)
    }

    /// Add the bands of `other`. With `overwrite`, same-named bands are replaced in place.
    pub fn add_bands(&self, other: &Raster, overwrite: bool) -> CanopyResult<Raster> {
        if !self.same_grid(other) {
            return Err(CanopyError::GridMismatch(format!(
                "Cannot add bands on grid {:?} to raster on grid {:?}",
                other.shape, self.shape
            )));
        }
        let mut out = self.clone();
        for (name, grid) in &other.bands {
            match out.bands.iter_mut().find(|(n, _)| n == name) {
                Some(slot) if overwrite => slot.1 = grid.clone(),
                Some(_) => {
                    return Err(CanopyError::SchemaMismatch(format!(
                        "Band '{}' already exists",
                        name
                    )))
                }
                None => out.bands.push((name.clone(), grid.clone())),
            }
        }
        Ok(out)
    }

    /// Apply a per-pixel function to every band
    pub fn map_values<F>(&self, f: F) -> Raster
    where
        F: Fn(Sample) -> Sample,
    {
        let mut out = self.empty_like();
        out.bands = self
            .bands
            .iter()
            .map(|(name, grid)| (name.clone(), grid.mapv(|p| p.map(&f))))
            .collect();
        out
    }

    /// Intersect with `mask`: pixels where the mask is false become no-data in every band
    pub fn update_mask(&self, mask: &QualityMask) -> CanopyResult<Raster> {
        if mask.dim() != self.shape {
            return Err(CanopyError::GridMismatch(format!(
                "Mask shape {:?} does not match raster {:?}",
                mask.dim(),
                self.shape
            )));
        }
        let mut out = self.empty_like();
        out.bands = self
            .bands
            .iter()
            .map(|(name, grid)| {
                let masked = ndarray::Zip::from(grid)
                    .and(mask)
                    .map_collect(|&p, &keep| if keep { p } else { None });
                (name.clone(), masked)
            })
            .collect();
        Ok(out)
    }

    /// Copy time span and properties from `source`
    pub fn copy_metadata_from(mut self, source: &Raster) -> Raster {
        self.time_start = source.time_start;
        self.time_end = source.time_end;
        self.properties = source.properties.clone();
        self
    }
}

/// Value of one table cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Int(i64),
    Float(f64),
    Empty,
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Empty => Ok(()),
        }
    }
}

/// Tabular export payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> CanopyResult<()> {
        if row.len() != self.columns.len() {
            return Err(CanopyError::SchemaMismatch(format!(
                "Row has {} cells, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Error types for compositing and biomass processing
#[derive(Debug, thiserror::Error)]
pub enum CanopyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Band not found: {0}")]
    MissingBand(String),

    #[error("Band schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Asset not found: {0}")]
    MissingAsset(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for canopy operations
pub type CanopyResult<T> = Result<T, CanopyError>;
