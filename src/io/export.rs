//! Export tasks and sinks.
//!
//! Rasters are written as one GeoTIFF per band plus a `metadata.json`
//! sidecar carrying the band order, grid, time span (milliseconds since epoch)
//! and properties. Tables are written as CSV.

use crate::core::region::Region;
use crate::core::resample::{resample, Resampling};
use crate::graph::NodeId;
use crate::types::{BandGrid, CanopyError, CanopyResult, GeoTransform, OutputGrid, PropertyValue, Raster, Table};
use chrono::{TimeZone, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::Gray64Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

/// Default ceiling on the number of exported pixels
pub const DEFAULT_MAX_PIXELS: f64 = 1e13;

const METADATA_FILE: &str = "metadata.json";

const MODEL_PIXEL_SCALE_TAG: u16 = 33550;
const MODEL_TIEPOINT_TAG: u16 = 33922;
const GEO_KEY_DIRECTORY_TAG: u16 = 34735;

/// Persist one raster node as an asset
#[derive(Debug, Clone)]
pub struct ImageExport {
    pub description: String,
    pub asset_id: String,
    pub node: NodeId,
    pub region: Arc<Region>,
    /// Output pixel size in metres
    pub scale: f64,
    pub max_pixels: f64,
}

/// Persist one sample-set node as a CSV table
#[derive(Debug, Clone)]
pub struct TableExport {
    pub description: String,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub enum ExportTask {
    Image(ImageExport),
    Table(TableExport),
}

impl ExportTask {
    pub fn description(&self) -> &str {
        match self {
            ExportTask::Image(export) => &export.description,
            ExportTask::Table(export) => &export.description,
        }
    }
}

/// Outcome of a finished export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub id: String,
    pub location: String,
    /// Pixels per band for images, rows for tables
    pub records: usize,
}

/// Destination of export tasks
pub trait ExportSink: Send + Sync {
    fn write_image(&self, asset_id: &str, image: &Raster) -> CanopyResult<ExportReceipt>;
    fn write_table(&self, description: &str, table: &Table) -> CanopyResult<ExportReceipt>;
}

/// Clip to the region, resample onto the region grid at `scale` and clip again.
/// Fails when the output grid would exceed `max_pixels`.
pub fn prepare_image(raster: &Raster, region: &Region, scale: f64, max_pixels: f64) -> CanopyResult<Raster> {
    let target = OutputGrid::covering(&region.bounding_box(), scale)?;
    let within = match target.pixel_count() {
        Some(count) => max_pixels > 0.0 && count as f64 <= max_pixels,
        None => false,
    };
    if !within {
        return Err(CanopyError::Export(format!(
            "Export of {}x{} pixels exceeds max_pixels {}",
            target.rows, target.cols, max_pixels
        )));
    }
    let clipped = region.clip(raster)?;
    let resampled = resample(&clipped, &target, Resampling::Mean)?;
    log::debug!(
        "Prepared export at {} m: {:?} -> {:?}",
        scale,
        raster.shape(),
        target.shape()
    );
    region.clip(&resampled)
}

/// Keeps exports in memory, keyed by asset id / description
#[derive(Debug, Default)]
pub struct MemorySink {
    images: Mutex<BTreeMap<String, Raster>>,
    tables: Mutex<BTreeMap<String, Table>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, asset_id: &str) -> Option<Raster> {
        self.images.lock().ok()?.get(asset_id).cloned()
    }

    pub fn table(&self, description: &str) -> Option<Table> {
        self.tables.lock().ok()?.get(description).cloned()
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.images
            .lock()
            .map(|images| images.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl ExportSink for MemorySink {
    fn write_image(&self, asset_id: &str, image: &Raster) -> CanopyResult<ExportReceipt> {
        self.images
            .lock()
            .map_err(|_| CanopyError::Export("Image store poisoned".to_string()))?
            .insert(asset_id.to_string(), image.clone());
        Ok(ExportReceipt {
            id: asset_id.to_string(),
            location: format!("memory://{}", asset_id),
            records: image.pixel_count(),
        })
    }

    fn write_table(&self, description: &str, table: &Table) -> CanopyResult<ExportReceipt> {
        self.tables
            .lock()
            .map_err(|_| CanopyError::Export("Table store poisoned".to_string()))?
            .insert(description.to_string(), table.clone());
        Ok(ExportReceipt {
            id: description.to_string(),
            location: format!("memory://{}", description),
            records: table.len(),
        })
    }
}

/// Sidecar describing an exported raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub bands: Vec<String>,
    pub rows: usize,
    pub cols: usize,
    pub geo_transform: GeoTransform,
    /// Milliseconds since the Unix epoch
    pub time_start: Option<i64>,
    pub time_end: Option<i64>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

fn check_segment(segment: &str, id: &str) -> CanopyResult<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        return Err(CanopyError::Export(format!("Invalid path segment '{}' in '{}'", segment, id)));
    }
    Ok(())
}

/// Directory of asset `id` under `root`. Ids are `/`-separated and may not escape the root.
pub fn asset_path(root: &Path, id: &str) -> CanopyResult<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in id.split('/') {
        check_segment(segment, id)?;
        path.push(segment);
    }
    Ok(path)
}

fn band_file(dir: &Path, band: &str) -> CanopyResult<PathBuf> {
    if band.is_empty() || !band.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CanopyError::Export(format!("Band name '{}' is not usable as a file name", band)));
    }
    Ok(dir.join(format!("{}.tif", band)))
}

/// Write one band as a 64-bit float GeoTIFF. No-data is stored as NaN.
pub fn write_geotiff(path: &Path, grid: &BandGrid, gt: &GeoTransform) -> CanopyResult<()> {
    if !gt.is_north_up() {
        return Err(CanopyError::Export("GeoTIFF export needs a north-up grid".to_string()));
    }
    let (rows, cols) = grid.dim();
    let data: Vec<f64> = grid.iter().map(|p| p.unwrap_or(f64::NAN)).collect();

    let file = fs::File::create(path)?;
    let mut encoder =
        TiffEncoder::new(file).map_err(|e| CanopyError::Export(format!("TIFF encoder error: {}", e)))?;
    let mut image = encoder
        .new_image::<Gray64Float>(cols as u32, rows as u32)
        .map_err(|e| CanopyError::Export(format!("Cannot create TIFF image: {}", e)))?;

    let scale = [gt.pixel_width, gt.pixel_height.abs(), 0.0];
    image
        .encoder()
        .write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE_TAG), &scale[..])
        .map_err(|e| CanopyError::Export(format!("Cannot write scale tag: {}", e)))?;
    let tiepoint = [0.0, 0.0, 0.0, gt.top_left_x, gt.top_left_y, 0.0];
    image
        .encoder()
        .write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT_TAG), &tiepoint[..])
        .map_err(|e| CanopyError::Export(format!("Cannot write tiepoint tag: {}", e)))?;
    // version 1.1.0, projected model, pixel-is-area
    let geokeys: [u16; 12] = [1, 1, 0, 2, 1024, 0, 1, 1, 1025, 0, 1, 1];
    image
        .encoder()
        .write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY_TAG), &geokeys[..])
        .map_err(|e| CanopyError::Export(format!("Cannot write geokey tag: {}", e)))?;

    image
        .write_data(&data)
        .map_err(|e| CanopyError::Export(format!("Cannot write image data: {}", e)))?;
    Ok(())
}

/// Read a band written by [`write_geotiff`] together with its geotransform
pub fn read_geotiff(path: &Path) -> CanopyResult<(BandGrid, GeoTransform)> {
    let mut decoder = Decoder::new(BufReader::new(fs::File::open(path)?))
        .map_err(|e| CanopyError::GridMismatch(format!("TIFF decode error in {}: {}", path.display(), e)))?;
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| CanopyError::GridMismatch(format!("Cannot read dimensions: {}", e)))?;
    let shape = (height as usize, width as usize);

    let values: Vec<f64> = match decoder
        .read_image()
        .map_err(|e| CanopyError::GridMismatch(format!("Cannot read image data: {}", e)))?
    {
        DecodingResult::F64(buf) => buf,
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        _ => {
            return Err(CanopyError::GridMismatch(format!(
                "{} is not a floating point raster",
                path.display()
            )))
        }
    };
    let grid = Array2::from_shape_vec(shape, values.into_iter().map(|v| v.is_finite().then_some(v)).collect())
        .map_err(|e| CanopyError::GridMismatch(format!("{} does not hold a {:?} grid: {}", path.display(), shape, e)))?;

    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE_TAG))
        .map_err(|_| CanopyError::GridMismatch(format!("{} has no pixel scale tag", path.display())))?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT_TAG))
        .map_err(|_| CanopyError::GridMismatch(format!("{} has no tiepoint tag", path.display())))?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(CanopyError::GridMismatch(format!(
            "Cannot determine geotransform of {}",
            path.display()
        )));
    }
    let gt = GeoTransform {
        top_left_x: tiepoint[3] - tiepoint[0] * scale[0],
        pixel_width: scale[0],
        rotation_x: 0.0,
        top_left_y: tiepoint[4] + tiepoint[1] * scale[1],
        rotation_y: 0.0,
        pixel_height: -scale[1],
    };
    Ok((grid, gt))
}

/// Write `raster` into `dir` (one GeoTIFF per band plus `metadata.json`)
pub fn write_asset_dir(dir: &Path, raster: &Raster) -> CanopyResult<()> {
    fs::create_dir_all(dir)?;
    for (name, grid) in raster.bands() {
        write_geotiff(&band_file(dir, name)?, grid, &raster.geo_transform)?;
    }
    let (rows, cols) = raster.shape();
    let metadata = AssetMetadata {
        bands: raster.band_names().iter().map(|b| b.to_string()).collect(),
        rows,
        cols,
        geo_transform: raster.geo_transform,
        time_start: raster.time_start.map(|t| t.timestamp_millis()),
        time_end: raster.time_end.map(|t| t.timestamp_millis()),
        properties: raster.properties.clone(),
    };
    fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;
    Ok(())
}

/// Whether `dir` holds an exported raster
pub fn is_asset_dir(dir: &Path) -> bool {
    dir.join(METADATA_FILE).is_file()
}

/// Read a raster written by [`write_asset_dir`]
pub fn read_asset_dir(dir: &Path) -> CanopyResult<Raster> {
    let metadata: AssetMetadata = serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE))?)?;
    let shape = (metadata.rows, metadata.cols);
    let mut raster = Raster::new(shape, metadata.geo_transform);
    for band in &metadata.bands {
        let (grid, gt) = read_geotiff(&band_file(dir, band)?)?;
        if grid.dim() != shape || !gt.approx_eq(&metadata.geo_transform) {
            return Err(CanopyError::GridMismatch(format!(
                "Band {} in {} does not match its metadata grid",
                band,
                dir.display()
            )));
        }
        raster = raster.with_band(band, grid)?;
    }
    raster.time_start = metadata.time_start.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    raster.time_end = metadata.time_end.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    raster.properties = metadata.properties;
    Ok(raster)
}

/// Read asset `id` exported under `root`
pub fn read_asset(root: &Path, id: &str) -> CanopyResult<Raster> {
    let dir = asset_path(root, id)?;
    if !is_asset_dir(&dir) {
        return Err(CanopyError::MissingAsset(id.to_string()));
    }
    read_asset_dir(&dir)
}

/// Write `table` as CSV with a header row; no-data cells stay empty
pub fn write_csv(path: &Path, table: &Table) -> CanopyResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes assets and tables below a root directory
#[derive(Debug, Clone)]
pub struct LocalExporter {
    root: PathBuf,
}

impl LocalExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, description: &str) -> CanopyResult<PathBuf> {
        check_segment(description, description)?;
        if description.contains('/') {
            return Err(CanopyError::Export(format!("Table name '{}' contains '/'", description)));
        }
        Ok(self.root.join(format!("{}.csv", description)))
    }
}

impl ExportSink for LocalExporter {
    fn write_image(&self, asset_id: &str, image: &Raster) -> CanopyResult<ExportReceipt> {
        let dir = asset_path(&self.root, asset_id)?;
        write_asset_dir(&dir, image)?;
        log::info!("Wrote {} ({} bands) to {}", asset_id, image.band_count(), dir.display());
        Ok(ExportReceipt {
            id: asset_id.to_string(),
            location: dir.display().to_string(),
            records: image.pixel_count(),
        })
    }

    fn write_table(&self, description: &str, table: &Table) -> CanopyResult<ExportReceipt> {
        let path = self.table_path(description)?;
        write_csv(&path, table)?;
        log::info!("Wrote {} rows to {}", table.len(), path.display());
        Ok(ExportReceipt {
            id: description.to_string(),
            location: path.display().to_string(),
            records: table.len(),
        })
    }
}
