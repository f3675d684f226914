use crate::core::collection::ImageCollection;
use crate::core::region::Region;
use crate::io::export::{asset_path, is_asset_dir, read_asset, read_asset_dir};
use crate::types::{CanopyError, CanopyResult, Raster};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolves catalog identifiers to data
pub trait Catalog: Send + Sync {
    /// Image collection such as `LANDSAT/LC08/C02/T1_L2`
    fn collection(&self, id: &str) -> CanopyResult<ImageCollection>;

    /// Single raster asset
    fn asset(&self, id: &str) -> CanopyResult<Raster>;

    /// Region geometry stored under `id`
    fn region(&self, id: &str) -> CanopyResult<Region>;
}

/// Catalog backed by maps, for tests and for data already in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    collections: HashMap<String, ImageCollection>,
    assets: HashMap<String, Raster>,
    regions: HashMap<String, Region>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, id: &str, collection: ImageCollection) -> Self {
        self.insert_collection(id, collection);
        self
    }

    pub fn with_asset(mut self, id: &str, raster: Raster) -> Self {
        self.insert_asset(id, raster);
        self
    }

    pub fn with_region(mut self, id: &str, region: Region) -> Self {
        self.regions.insert(id.to_string(), region);
        self
    }

    pub fn insert_collection(&mut self, id: &str, collection: ImageCollection) {
        self.collections.insert(id.to_string(), collection);
    }

    pub fn insert_asset(&mut self, id: &str, raster: Raster) {
        self.assets.insert(id.to_string(), raster);
    }
}

impl Catalog for InMemoryCatalog {
    fn collection(&self, id: &str) -> CanopyResult<ImageCollection> {
        self.collections
            .get(id)
            .cloned()
            .ok_or_else(|| CanopyError::MissingAsset(id.to_string()))
    }

    fn asset(&self, id: &str) -> CanopyResult<Raster> {
        self.assets
            .get(id)
            .cloned()
            .ok_or_else(|| CanopyError::MissingAsset(id.to_string()))
    }

    fn region(&self, id: &str) -> CanopyResult<Region> {
        self.regions
            .get(id)
            .cloned()
            .ok_or_else(|| CanopyError::MissingAsset(id.to_string()))
    }
}

/// Catalog reading the directory layout written by `LocalExporter`.
///
/// An asset `a/b/c` lives in `<root>/a/b/c/`; a collection is a directory whose
/// subdirectories are assets; a region `a/b` is the GeoJSON file `<root>/a/b.geojson`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Catalog for DirectoryCatalog {
    fn collection(&self, id: &str) -> CanopyResult<ImageCollection> {
        let dir = asset_path(&self.root, id)?;
        if !dir.is_dir() {
            return Err(CanopyError::MissingAsset(id.to_string()));
        }
        let mut members: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_asset_dir(path))
            .collect();
        members.sort();

        let images = members
            .iter()
            .map(|path| read_asset_dir(path))
            .collect::<CanopyResult<Vec<_>>>()?;
        log::debug!("Read collection {} with {} images from {}", id, images.len(), dir.display());
        Ok(ImageCollection::new(images))
    }

    fn asset(&self, id: &str) -> CanopyResult<Raster> {
        read_asset(&self.root, id)
    }

    fn region(&self, id: &str) -> CanopyResult<Region> {
        let mut path = asset_path(&self.root, id)?.into_os_string();
        path.push(".geojson");
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(CanopyError::MissingAsset(id.to_string()));
        }
        Region::from_geojson_str(&fs::read_to_string(&path)?)
    }
}
