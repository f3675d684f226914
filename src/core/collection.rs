use crate::core::region::Region;
use crate::types::{CanopyError, CanopyResult, Raster, TimeSpan};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Metadata predicate applied to whole images
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Acquisition time within the window
    Date(TimeSpan),
    /// Numeric property strictly below a threshold
    PropertyLessThan { name: String, value: f64 },
    /// Text property different from a value; images lacking the property pass
    PropertyNotEqual { name: String, value: String },
    /// Footprint intersects the region
    Bounds(Arc<Region>),
}

impl Filter {
    pub fn date(span: TimeSpan) -> Self {
        Filter::Date(span)
    }

    pub fn lt(name: &str, value: f64) -> Self {
        Filter::PropertyLessThan { name: name.to_string(), value }
    }

    pub fn neq(name: &str, value: &str) -> Self {
        Filter::PropertyNotEqual { name: name.to_string(), value: value.to_string() }
    }

    pub fn bounds(region: Arc<Region>) -> Self {
        Filter::Bounds(region)
    }

    /// An image lacking the timestamp or the numeric property a filter compares
    /// never matches. A missing property is not equal to anything.
    pub fn matches(&self, image: &Raster) -> bool {
        match self {
            Filter::Date(span) => image.time_start.map_or(false, |t| span.contains(&t)),
            Filter::PropertyLessThan { name, value } => image
                .property(name)
                .and_then(|p| p.as_f64())
                .map_or(false, |v| v < *value),
            Filter::PropertyNotEqual { name, value } => image
                .property(name)
                .map_or(true, |p| p.to_string() != *value),
            Filter::Bounds(region) => {
                let footprint = image.geo_transform.bounds(image.shape());
                region.intersects_box(&footprint)
            }
        }
    }
}

/// Time-ordered set of rasters sharing a band schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageCollection {
    images: Vec<Raster>,
}

impl ImageCollection {
    /// Build a collection, ordering images by acquisition time (untimed images first)
    pub fn new(mut images: Vec<Raster>) -> Self {
        images.sort_by_key(|image| image.time_start);
        Self { images }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[Raster] {
        &self.images
    }

    pub fn iter(&self) -> impl Iterator<Item = &Raster> {
        self.images.iter()
    }

    pub fn first(&self) -> Option<&Raster> {
        self.images.first()
    }

    /// Band names shared by the members, `None` when empty
    pub fn band_schema(&self) -> Option<BTreeSet<String>> {
        self.images.first().map(|image| image.band_set())
    }

    pub fn filter(&self, filter: &Filter) -> ImageCollection {
        let images: Vec<Raster> = self
            .images
            .iter()
            .filter(|image| filter.matches(image))
            .cloned()
            .collect();
        log::debug!("Filter {:?} kept {}/{} images", filter, images.len(), self.images.len());
        ImageCollection { images }
    }

    /// Apply a per-image transform, keeping order
    pub fn map<F>(&self, f: F) -> CanopyResult<ImageCollection>
    where
        F: Fn(&Raster) -> CanopyResult<Raster>,
    {
        let images = self.images.iter().map(f).collect::<CanopyResult<Vec<_>>>()?;
        Ok(ImageCollection::new(images))
    }

    /// Union of two collections; non-empty inputs must expose the same band names
    pub fn merge(&self, other: &ImageCollection) -> CanopyResult<ImageCollection> {
        if let (Some(left), Some(right)) = (self.band_schema(), other.band_schema()) {
            if left != right {
                return Err(CanopyError::SchemaMismatch(format!(
                    "Cannot merge collections with bands {:?} and {:?}",
                    left, right
                )));
            }
        }
        let mut images = self.images.clone();
        images.extend(other.images.iter().cloned());
        Ok(ImageCollection::new(images))
    }
}

impl From<Vec<Raster>> for ImageCollection {
    fn from(images: Vec<Raster>) -> Self {
        ImageCollection::new(images)
    }
}
