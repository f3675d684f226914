use crate::core::collection::{Filter, ImageCollection};
use crate::core::harmonize::BandHarmonizer;
use crate::core::region::Region;
use crate::graph::{Graph, NodeId};
use crate::pipeline::PipelineContext;
use crate::types::{calendar_date, CanopyError, CanopyResult, SensorFamily, TimeSpan};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Scene-level acceptance policy per sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSelectionParams {
    /// Scenes at or above this WRS row are night-time acquisitions
    pub max_wrs_row: f64,
    /// Sentinel-2 scene cloud percentage threshold (exclusive)
    pub max_cloud_percentage: f64,
    pub landsat7_start: NaiveDate,
    /// Orbital drift after this date
    pub landsat7_end: NaiveDate,
    /// Earlier Landsat 8 scenes had pointing issues
    pub landsat8_start: NaiveDate,
    pub landsat9_start: NaiveDate,
    /// End of the open-ended Landsat 8/9 windows
    pub open_end: NaiveDate,
}

impl Default for SourceSelectionParams {
    fn default() -> Self {
        Self {
            max_wrs_row: 122.0,
            max_cloud_percentage: 20.0,
            landsat7_start: calendar_date(1984, 1, 1),
            landsat7_end: calendar_date(2017, 1, 1),
            landsat8_start: calendar_date(2013, 5, 1),
            landsat9_start: calendar_date(2021, 1, 1),
            open_end: calendar_date(2099, 1, 1),
        }
    }
}

/// Chooses and merges sensor collections over one region
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSelector {
    params: SourceSelectionParams,
    region: Arc<Region>,
}

impl SourceSelector {
    pub fn new(params: SourceSelectionParams, region: Arc<Region>) -> Self {
        Self { params, region }
    }

    pub fn from_context(context: &PipelineContext) -> Self {
        Self::new(context.config.selection.clone(), context.region.clone())
    }

    pub fn params(&self) -> &SourceSelectionParams {
        &self.params
    }

    /// Metadata filters applied to raw scenes of `sensor`, before harmonization
    pub fn scene_filters(&self, sensor: SensorFamily) -> CanopyResult<Vec<Filter>> {
        let p = &self.params;
        let row = Filter::lt("WRS_ROW", p.max_wrs_row);
        let filters = match sensor {
            SensorFamily::Landsat5 => vec![row],
            SensorFamily::Landsat7 => vec![
                row,
                Filter::date(TimeSpan::from_dates(p.landsat7_start, p.landsat7_end)?),
            ],
            SensorFamily::Landsat8 => vec![
                Filter::date(TimeSpan::from_dates(p.landsat8_start, p.open_end)?),
                Filter::neq("NADIR_OFFNADIR", "OFFNADIR"),
                row,
            ],
            SensorFamily::Landsat9 => vec![
                Filter::date(TimeSpan::from_dates(p.landsat9_start, p.open_end)?),
                Filter::neq("NADIR_OFFNADIR", "OFFNADIR"),
                row,
            ],
            SensorFamily::Sentinel2 => vec![Filter::lt("CLOUDY_PIXEL_PERCENTAGE", p.max_cloud_percentage)],
        };
        Ok(filters)
    }

    /// Apply the scene filters of `sensor` and the region footprint test to a raw collection
    pub fn select(&self, raw: &ImageCollection, sensor: SensorFamily) -> CanopyResult<ImageCollection> {
        let mut selected = raw.filter(&Filter::bounds(self.region.clone()));
        for filter in self.scene_filters(sensor)? {
            selected = selected.filter(&filter);
        }
        log::info!("{}: {} of {} scenes selected", sensor, selected.len(), raw.len());
        if selected.is_empty() {
            log::warn!("No {} scenes left after selection", sensor);
        }
        Ok(selected)
    }

    /// Add nodes that load, filter and harmonize each sensor, then merge them and
    /// keep scenes intersecting the region. Returns the merged collection node.
    pub fn build(
        &self,
        graph: &mut Graph,
        sensors: &[SensorFamily],
        harmonizer: &Arc<BandHarmonizer>,
    ) -> CanopyResult<NodeId> {
        if sensors.is_empty() {
            return Err(CanopyError::InvalidConfig("No sensors selected".to_string()));
        }
        let mut harmonized = Vec::with_capacity(sensors.len());
        for &sensor in sensors {
            let mut node = graph.collection(sensor.catalog_id());
            for filter in self.scene_filters(sensor)? {
                node = graph.filter(node, filter);
            }
            harmonized.push(graph.harmonize(node, sensor, harmonizer.clone()));
        }
        let merged = graph.merge(harmonized);
        Ok(graph.filter(merged, Filter::bounds(self.region.clone())))
    }
}
