//! Campaign workflows.
//!
//! Each builder describes one campaign as a [`Graph`] plus the export tasks that
//! persist its results. Nothing is evaluated until [`Workflow::run`] or
//! [`Workflow::materialize`] is called.

use crate::config::{NdviCampaign, PipelineConfig};
use crate::core::collection::Filter;
use crate::core::composite::TemporalCompositor;
use crate::core::comparison::REFERENCE_SOURCE_BAND;
use crate::core::harmonize::BandHarmonizer;
use crate::core::indices::{SpectralIndex, AGB_MGHA_BAND};
use crate::core::landcover::LandCoverMask;
use crate::core::region::Region;
use crate::core::source_select::SourceSelector;
use crate::graph::{Engine, Graph, NodeId, Value};
use crate::io::catalog::Catalog;
use crate::io::export::{ExportReceipt, ExportSink, ExportTask, ImageExport, TableExport};
use crate::types::{CanopyError, CanopyResult, OutputGrid, SensorFamily, TimeSpan};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Configuration plus the resolved region of interest
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub region: Arc<Region>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, region: Region) -> Self {
        Self { config, region: Arc::new(region) }
    }

    /// Resolve `config.region_id` through the catalog
    pub fn from_catalog_region(config: PipelineConfig, catalog: &dyn Catalog) -> CanopyResult<Self> {
        let region = catalog.region(&config.region_id)?;
        Ok(Self::new(config, region))
    }

    fn harmonizer(&self) -> CanopyResult<Arc<BandHarmonizer>> {
        Ok(Arc::new(BandHarmonizer::new(self.config.harmonization.clone())?))
    }

    /// Region grid at `scale` metres
    fn grid(&self, scale: f64) -> CanopyResult<OutputGrid> {
        OutputGrid::covering(&self.region.bounding_box(), scale)
    }

    fn image_export(&self, description: String, asset_id: String, node: NodeId, scale: f64) -> ExportTask {
        ExportTask::Image(ImageExport {
            description,
            asset_id,
            node,
            region: self.region.clone(),
            scale,
            max_pixels: self.config.max_pixels,
        })
    }
}

/// A built campaign: its graph, its export tasks and its named result nodes
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub graph: Graph,
    pub exports: Vec<ExportTask>,
    pub outputs: BTreeMap<String, NodeId>,
}

impl Workflow {
    pub fn output(&self, name: &str) -> CanopyResult<NodeId> {
        self.outputs
            .get(name)
            .copied()
            .ok_or_else(|| CanopyError::Graph(format!("Workflow has no output '{}'", name)))
    }

    /// Evaluate one named output
    pub fn materialize(&self, catalog: &dyn Catalog, name: &str) -> CanopyResult<Value> {
        Engine::new(&self.graph, catalog).materialize(self.output(name)?)
    }

    /// Run every export task against one shared evaluation cache
    pub fn run(&self, catalog: &dyn Catalog, sink: &dyn ExportSink) -> Vec<CanopyResult<ExportReceipt>> {
        Engine::new(&self.graph, catalog).run_exports(&self.exports, sink)
    }
}

/// Yearly seasonal NDVI composites from the campaign's Landsat sensors
pub fn landsat_ndvi_campaign(context: &PipelineContext, campaign: &NdviCampaign) -> CanopyResult<Workflow> {
    let config = &context.config;
    let mut params = config.selection.clone();
    params.landsat8_start = campaign.landsat8_start;
    let selector = SourceSelector::new(params, context.region.clone());

    let harmonizer = context.harmonizer()?;
    let bands = match campaign.sensors.first() {
        Some(&sensor) => harmonizer.output_bands(sensor),
        None => return Err(CanopyError::InvalidConfig("NDVI campaign has no sensors".to_string())),
    };
    let grid = context.grid(campaign.native_scale)?;

    let mut workflow = Workflow::default();
    let merged = selector.build(&mut workflow.graph, &campaign.sensors, &harmonizer)?;

    for &year in &config.years {
        let window = campaign.window(year)?;
        let seasonal = workflow.graph.filter(merged, Filter::date(window));
        let compositor =
            TemporalCompositor::new(window, context.region.clone(), grid, bands.clone()).with_year(year);
        let composite = workflow.graph.composite(seasonal, compositor);
        let ndvi = workflow.graph.index(composite, SpectralIndex::Ndvi);

        let name = campaign.asset_name(year);
        workflow.exports.push(context.image_export(
            name.clone(),
            format!("{}{}", config.asset_path, name),
            ndvi,
            campaign.export_scale,
        ));
        workflow.outputs.insert(name, ndvi);
    }

    log::info!(
        "Built NDVI campaign '{}' over {} years ({} nodes)",
        campaign.prefix,
        config.years.len(),
        workflow.graph.len()
    );
    Ok(workflow)
}

/// Sentinel-2 median composite and biomass estimate
pub fn sentinel2_biomass(context: &PipelineContext) -> CanopyResult<Workflow> {
    let campaign = &context.config.biomass;
    let selector = SourceSelector::from_context(context);
    let harmonizer = context.harmonizer()?;
    let window = TimeSpan::from_dates(campaign.start, campaign.end)?;

    let mut workflow = Workflow::default();
    let scenes = selector.build(&mut workflow.graph, &[SensorFamily::Sentinel2], &harmonizer)?;
    let seasonal = workflow.graph.filter(scenes, Filter::date(window));
    let compositor = TemporalCompositor::new(
        window,
        context.region.clone(),
        context.grid(campaign.native_scale)?,
        harmonizer.output_bands(SensorFamily::Sentinel2),
    )
    .with_year(campaign.year);
    let composite = workflow.graph.composite(seasonal, compositor);
    let agb = workflow.graph.biomass(composite, campaign.model.clone(), campaign.with_components);

    workflow.exports.push(context.image_export(
        campaign.description.clone(),
        campaign.asset_id.clone(),
        agb,
        campaign.export_scale,
    ));
    workflow.outputs.insert("composite".to_string(), composite);
    workflow.outputs.insert("agb".to_string(), agb);
    Ok(workflow)
}

/// Model estimate against the reference biomass: difference raster and sampled pairs
pub fn biomass_comparison(context: &PipelineContext) -> CanopyResult<Workflow> {
    let campaign = &context.config.comparison;
    let window = TimeSpan::from_dates(campaign.reference_start, campaign.reference_end)?;

    let mut workflow = Workflow::default();
    let graph = &mut workflow.graph;
    let model = graph.asset(&campaign.model_asset);
    let model = graph.select(model, &[AGB_MGHA_BAND]);

    let reference = graph.collection(&campaign.reference_collection);
    let reference = graph.filter(reference, Filter::date(window));
    let reference = graph.first(reference);
    let reference = graph.rename(reference, &campaign.reference_band, REFERENCE_SOURCE_BAND);

    let difference = graph.difference(model, reference, "Model_minus_CCI");
    let difference = graph.clip(difference, context.region.clone());
    let samples = graph.sample(model, reference, context.region.clone(), campaign.sampling.clone());

    workflow.exports.push(ExportTask::Table(TableExport {
        description: campaign.description.clone(),
        node: samples,
    }));
    if let Some(asset_id) = &campaign.difference_asset {
        workflow.exports.push(context.image_export(
            "Model_minus_CCI".to_string(),
            asset_id.clone(),
            difference,
            campaign.sampling.scale,
        ));
    }
    workflow.outputs.insert("model".to_string(), model);
    workflow.outputs.insert("reference".to_string(), reference);
    workflow.outputs.insert("difference".to_string(), difference);
    workflow.outputs.insert("samples".to_string(), samples);
    Ok(workflow)
}

/// Mask each yearly NDVI asset by land cover and cut it per named area
pub fn landcover_masking(context: &PipelineContext, areas: &[(String, Arc<Region>)]) -> CanopyResult<Workflow> {
    let config = &context.config;
    let params = &config.landcover;
    if areas.is_empty() {
        return Err(CanopyError::InvalidConfig("No areas to mask".to_string()));
    }
    let mask = LandCoverMask::from_params(params);

    let mut workflow = Workflow::default();
    let landcover = workflow.graph.collection(&params.collection);
    let landcover = workflow.graph.first(landcover);

    for &year in &config.years {
        let ndvi = workflow
            .graph
            .asset(&format!("{}{}", config.asset_path, config.may_june.asset_name(year)));
        let masked = workflow.graph.landcover_mask(ndvi, landcover, mask.clone());

        for (area, region) in areas {
            let clipped = workflow.graph.clip(masked, region.clone());
            let name = format!("NDVI_Masked_{}_{}", year, area);
            workflow.exports.push(ExportTask::Image(ImageExport {
                description: name.clone(),
                asset_id: format!("{}masked/{}", config.asset_path, name),
                node: clipped,
                region: region.clone(),
                scale: params.scale,
                max_pixels: config.max_pixels,
            }));
            workflow.outputs.insert(name, clipped);
        }
    }
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::catalog::InMemoryCatalog;

    fn context() -> PipelineContext {
        let config = PipelineConfig { years: vec![2019, 2021], ..PipelineConfig::default() };
        PipelineContext::new(config, Region::rectangle(0.0, 0.0, 300.0, 300.0).unwrap())
    }

    #[test]
    fn test_ndvi_campaign_exports_per_year() {
        let ctx = context();
        let workflow = landsat_ndvi_campaign(&ctx, &ctx.config.jan_may).unwrap();
        let ids: Vec<_> = workflow
            .exports
            .iter()
            .map(|task| match task {
                ExportTask::Image(export) => (export.asset_id.clone(), export.scale),
                ExportTask::Table(_) => panic!("unexpected table export"),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                ("projects/ee-komba/assets/kaya/NDVI_JanApr_2019".to_string(), 100.0),
                ("projects/ee-komba/assets/kaya/NDVI_JanApr_2021".to_string(), 100.0),
            ]
        );
        assert!(workflow.output("NDVI_JanApr_2021").is_ok());
        assert!(workflow.output("NDVI_2021").is_err());
    }

    #[test]
    fn test_building_does_not_touch_the_catalog() {
        let ctx = context();
        let workflow = biomass_comparison(&ctx).unwrap();
        assert_eq!(workflow.exports.len(), 1);
        assert_eq!(workflow.exports[0].description(), "AGB_Model_vs_CCI_SamplePoints");
        // nothing is in the catalog, so only materialization fails
        let err = workflow.materialize(&InMemoryCatalog::new(), "samples").unwrap_err();
        assert!(matches!(err, CanopyError::MissingAsset(_)));
    }

    #[test]
    fn test_landcover_outputs_per_year_and_area() {
        let ctx = context();
        let areas = vec![
            ("5".to_string(), Arc::new(Region::rectangle(0.0, 0.0, 100.0, 100.0).unwrap())),
            ("8".to_string(), Arc::new(Region::rectangle(100.0, 100.0, 300.0, 300.0).unwrap())),
        ];
        let workflow = landcover_masking(&ctx, &areas).unwrap();
        assert_eq!(workflow.exports.len(), 4);
        assert!(workflow.outputs.contains_key("NDVI_Masked_2019_8"));
        assert!(landcover_masking(&ctx, &[]).is_err());
    }

    #[test]
    fn test_ndvi_campaign_needs_sensors() {
        let ctx = context();
        let mut campaign = ctx.config.may_june.clone();
        campaign.sensors.clear();
        assert!(matches!(
            landsat_ndvi_campaign(&ctx, &campaign),
            Err(CanopyError::InvalidConfig(_))
        ));
    }
}
