//! Lazy dataflow graph of pure raster transformations.
//!
//! Building a [`Graph`] never touches data: each builder method only appends a
//! [`Node`] and returns its id. Data is produced by [`Engine::materialize`],
//! which resolves catalog ids, evaluates inputs first and memoizes every node
//! it computes. Errors such as a missing asset or a band schema mismatch
//! therefore surface at materialization, not at construction.

use crate::core::collection::{Filter, ImageCollection};
use crate::core::comparison::{self, SampleSet, SamplingParams};
use crate::core::composite::TemporalCompositor;
use crate::core::harmonize::BandHarmonizer;
use crate::core::indices::{BiomassModel, IndexEngine, SpectralIndex};
use crate::core::landcover::LandCoverMask;
use crate::core::region::Region;
use crate::io::catalog::Catalog;
use crate::io::export::{prepare_image, ExportReceipt, ExportSink, ExportTask};
use crate::types::{CanopyError, CanopyResult, Raster, SensorFamily};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Handle of a node inside one [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A pure transformation and the nodes it reads
#[derive(Debug, Clone)]
pub enum Node {
    /// Raw collection resolved through the catalog
    Collection { id: String },
    /// Single raster resolved through the catalog
    Asset { id: String },
    Filter { input: NodeId, filter: Filter },
    Harmonize { input: NodeId, sensor: SensorFamily, harmonizer: Arc<BandHarmonizer> },
    Merge { inputs: Vec<NodeId> },
    Composite { input: NodeId, compositor: TemporalCompositor },
    /// Earliest image of a collection
    First { input: NodeId },
    Clip { input: NodeId, region: Arc<Region> },
    /// Keep bands `(from, to)`, renaming on the way
    Select { input: NodeId, bands: Vec<(String, String)> },
    Index { input: NodeId, index: SpectralIndex },
    Biomass { input: NodeId, model: BiomassModel, components: bool },
    AddBands { input: NodeId, other: NodeId },
    Difference { model: NodeId, reference: NodeId, output: String },
    LandCoverMask { input: NodeId, landcover: NodeId, mask: LandCoverMask },
    Sample { model: NodeId, reference: NodeId, region: Arc<Region>, params: SamplingParams },
}

impl Node {
    /// Nodes read by this one
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Node::Collection { .. } | Node::Asset { .. } => Vec::new(),
            Node::Filter { input, .. }
            | Node::Harmonize { input, .. }
            | Node::Composite { input, .. }
            | Node::First { input }
            | Node::Clip { input, .. }
            | Node::Select { input, .. }
            | Node::Index { input, .. }
            | Node::Biomass { input, .. } => vec![*input],
            Node::Merge { inputs } => inputs.clone(),
            Node::AddBands { input, other } => vec![*input, *other],
            Node::Difference { model, reference, .. } | Node::Sample { model, reference, .. } => {
                vec![*model, *reference]
            }
            Node::LandCoverMask { input, landcover, .. } => vec![*input, *landcover],
        }
    }
}

/// Result of evaluating a node
#[derive(Debug, Clone)]
pub enum Value {
    Collection(Arc<ImageCollection>),
    Image(Arc<Raster>),
    Samples(Arc<SampleSet>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Collection(_) => "collection",
            Value::Image(_) => "image",
            Value::Samples(_) => "sample set",
        }
    }

    pub fn into_collection(self) -> CanopyResult<Arc<ImageCollection>> {
        match self {
            Value::Collection(c) => Ok(c),
            other => Err(CanopyError::Graph(format!("Expected a collection, got a {}", other.kind()))),
        }
    }

    pub fn into_image(self) -> CanopyResult<Arc<Raster>> {
        match self {
            Value::Image(i) => Ok(i),
            other => Err(CanopyError::Graph(format!("Expected an image, got a {}", other.kind()))),
        }
    }

    pub fn into_samples(self) -> CanopyResult<Arc<SampleSet>> {
        match self {
            Value::Samples(s) => Ok(s),
            other => Err(CanopyError::Graph(format!("Expected a sample set, got a {}", other.kind()))),
        }
    }
}

/// Append-only arena of nodes
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> CanopyResult<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| CanopyError::Graph(format!("Node {} is not in the graph", id.0)))
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn collection(&mut self, id: &str) -> NodeId {
        self.push(Node::Collection { id: id.to_string() })
    }

    pub fn asset(&mut self, id: &str) -> NodeId {
        self.push(Node::Asset { id: id.to_string() })
    }

    pub fn filter(&mut self, input: NodeId, filter: Filter) -> NodeId {
        self.push(Node::Filter { input, filter })
    }

    pub fn harmonize(&mut self, input: NodeId, sensor: SensorFamily, harmonizer: Arc<BandHarmonizer>) -> NodeId {
        self.push(Node::Harmonize { input, sensor, harmonizer })
    }

    pub fn merge(&mut self, inputs: Vec<NodeId>) -> NodeId {
        self.push(Node::Merge { inputs })
    }

    pub fn composite(&mut self, input: NodeId, compositor: TemporalCompositor) -> NodeId {
        self.push(Node::Composite { input, compositor })
    }

    pub fn first(&mut self, input: NodeId) -> NodeId {
        self.push(Node::First { input })
    }

    pub fn clip(&mut self, input: NodeId, region: Arc<Region>) -> NodeId {
        self.push(Node::Clip { input, region })
    }

    pub fn select(&mut self, input: NodeId, bands: &[&str]) -> NodeId {
        let bands = bands.iter().map(|b| (b.to_string(), b.to_string())).collect();
        self.push(Node::Select { input, bands })
    }

    pub fn rename(&mut self, input: NodeId, from: &str, to: &str) -> NodeId {
        self.push(Node::Select { input, bands: vec![(from.to_string(), to.to_string())] })
    }

    pub fn index(&mut self, input: NodeId, index: SpectralIndex) -> NodeId {
        self.push(Node::Index { input, index })
    }

    /// `AGB_MgHa` only, or every intermediate band with `components`
    pub fn biomass(&mut self, input: NodeId, model: BiomassModel, components: bool) -> NodeId {
        self.push(Node::Biomass { input, model, components })
    }

    pub fn add_bands(&mut self, input: NodeId, other: NodeId) -> NodeId {
        self.push(Node::AddBands { input, other })
    }

    pub fn difference(&mut self, model: NodeId, reference: NodeId, output: &str) -> NodeId {
        self.push(Node::Difference { model, reference, output: output.to_string() })
    }

    pub fn landcover_mask(&mut self, input: NodeId, landcover: NodeId, mask: LandCoverMask) -> NodeId {
        self.push(Node::LandCoverMask { input, landcover, mask })
    }

    pub fn sample(&mut self, model: NodeId, reference: NodeId, region: Arc<Region>, params: SamplingParams) -> NodeId {
        self.push(Node::Sample { model, reference, region, params })
    }
}

/// Evaluates graph nodes against a catalog, memoizing results
pub struct Engine<'a> {
    graph: &'a Graph,
    catalog: &'a dyn Catalog,
    cache: Mutex<HashMap<NodeId, Value>>,
}

impl<'a> Engine<'a> {
    pub fn new(graph: &'a Graph, catalog: &'a dyn Catalog) -> Self {
        Self { graph, catalog, cache: Mutex::new(HashMap::new()) }
    }

    /// Number of node results held in the cache
    pub fn cached_nodes(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn cached(&self, id: NodeId) -> CanopyResult<Option<Value>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| CanopyError::Graph("Evaluation cache poisoned".to_string()))?;
        Ok(cache.get(&id).cloned())
    }

    fn store(&self, id: NodeId, value: Value) -> CanopyResult<()> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| CanopyError::Graph("Evaluation cache poisoned".to_string()))?;
        cache.insert(id, value);
        Ok(())
    }

    /// Evaluate `id` and everything it depends on
    pub fn materialize(&self, id: NodeId) -> CanopyResult<Value> {
        if let Some(value) = self.cached(id)? {
            return Ok(value);
        }
        let node = self.graph.node(id)?;
        for input in node.inputs() {
            // inputs always precede their consumers, which also rules out cycles
            if input >= id {
                return Err(CanopyError::Graph(format!(
                    "Node {} reads node {} which is not built before it",
                    id.0, input.0
                )));
            }
        }
        let value = self.evaluate(node)?;
        self.store(id, value.clone())?;
        Ok(value)
    }

    pub fn materialize_image(&self, id: NodeId) -> CanopyResult<Arc<Raster>> {
        self.materialize(id)?.into_image()
    }

    pub fn materialize_collection(&self, id: NodeId) -> CanopyResult<Arc<ImageCollection>> {
        self.materialize(id)?.into_collection()
    }

    pub fn materialize_samples(&self, id: NodeId) -> CanopyResult<Arc<SampleSet>> {
        self.materialize(id)?.into_samples()
    }

    fn evaluate(&self, node: &Node) -> CanopyResult<Value> {
        let image = |raster: Raster| -> CanopyResult<Value> { Ok(Value::Image(Arc::new(raster))) };
        let collection = |c: ImageCollection| -> CanopyResult<Value> { Ok(Value::Collection(Arc::new(c))) };

        match node {
            Node::Collection { id } => {
                let c = self.catalog.collection(id)?;
                log::debug!("Loaded collection {} ({} images)", id, c.len());
                collection(c)
            }
            Node::Asset { id } => image(self.catalog.asset(id)?),
            Node::Filter { input, filter } => collection(self.materialize_collection(*input)?.filter(filter)),
            Node::Harmonize { input, sensor, harmonizer } => {
                let raw = self.materialize_collection(*input)?;
                collection(raw.map(|scene| harmonizer.harmonize(scene, *sensor))?)
            }
            Node::Merge { inputs } => {
                let mut merged = ImageCollection::empty();
                for input in inputs {
                    let next = self.materialize_collection(*input)?;
                    merged = merged.merge(next.as_ref())?;
                }
                collection(merged)
            }
            Node::Composite { input, compositor } => {
                let scenes = self.materialize_collection(*input)?;
                image(compositor.composite(scenes.as_ref())?)
            }
            Node::First { input } => {
                let c = self.materialize_collection(*input)?;
                let first = c.first().ok_or_else(|| {
                    CanopyError::MissingAsset(format!("Collection for node {} is empty", input.0))
                })?;
                image(first.clone())
            }
            Node::Clip { input, region } => {
                let raster = self.materialize_image(*input)?;
                image(region.clip(raster.as_ref())?)
            }
            Node::Select { input, bands } => {
                let mapping: Vec<(&str, &str)> = bands.iter().map(|(f, t)| (f.as_str(), t.as_str())).collect();
                image(self.materialize_image(*input)?.select_renamed(&mapping)?)
            }
            Node::Index { input, index } => {
                let raster = self.materialize_image(*input)?;
                image(IndexEngine::compute(raster.as_ref(), *index)?)
            }
            Node::Biomass { input, model, components } => {
                let composite = self.materialize_image(*input)?;
                if *components {
                    image(model.estimate_with_components(composite.as_ref())?)
                } else {
                    image(model.estimate(composite.as_ref())?)
                }
            }
            Node::AddBands { input, other } => {
                let base = self.materialize_image(*input)?;
                let extra = self.materialize_image(*other)?;
                image(base.add_bands(extra.as_ref(), false)?)
            }
            Node::Difference { model, reference, output } => {
                let model = self.materialize_image(*model)?;
                let reference = self.materialize_image(*reference)?;
                image(comparison::difference(model.as_ref(), reference.as_ref(), output)?)
            }
            Node::LandCoverMask { input, landcover, mask } => {
                let raster = self.materialize_image(*input)?;
                let landcover = self.materialize_image(*landcover)?;
                image(mask.apply(raster.as_ref(), landcover.as_ref())?)
            }
            Node::Sample { model, reference, region, params } => {
                let model = self.materialize_image(*model)?;
                let reference = self.materialize_image(*reference)?;
                let stack = comparison::stack_for_comparison(model.as_ref(), reference.as_ref())?;
                Ok(Value::Samples(Arc::new(comparison::sample_pixels(&stack, region, params)?)))
            }
        }
    }

    fn run_export(&self, task: &ExportTask, sink: &dyn ExportSink) -> CanopyResult<ExportReceipt> {
        match task {
            ExportTask::Image(export) => {
                let raster = self.materialize_image(export.node)?;
                let prepared = prepare_image(raster.as_ref(), &export.region, export.scale, export.max_pixels)?;
                sink.write_image(&export.asset_id, &prepared)
            }
            ExportTask::Table(export) => {
                let samples = self.materialize_samples(export.node)?;
                sink.write_table(&export.description, &samples.to_table())
            }
        }
    }

    /// Run independent export tasks. Each result stands alone; a failed export
    /// does not affect the others.
    pub fn run_exports(&self, tasks: &[ExportTask], sink: &dyn ExportSink) -> Vec<CanopyResult<ExportReceipt>> {
        log::info!("Running {} export tasks", tasks.len());

        let run = |task: &ExportTask| {
            let result = self.run_export(task, sink);
            match &result {
                Ok(receipt) => log::info!("Export {} finished: {}", task.description(), receipt.location),
                Err(e) => log::warn!("Export {} failed: {}", task.description(), e),
            }
            result
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            tasks.par_iter().map(run).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            tasks.iter().map(run).collect()
        }
    }
}
