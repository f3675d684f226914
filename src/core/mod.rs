//! Core compositing and biomass modules

pub mod collection;
pub mod comparison;
pub mod composite;
pub mod harmonize;
pub mod indices;
pub mod landcover;
pub mod region;
pub mod resample;
pub mod source_select;

// Re-export main types
pub use collection::{Filter, ImageCollection};
pub use comparison::{ComparisonStats, SamplePoint, SampleSet, SamplingParams};
pub use composite::TemporalCompositor;
pub use harmonize::{BandHarmonizer, HarmonizationParams};
pub use indices::{BiomassModel, IndexEngine, SpectralIndex};
pub use landcover::{LandCoverMask, LandCoverParams};
pub use region::Region;
pub use resample::Resampling;
pub use source_select::{SourceSelectionParams, SourceSelector};
