//! Catalog access, export and table output

pub mod catalog;
pub mod export;
pub mod vectorize;

// Re-export main types
pub use catalog::{Catalog, DirectoryCatalog, InMemoryCatalog};
pub use export::{ExportReceipt, ExportSink, ExportTask, ImageExport, LocalExporter, MemorySink, TableExport};
pub use vectorize::{merge_by_coords, stack_time_series, vectorize_time_series};
