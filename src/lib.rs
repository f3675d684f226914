//! canopy: cloud-free vegetation composites and above-ground biomass
//!
//! This library builds seasonal NDVI composites from Landsat 5/7/8/9, estimates
//! above-ground biomass from Sentinel-2 with a fixed linear regression, and
//! compares the estimate against a reference biomass map. Processing is described
//! as a lazy dataflow graph and evaluated against a pluggable catalog.

pub mod config;
pub mod core;
pub mod graph;
pub mod io;
pub mod pipeline;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    BandGrid, BoundingBox, CanopyError, CanopyResult, GeoTransform, OutputGrid, Pixel, PropertyValue,
    QualityMask, Raster, SensorFamily, Table, TimeSpan,
};

pub use config::{BiomassCampaign, ComparisonCampaign, NdviCampaign, PipelineConfig};
pub use graph::{Engine, Graph, NodeId, Value};
pub use io::{Catalog, DirectoryCatalog, ExportSink, InMemoryCatalog, LocalExporter, MemorySink};
pub use pipeline::{
    biomass_comparison, landcover_masking, landsat_ndvi_campaign, sentinel2_biomass, PipelineContext, Workflow,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::indices::{self, BiomassModel, Reflectance};
    use crate::types::Pixel;
    use ndarray::{Array2, ArrayView2};
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    fn pixel(value: f64) -> Pixel {
        if value.is_finite() {
            Some(value)
        } else {
            None
        }
    }

    fn check_shapes(arrays: &[&ArrayView2<f64>]) -> PyResult<()> {
        if let Some(first) = arrays.first() {
            if arrays.iter().any(|a| a.dim() != first.dim()) {
                return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(
                    "All bands must have the same shape",
                ));
            }
        }
        Ok(())
    }

    /// NDVI of two reflectance arrays; NaN marks no-data on input and output
    #[pyfunction]
    fn ndvi<'py>(
        py: Python<'py>,
        nir: PyReadonlyArray2<'py, f64>,
        red: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<&'py PyArray2<f64>> {
        let (nir, red) = (nir.as_array(), red.as_array());
        check_shapes(&[&nir, &red])?;
        let out = Array2::from_shape_fn(nir.dim(), |idx| {
            indices::ndvi(pixel(nir[idx]), pixel(red[idx])).unwrap_or(f64::NAN)
        });
        Ok(out.into_pyarray(py))
    }

    /// Biomass in Mg/ha from Sentinel-2 reflectances (B2, B4, B8, B5, B6, B7)
    #[pyfunction]
    fn above_ground_biomass<'py>(
        py: Python<'py>,
        blue: PyReadonlyArray2<'py, f64>,
        red: PyReadonlyArray2<'py, f64>,
        nir: PyReadonlyArray2<'py, f64>,
        re1: PyReadonlyArray2<'py, f64>,
        re2: PyReadonlyArray2<'py, f64>,
        re3: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<&'py PyArray2<f64>> {
        let bands = [
            blue.as_array(),
            red.as_array(),
            nir.as_array(),
            re1.as_array(),
            re2.as_array(),
            re3.as_array(),
        ];
        check_shapes(&bands.iter().collect::<Vec<_>>())?;
        let model = BiomassModel::default();
        let out = Array2::from_shape_fn(bands[0].dim(), |idx| {
            let reflectance = Reflectance {
                blue: pixel(bands[0][idx]),
                red: pixel(bands[1][idx]),
                nir: pixel(bands[2][idx]),
                re1: pixel(bands[3][idx]),
                re2: pixel(bands[4][idx]),
                re3: pixel(bands[5][idx]),
            };
            model.estimate_pixel(&reflectance).agb_mg_ha.unwrap_or(f64::NAN)
        });
        Ok(out.into_pyarray(py))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(ndvi, m)?)?;
        m.add_function(wrap_pyfunction!(above_ground_biomass, m)?)?;
        Ok(())
    }
}
