use approx::assert_relative_eq;
use canopy::core::comparison::{MODEL_BAND, REFERENCE_BAND};
use canopy::core::{ComparisonStats, ImageCollection, Region};
use canopy::{
    biomass_comparison, GeoTransform, InMemoryCatalog, MemorySink, PipelineConfig, PipelineContext, Raster,
};
use chrono::{TimeZone, Utc};
use ndarray::Array2;

const MODEL_ID: &str = "projects/ee-komba/assets/AGB_2021";
const CCI_ID: &str = "projects/sat-io/open-datasets/ESA/ESA_CCI_AGB";

fn grid() -> GeoTransform {
    GeoTransform::north_up(0.0, 1000.0, 100.0)
}

fn model_agb(row: usize, col: usize) -> f64 {
    (row * 10 + col) as f64 * 2.0
}

fn model() -> Raster {
    Raster::new((10, 10), grid())
        .with_band("AGB_MgHa", Array2::from_shape_fn((10, 10), |(r, c)| Some(model_agb(r, c))))
        .expect("Failed to build model raster")
        .with_property("year", 2021)
}

fn cci(year: i32, gain: f64) -> Raster {
    // reference is a linear function of the model, with a few gaps
    let values = Array2::from_shape_fn((10, 10), |(r, c)| {
        if (r + c) % 9 == 0 {
            None
        } else {
            Some(model_agb(r, c) * gain + 5.0)
        }
    });
    Raster::new((10, 10), grid())
        .with_band("AGB", values)
        .expect("Failed to build reference raster")
        .with_time_start(Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap())
}

fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_asset(MODEL_ID, model())
        .with_collection(CCI_ID, ImageCollection::new(vec![cci(2020, 3.0), cci(2021, 0.8)]))
}

fn context(num_pixels: usize) -> PipelineContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = PipelineConfig::default();
    config.comparison.sampling.num_pixels = num_pixels;
    PipelineContext::new(config, Region::rectangle(0.0, 0.0, 1000.0, 1000.0).expect("Failed to build region"))
}

#[test]
fn test_sample_table_is_reproducible() {
    let ctx = context(30);
    let workflow = biomass_comparison(&ctx).expect("Failed to build workflow");

    let first = MemorySink::new();
    let second = MemorySink::new();
    assert!(workflow.run(&catalog(), &first).iter().all(|r| r.is_ok()));
    assert!(workflow.run(&catalog(), &second).iter().all(|r| r.is_ok()));

    let table = first.table("AGB_Model_vs_CCI_SamplePoints").expect("Table was not exported");
    assert_eq!(table.columns, vec!["pixel_id", "x", "y", MODEL_BAND, REFERENCE_BAND]);
    assert_eq!(table.len(), 30);
    assert_eq!(Some(table), second.table("AGB_Model_vs_CCI_SamplePoints"));
}

#[test]
fn test_samples_match_the_2021_reference() {
    let ctx = context(1000);
    let workflow = biomass_comparison(&ctx).expect("Failed to build workflow");
    let samples = workflow
        .materialize(&catalog(), "samples")
        .expect("Failed to sample")
        .into_samples()
        .unwrap();

    // 100 pixels minus the 12 reference gaps
    assert_eq!(samples.len(), 88);
    for point in &samples.points {
        assert_relative_eq!(point.reference, point.model * 0.8 + 5.0, epsilon = 1e-9);
    }

    let stats = ComparisonStats::from_samples(&samples).expect("Stats should be available");
    assert_relative_eq!(stats.slope, 0.8, epsilon = 1e-9);
    assert_relative_eq!(stats.intercept, 5.0, epsilon = 1e-9);
    assert_relative_eq!(stats.r_squared, 1.0, epsilon = 1e-9);
}

#[test]
fn test_difference_raster() {
    let ctx = context(10);
    let workflow = biomass_comparison(&ctx).expect("Failed to build workflow");
    let difference = workflow
        .materialize(&catalog(), "difference")
        .expect("Failed to compute difference")
        .into_image()
        .unwrap();

    let band = difference.band("Model_minus_CCI").unwrap();
    assert_eq!(band[[0, 0]], None);
    let expected = model_agb(2, 3) - (model_agb(2, 3) * 0.8 + 5.0);
    assert_relative_eq!(band[[2, 3]].unwrap(), expected, epsilon = 1e-9);
}
