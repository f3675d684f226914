use canopy::core::Region;
use canopy::io::export::write_asset_dir;
use canopy::io::{stack_time_series, vectorize_time_series};
use canopy::types::Cell;
use canopy::{
    biomass_comparison, landcover_masking, Catalog, DirectoryCatalog, ExportSink, GeoTransform, LocalExporter,
    PipelineConfig, PipelineContext, PropertyValue, Raster,
};
use chrono::{TimeZone, Utc};
use ndarray::{array, Array2};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const REGION_ID: &str = "projects/ee-komba/assets/bbox_wirong";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_region(root: &Path) {
    let path = root.join(format!("{}.geojson", REGION_ID));
    fs::create_dir_all(path.parent().unwrap()).expect("Failed to create region directory");
    fs::write(
        path,
        r#"{"type": "Feature", "properties": {}, "geometry": {"type": "Polygon",
            "coordinates": [[[0, 0], [300, 0], [300, 300], [0, 300], [0, 0]]]}}"#,
    )
    .expect("Failed to write region");
}

fn ndvi(year: i32, offset: f64) -> Raster {
    let values = Array2::from_shape_fn((3, 3), |(r, c)| Some(0.1 * (r * 3 + c) as f64 + offset));
    Raster::new((3, 3), GeoTransform::north_up(0.0, 300.0, 100.0))
        .with_band("NDVI", values)
        .expect("Failed to build NDVI")
        .with_time_start(Utc.with_ymd_and_hms(year, 5, 1, 0, 0, 0).unwrap())
        .with_property("year", year)
}

#[test]
fn test_exported_assets_feed_the_next_campaign() {
    init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = dir.path();
    write_region(root);

    let config = PipelineConfig { years: vec![2019, 2021], ..PipelineConfig::default() };
    let exporter = LocalExporter::new(root);
    for (year, offset) in [(2019, 0.0), (2021, 0.05)] {
        let id = format!("{}NDVI_{}", config.asset_path, year);
        exporter.write_image(&id, &ndvi(year, offset)).expect("Failed to write NDVI asset");
    }

    // WorldCover: one water pixel (80) and one built-up pixel (50)
    let worldcover = Raster::new((3, 3), GeoTransform::north_up(0.0, 300.0, 100.0))
        .with_band(
            "Map",
            array![
                [Some(10.0), Some(20.0), Some(80.0)],
                [Some(30.0), Some(60.0), Some(10.0)],
                [Some(50.0), Some(10.0), Some(10.0)]
            ],
        )
        .unwrap()
        .with_time_start(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    write_asset_dir(&root.join("ESA/WorldCover/v200/2021"), &worldcover).expect("Failed to write WorldCover");

    let catalog = DirectoryCatalog::new(root);
    let ctx = PipelineContext::from_catalog_region(config, &catalog).expect("Failed to load region");
    let areas = vec![
        ("5".to_string(), Arc::new(Region::rectangle(0.0, 0.0, 300.0, 300.0).unwrap())),
        ("8".to_string(), Arc::new(Region::rectangle(0.0, 200.0, 200.0, 300.0).unwrap())),
    ];
    let workflow = landcover_masking(&ctx, &areas).expect("Failed to build workflow");
    let results = workflow.run(&catalog, &exporter);
    assert_eq!(results.len(), 4);
    for result in &results {
        assert!(result.is_ok(), "Export failed: {:?}", result);
    }

    let masked = catalog
        .asset("projects/ee-komba/assets/kaya/masked/NDVI_Masked_2021_5")
        .expect("Masked asset should round-trip");
    let band = masked.band("NDVI").unwrap();
    assert_eq!(band[[0, 2]], None);
    assert_eq!(band[[2, 0]], None);
    assert_eq!(band[[1, 1]], Some(0.1 * 4.0 + 0.05));
    assert_eq!(masked.property("year"), Some(&PropertyValue::Number(2021.0)));

    let small = catalog
        .asset("projects/ee-komba/assets/kaya/masked/NDVI_Masked_2019_8")
        .expect("Masked asset should round-trip");
    assert_eq!(small.shape(), (1, 2));
    assert_eq!(small.valid_count("NDVI").unwrap(), 2);
}

#[test]
fn test_yearly_assets_vectorize_to_csv() {
    init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let exporter = LocalExporter::new(dir.path());
    let catalog = DirectoryCatalog::new(dir.path());

    let years = [2013, 2015];
    for year in years {
        let values = array![[Some(0.0), Some(12.7)], [None, Some(40.2)]];
        let raster = Raster::new((2, 2), GeoTransform::north_up(1000.0, 5000.0, 100.0))
            .with_band("NDVI", values)
            .unwrap()
            .with_property("year", year);
        exporter.write_image(&format!("kaya/NDVI_{}", year), &raster).unwrap();
    }

    let images = years
        .iter()
        .map(|year| catalog.asset(&format!("kaya/NDVI_{}", year)))
        .collect::<Result<Vec<_>, _>>()
        .expect("Failed to read yearly assets");
    let table = vectorize_time_series(&stack_time_series(&images, "NDVI").unwrap()).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.rows[1][1], Cell::Float(1100.0));
    assert_eq!(table.rows[1][2], Cell::Float(4900.0));

    let receipt = exporter.write_table("ndvi_timeseries", &table).expect("Failed to write CSV");
    let text = fs::read_to_string(&receipt.location).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("pixel_id,x_coord,y_coord,y2013,y2015"));
    assert_eq!(lines.next(), Some("1,1100,5000,12,12"));
    assert_eq!(lines.next(), Some("2,1100,4900,40,40"));
}

#[test]
fn test_comparison_writes_difference_and_table() {
    init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = dir.path();
    write_region(root);

    let model = Raster::new((3, 3), GeoTransform::north_up(0.0, 300.0, 100.0))
        .with_constant_band("AGB_MgHa", Some(40.0))
        .unwrap();
    let cci = Raster::new((3, 3), GeoTransform::north_up(0.0, 300.0, 100.0))
        .with_constant_band("AGB", Some(55.0))
        .unwrap()
        .with_time_start(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    write_asset_dir(&root.join("projects/ee-komba/assets/AGB_2021"), &model).unwrap();
    write_asset_dir(&root.join("projects/sat-io/open-datasets/ESA/ESA_CCI_AGB/2021"), &cci).unwrap();

    let mut config = PipelineConfig::default();
    config.comparison.difference_asset = Some("projects/ee-komba/assets/AGB_2021_minus_CCI".to_string());
    let catalog = DirectoryCatalog::new(root);
    let ctx = PipelineContext::from_catalog_region(config, &catalog).unwrap();
    let workflow = biomass_comparison(&ctx).unwrap();

    let exporter = LocalExporter::new(root);
    let results = workflow.run(&catalog, &exporter);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));

    let difference = catalog.asset("projects/ee-komba/assets/AGB_2021_minus_CCI").unwrap();
    assert!(difference.band("Model_minus_CCI").unwrap().iter().all(|v| *v == Some(-15.0)));
    let csv = fs::read_to_string(root.join("AGB_Model_vs_CCI_SamplePoints.csv")).unwrap();
    // header plus nine sampled pixels
    assert_eq!(csv.lines().count(), 10);
}
