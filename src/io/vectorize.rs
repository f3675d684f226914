//! Flatten multi-year rasters into per-pixel time-series tables

use crate::types::{CanopyError, CanopyResult, Cell, Raster, Table};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

const KEY_COLUMNS: [&str; 4] = ["fid", "pixel_id", "x_coord", "y_coord"];

/// Column / band label for a year, e.g. `y2013`
pub fn year_label(year: i32) -> String {
    format!("y{}", year)
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Stack band `band` of each yearly image into one raster with a `y<year>` band per image.
///
/// Every image needs a numeric `year` property and the grid of the first image.
pub fn stack_time_series(images: &[Raster], band: &str) -> CanopyResult<Raster> {
    let first = images
        .first()
        .ok_or_else(|| CanopyError::InvalidConfig("No images to stack".to_string()))?;
    let mut stack = Raster::new(first.shape(), first.geo_transform);

    for image in images {
        if !image.same_grid(first) {
            return Err(CanopyError::GridMismatch(
                "Yearly images must share one grid to be stacked".to_string(),
            ));
        }
        let year = image
            .property("year")
            .and_then(|p| p.as_f64())
            .ok_or_else(|| CanopyError::SchemaMismatch("Image has no 'year' property".to_string()))?;
        stack = stack.with_band(&year_label(year as i32), image.band(band)?.clone())?;
    }
    log::debug!("Stacked {} yearly '{}' bands", images.len(), band);
    Ok(stack)
}

/// One row per pixel: `pixel_id, x_coord, y_coord`, then one column per band.
///
/// Coordinates are the pixel's top-left corner rounded to six decimals, values are
/// truncated to integers. Pixels where every band is zero or no-data are skipped;
/// the remaining pixels are numbered from 1 in row-major order.
pub fn vectorize_time_series(stack: &Raster) -> CanopyResult<Table> {
    let names = stack.band_names();
    let grids: Vec<_> = names
        .iter()
        .map(|name| stack.band(name))
        .collect::<CanopyResult<_>>()?;

    let mut columns = vec!["pixel_id".to_string(), "x_coord".to_string(), "y_coord".to_string()];
    columns.extend(names.iter().map(|n| n.to_string()));
    let mut table = Table::new(columns);

    let (rows, cols) = stack.shape();
    let gt = &stack.geo_transform;
    let mut pixel_id = 0i64;
    for row in 0..rows {
        for col in 0..cols {
            let values: Vec<Option<i64>> = grids
                .iter()
                .map(|g| g[[row, col]].map(|v| v.trunc() as i64))
                .collect();
            if values.iter().all(|v| v.unwrap_or(0) == 0) {
                continue;
            }
            pixel_id += 1;
            let (x, y) = gt.pixel_corner(row as f64, col as f64);
            let mut cells = vec![Cell::Int(pixel_id), Cell::Float(round6(x)), Cell::Float(round6(y))];
            cells.extend(values.into_iter().map(|v| v.map_or(Cell::Empty, Cell::Int)));
            table.push_row(cells)?;
        }
    }

    log::info!("Vectorized {} of {} pixels", table.len(), rows * cols);
    Ok(table)
}

/// Coordinates in micro-units, north to south then west to east
type CoordKey = (Reverse<i64>, i64);

fn column_index(table: &Table, name: &str) -> CanopyResult<usize> {
    table
        .columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| CanopyError::SchemaMismatch(format!("Table has no '{}' column", name)))
}

fn micro(cell: &Cell) -> CanopyResult<i64> {
    let v = match cell {
        Cell::Float(v) => *v,
        Cell::Int(v) => *v as f64,
        Cell::Empty => {
            return Err(CanopyError::SchemaMismatch("Pixel row has no coordinate".to_string()))
        }
    };
    Ok((v * 1e6).round() as i64)
}

/// Outer join of pixel tables (e.g. one per year) on `(x_coord, y_coord)`.
///
/// Value columns are collected in table order and must be unique across tables.
/// A pixel missing from a table gets empty cells for that table's columns. Rows
/// are ordered north to south, then west to east, and `pixel_id` is renumbered
/// from 1.
pub fn merge_by_coords(tables: &[Table]) -> CanopyResult<Table> {
    let mut columns = vec!["pixel_id".to_string(), "x_coord".to_string(), "y_coord".to_string()];
    let mut layouts = Vec::with_capacity(tables.len());
    for table in tables {
        let x = column_index(table, "x_coord")?;
        let y = column_index(table, "y_coord")?;
        let values: Vec<usize> = (0..table.columns.len())
            .filter(|&i| !KEY_COLUMNS.contains(&table.columns[i].as_str()))
            .collect();
        for &i in &values {
            if columns.contains(&table.columns[i]) {
                return Err(CanopyError::SchemaMismatch(format!(
                    "Column '{}' appears in more than one table",
                    table.columns[i]
                )));
            }
            columns.push(table.columns[i].clone());
        }
        layouts.push((x, y, values));
    }

    let width = columns.len() - 3;
    let mut merged: BTreeMap<CoordKey, Vec<Cell>> = BTreeMap::new();
    let mut offset = 0;
    for (table, (x, y, values)) in tables.iter().zip(&layouts) {
        let mut seen = HashSet::new();
        for row in &table.rows {
            let (kx, ky) = (micro(&row[*x])?, micro(&row[*y])?);
            if !seen.insert((kx, ky)) {
                return Err(CanopyError::SchemaMismatch(format!(
                    "Pixel at ({}, {}) appears twice in one table",
                    kx as f64 / 1e6,
                    ky as f64 / 1e6
                )));
            }
            let cells = merged.entry((Reverse(ky), kx)).or_insert_with(|| vec![Cell::Empty; width]);
            for (k, &i) in values.iter().enumerate() {
                cells[offset + k] = row[i].clone();
            }
        }
        offset += values.len();
    }

    let mut table = Table::new(columns);
    for (pixel_id, ((Reverse(ky), kx), cells)) in merged.into_iter().enumerate() {
        let mut row = vec![
            Cell::Int(pixel_id as i64 + 1),
            Cell::Float(kx as f64 / 1e6),
            Cell::Float(ky as f64 / 1e6),
        ];
        row.extend(cells);
        table.push_row(row)?;
    }
    log::info!("Merged {} tables into {} pixels", tables.len(), table.len());
    Ok(table)
}
