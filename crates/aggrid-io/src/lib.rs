//! aggrid-io — point input (ASCII PLY, CSV) and JSON output of aggregation results.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use aggrid_core::{AggregationResult, Grid, PointSet};
use anyhow::{anyhow, bail, ensure, Context, Result};
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Ply, Property};
use serde::Serialize;

/// Read the `vertex` element of a PLY file. `x`/`y` become positions, every
/// other scalar property becomes an f32 column (`z` included).
pub fn read_ply(path: &Path) -> Result<PointSet> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(f);
    let parser = Parser::<DefaultElement>::new();
    let ply: Ply<DefaultElement> = parser
        .read_ply(&mut reader)
        .with_context(|| format!("parse {}", path.display()))?;

    let vertex = ply.payload.get("vertex").ok_or_else(|| anyhow!("PLY missing 'vertex' element"))?;

    let mut pts = PointSet::default();
    pts.reserve(vertex.len());
    for el in vertex {
        let x = get_f64(el, "x")?;
        let y = get_f64(el, "y")?;
        pts.push(x, y);
        for (k, v) in el.iter() {
            if k == "x" || k == "y" { continue; }
            if let Some(v) = scalar(v) {
                pts.attrs_f32.entry(k.clone()).or_default().push(v as f32);
            }
        }
    }
    for (k, col) in &pts.attrs_f32 {
        ensure!(col.len() == pts.len(), "property '{}' present on {} of {} vertices", k, col.len(), pts.len());
    }
    Ok(pts)
}

fn scalar(p: &Property) -> Option<f64> {
    Some(match *p {
        Property::Char(v) => v as f64,
        Property::UChar(v) => v as f64,
        Property::Short(v) => v as f64,
        Property::UShort(v) => v as f64,
        Property::Int(v) => v as f64,
        Property::UInt(v) => v as f64,
        Property::Float(v) => v as f64,
        Property::Double(v) => v,
        _ => return None,
    })
}

fn get_f64(el: &DefaultElement, key: &str) -> Result<f64> {
    match el.get(key) {
        Some(p) => scalar(p).ok_or_else(|| anyhow!("property '{}' is not a scalar", key)),
        None => bail!("missing property '{}'", key),
    }
}

/// Comma-separated text with a header row naming the columns; `x` and `y` are required.
pub fn read_csv(path: &Path) -> Result<PointSet> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut lines = BufReader::new(f).lines();
    let header = lines.next().ok_or_else(|| anyhow!("{}: empty file", path.display()))??;
    let names: Vec<String> = header.split(',').map(|s| s.trim().to_string()).collect();
    let col = |n: &str| names.iter().position(|h| h == n);
    let (Some(ix), Some(iy)) = (col("x"), col("y")) else {
        bail!("{}: header needs 'x' and 'y' columns, got {:?}", path.display(), names);
    };

    let mut pts = PointSet::default();
    for (row, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        let vals: Vec<f64> = line
            .split(',')
            .map(|s| s.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("{}: row {}", path.display(), row + 2))?;
        ensure!(vals.len() == names.len(), "{}: row {} has {} fields, header has {}", path.display(), row + 2, vals.len(), names.len());
        pts.push(vals[ix], vals[iy]);
        for (i, name) in names.iter().enumerate() {
            if i == ix || i == iy { continue; }
            pts.attrs_f32.entry(name.clone()).or_default().push(vals[i] as f32);
        }
    }
    Ok(pts)
}

/// Pick a reader by extension.
pub fn read_auto(path: &Path) -> Result<PointSet> {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("ply") => read_ply(path),
        Some("csv") => read_csv(path),
        _ => read_ply(path).map_err(|e| anyhow!("unsupported file (expected .ply or .csv): {e}")),
    }
}

/// ASCII PLY writer for point sets: `x y` then every column in name order.
pub fn write_ply_ascii(path: &Path, pts: &PointSet) -> Result<()> {
    let n = pts.len();
    let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {}", path.display()))?);

    let mut keys: Vec<&str> = pts
        .attrs_f32
        .iter()
        .filter_map(|(k, v)| (v.len() == n).then_some(k.as_str()))
        .collect();
    keys.sort_unstable();

    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", n)?;
    writeln!(w, "property double x")?;
    writeln!(w, "property double y")?;
    for k in &keys {
        writeln!(w, "property float {}", k)?;
    }
    writeln!(w, "end_header")?;

    for i in 0..n {
        write!(w, "{} {}", pts.x[i], pts.y[i])?;
        for k in &keys {
            write!(w, " {}", pts.attrs_f32[*k][i])?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

/// Serialized form of one aggregation: the grid it ran on and all channels.
/// Non-finite global extrema (empty channels) are written as `null`.
#[derive(Serialize)]
pub struct GridReport<'a> {
    pub grid: &'a Grid,
    pub backend: String,
    pub result: &'a AggregationResult,
}

pub fn write_result_json(path: &Path, report: &GridReport<'_>) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer(&mut w, report).context("serialize aggregation result")?;
    w.flush()?;
    Ok(())
}
