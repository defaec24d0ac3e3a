use std::path::{Path, PathBuf};

use aggrid_bins::BinSorter;
use aggrid_core::{Aabb2, AggregationResult, ChannelSpec, Operation, PointSet};
use aggrid_engine::{AggregationRequest, BackendHint, Engine, EngineConfig};
use aggrid_grid::{GridSpec, Identity, Projection};
use aggrid_io::GridReport;
use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nalgebra::{Affine2, Similarity2, Vector2};

// ---------- helpers ----------

fn t0() -> std::time::Instant { std::time::Instant::now() }
fn lap(t: std::time::Instant, label: &str) -> f64 {
    let ms = t.elapsed().as_secs_f64() * 1000.0;
    println!("[{label}] {ms:.1} ms");
    ms
}

fn parse_world(s: &str) -> Result<[f64; 4], String> {
    let v: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{p}': {e}")))
        .collect::<Result<_, _>>()?;
    match v.as_slice() {
        &[x, y, w, h] => Ok([x, y, w, h]),
        _ => Err(format!("expected x,y,width,height, got {} values", v.len())),
    }
}

fn load_config(path: Option<&Path>, threads: Option<usize>) -> Result<EngineConfig> {
    let mut cfg = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parse {}", p.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(n) = threads {
        cfg.parallel.num_threads = n;
    }
    Ok(cfg)
}

/// Count channel plus, when weight columns are given, one value channel over them.
fn channel_specs(weights: &[String], op: &str) -> Vec<ChannelSpec> {
    let mut specs = vec![ChannelSpec::count("count").with_min_max(true, true)];
    if !weights.is_empty() {
        let cols: Vec<&str> = weights.iter().map(String::as_str).collect();
        specs.push(ChannelSpec::new("value", &cols, op).combined());
    }
    specs
}

fn grid_spec(cell: f64, world: Option<[f64; 4]>) -> GridSpec {
    match world {
        Some([x, y, w, h]) => GridSpec::World { origin: [x, y], width: w, height: h, cell_size: [cell, cell] },
        None => GridSpec::Screen { cell_size: [cell, cell], world_origin: [0.0, 0.0] },
    }
}

fn print_result(res: &AggregationResult) {
    for ch in &res.channels {
        let cells = ch.non_empty_cells().count();
        println!(
            "  {:<8} {:<4} non-empty={:<7} points={:<9} min={:?} max={:?}",
            ch.id,
            ch.operation,
            cells,
            ch.total_count(),
            &ch.global_min[..ch.size],
            &ch.global_max[..ch.size],
        );
    }
}

/// Largest (absolute, relative) difference between two results' cell slots.
fn max_deviation(a: &AggregationResult, b: &AggregationResult) -> (f32, f32) {
    let mut abs = 0.0f32;
    let mut rel = 0.0f32;
    for (ca, cb) in a.channels.iter().zip(&b.channels) {
        for (&x, &y) in ca.cells.iter().zip(&cb.cells) {
            if x == y { continue; }
            let d = (x - y).abs();
            abs = abs.max(d);
            rel = rel.max(d / x.abs().max(y.abs()));
        }
    }
    (abs, rel)
}

// ---------- CLI ----------

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg { Auto, Sequential, Parallel }

impl From<BackendArg> for BackendHint {
    fn from(b: BackendArg) -> Self {
        match b {
            BackendArg::Auto => BackendHint::Auto,
            BackendArg::Sequential => BackendHint::ForceSequential,
            BackendArg::Parallel => BackendHint::ForceParallel,
        }
    }
}

#[derive(Parser)]
#[command(name = "aggrid", version, about = "aggrid — weighted point aggregation into grids")]
struct Args { #[command(subcommand)] cmd: Cmd }

#[derive(Subcommand)]
enum Cmd {
    /// Print point count, bounds and attribute columns (PLY / CSV)
    Info { input: PathBuf },

    /// Aggregate points into a grid and write the result as JSON
    Grid {
        input: PathBuf, output: PathBuf,
        #[arg(short, long, default_value_t = 1.0)] cell: f64,
        /// weight column (repeat for up to 3 components); none counts points
        #[arg(short, long)] weight: Vec<String>,
        #[arg(long, default_value = "sum")] op: String,
        /// fixed grid extent "x,y,width,height"; fitted to the points otherwise
        #[arg(long, value_parser = parse_world)] world: Option<[f64; 4]>,
        #[arg(long, value_enum, default_value_t = BackendArg::Auto)] backend: BackendArg,
        /// rotate positions (degrees, about the origin) before binning
        #[arg(long, default_value_t = 0.0)] rotate_deg: f64,
        /// scale positions before binning
        #[arg(long, default_value_t = 1.0)] scale: f64,
        /// engine configuration (JSON)
        #[arg(long)] config: Option<PathBuf>,
        #[arg(long)] threads: Option<usize>,
    },

    /// Run both backends on the same input and report timing and deviation
    Compare {
        input: PathBuf,
        #[arg(short, long, default_value_t = 1.0)] cell: f64,
        #[arg(short, long)] weight: Vec<String>,
        #[arg(long, default_value = "sum")] op: String,
        #[arg(long)] config: Option<PathBuf>,
        #[arg(long)] threads: Option<usize>,
    },

    /// Bin points by square cell and report per-bin values
    Bins {
        input: PathBuf,
        #[arg(short, long, default_value_t = 1.0)] cell: f64,
        #[arg(short, long)] weight: Option<String>,
        #[arg(long, default_value = "mean")] op: String,
        /// percentile window for the value range
        #[arg(long, default_value_t = 5.0)] lower: f64,
        #[arg(long, default_value_t = 95.0)] upper: f64,
    },

    /// Rewrite a point file as ASCII PLY
    Convert { input: PathBuf, output: PathBuf },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.cmd {
        Cmd::Info { input } => cmd_info(&input),
        Cmd::Grid { input, output, cell, weight, op, world, backend, rotate_deg, scale, config, threads } => {
            let cfg = load_config(config.as_deref(), threads)?;
            cmd_grid(&input, &output, cell, &weight, &op, world, backend.into(), rotate_deg, scale, cfg)
        }
        Cmd::Compare { input, cell, weight, op, config, threads } => {
            let cfg = load_config(config.as_deref(), threads)?;
            cmd_compare(&input, cell, &weight, &op, cfg)
        }
        Cmd::Bins { input, cell, weight, op, lower, upper } =>
            cmd_bins(&input, cell, weight.as_deref(), &op, [lower, upper]),
        Cmd::Convert { input, output } => cmd_convert(&input, &output),
    }
}

// ---------- commands ----------

fn cmd_info(path: &Path) -> Result<()> {
    let pts = aggrid_io::read_auto(path)?;
    println!("points: {}", pts.len());
    if let Some(bb) = Aabb2::from_points(pts.positions()) {
        println!("bounds: [{:.3}, {:.3}] .. [{:.3}, {:.3}]  ({:.3} x {:.3})",
                 bb.min[0], bb.min[1], bb.max[0], bb.max[1], bb.width(), bb.height());
    }
    let mut names: Vec<&String> = pts.attrs_f32.keys().collect();
    names.sort();
    for k in names {
        let col = &pts.attrs_f32[k];
        let lo = col.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = col.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        println!("  {k:<12} min={lo} max={hi}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_grid(
    input: &Path, output: &Path, cell: f64, weights: &[String], op: &str, world: Option<[f64; 4]>,
    backend: BackendHint, rotate_deg: f64, scale: f64, cfg: EngineConfig,
) -> Result<()> {
    ensure!(weights.len() <= 3, "at most 3 weight columns, got {}", weights.len());
    let pts: PointSet = aggrid_io::read_auto(input)?;
    let specs = channel_specs(weights, op);

    let affine: Option<Affine2<f64>> = (rotate_deg != 0.0 || scale != 1.0).then(|| {
        let sim = Similarity2::new(Vector2::zeros(), rotate_deg.to_radians(), scale);
        Affine2::from_matrix_unchecked(sim.to_homogeneous())
    });
    let projection: &dyn Projection = match &affine {
        Some(a) => a,
        None => &Identity,
    };

    let mut engine = Engine::new(cfg);
    let t = t0();
    let req = AggregationRequest::new(&pts, &specs, grid_spec(cell, world))
        .projection(projection)
        .backend(backend);
    let out = engine.aggregate(req)?;
    lap(t, "aggregate");

    log::info!("{} points -> {}x{} grid on {:?}", pts.len(), out.grid.num_col, out.grid.num_row, out.backend);
    println!("grid: {} x {} cells, origin {:?}, backend {:?}", out.grid.num_col, out.grid.num_row, out.grid.origin, out.backend);
    print_result(out.result);

    let report = GridReport { grid: out.grid, backend: format!("{:?}", out.backend), result: out.result };
    aggrid_io::write_result_json(output, &report)?;
    println!("wrote {}", output.display());
    Ok(())
}

fn cmd_compare(input: &Path, cell: f64, weights: &[String], op: &str, cfg: EngineConfig) -> Result<()> {
    ensure!(weights.len() <= 3, "at most 3 weight columns, got {}", weights.len());
    let pts = aggrid_io::read_auto(input)?;
    let specs = channel_specs(weights, op);
    let spec = grid_spec(cell, None);

    let mut engine = Engine::new(cfg);
    let t = t0();
    let seq = engine
        .aggregate(AggregationRequest::new(&pts, &specs, spec).backend(BackendHint::ForceSequential))?
        .result
        .clone();
    let seq_ms = lap(t, "sequential");

    let t = t0();
    let par = engine.aggregate(AggregationRequest::new(&pts, &specs, spec).backend(BackendHint::ForceParallel))?;
    let par_ms = lap(t, &format!("{:?}", par.backend));

    let (abs, rel) = max_deviation(&seq, par.result);
    println!("speedup: {:.2}x", seq_ms / par_ms.max(1e-6));
    println!("max deviation: abs={abs:e} rel={rel:e}");
    print_result(par.result);
    Ok(())
}

fn cmd_bins(input: &Path, cell: f64, weight: Option<&str>, op: &str, window: [f64; 2]) -> Result<()> {
    ensure!(cell > 0.0 && cell.is_finite(), "cell size must be positive, got {cell}");
    let op: Operation = op.parse()?;
    let pts = aggrid_io::read_auto(input)?;
    let col: Option<&[f32]> = match weight {
        Some(w) => Some(
            pts.attrs_f32
                .get(w)
                .map(Vec::as_slice)
                .with_context(|| format!("no column '{w}' in {}", input.display()))?,
        ),
        None => None,
    };

    let idx: Vec<usize> = (0..pts.len()).collect();
    let t = t0();
    let sorter = BinSorter::new(
        &idx,
        |&i| {
            let [x, y] = pts.position(i);
            let key = ((x / cell).floor(), (y / cell).floor());
            (key.0.is_finite() && key.1.is_finite()).then_some((key.0 as i64, key.1 as i64))
        },
        |members| match col {
            Some(c) => op.reduce(members.iter().map(|&&i| c[i] as f64)),
            None => Some(members.len() as f64),
        },
    );
    lap(t, "bin");

    println!("bins: {}  points: {}", sorter.len(), sorter.total_count());
    println!("value: min={} max={}", sorter.min_value(), sorter.max_value());
    if let Some([lo, hi]) = sorter.value_range(Some(window)) {
        println!("range p{}..p{}: [{lo}, {hi}]", window[0], window[1]);
    }
    if let Some(top) = sorter.bins().iter().max_by_key(|b| b.count) {
        println!("densest bin {:?}: {} points, value {}", top.id, top.count, top.value);
    }
    Ok(())
}

fn cmd_convert(input: &Path, output: &Path) -> Result<()> {
    let pts = aggrid_io::read_auto(input)?;
    aggrid_io::write_ply_ascii(output, &pts)?;
    println!("converted {} points -> {}", pts.len(), output.display());
    Ok(())
}
