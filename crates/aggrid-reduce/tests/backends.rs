//! Behaviour shared by both reduction backends, plus sequential/parallel equivalence.

use aggrid_core::{
    normalize_channels, AggError, AggregationResult, ChannelResult, ChannelSpec, Grid, PointSet,
    WeightChannel, COUNT_SLOT, ELEMENT_COUNT,
};
use aggrid_reduce::{
    AggregateInput, Aggregator, Backend, ParallelAggregator, ParallelConfig, Precision,
    SequentialAggregator,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INF: f32 = f32::INFINITY;

fn parallel(precision: Precision) -> ParallelAggregator {
    ParallelAggregator::new(&ParallelConfig {
        num_threads: 4,
        min_points_per_task: 2,
        precision,
        ..Default::default()
    })
    .expect("thread pool should build")
}

fn backends() -> Vec<Box<dyn Aggregator>> {
    vec![Box::new(SequentialAggregator), Box::new(parallel(Precision::Double))]
}

fn run(agg: &dyn Aggregator, points: &PointSet, channels: &[WeightChannel], grid: &Grid) -> AggregationResult {
    let positions: Vec<[f64; 2]> = points.positions().collect();
    let input = AggregateInput { positions: &positions, points, channels, grid };
    agg.aggregate(&input).expect("aggregation should succeed")
}

/// (0,0) (0,0) (150,0) (150,150) with weights 1..4.
fn four_points() -> PointSet {
    let mut p = PointSet::default();
    for (x, y, w) in [(0.0, 0.0, 1.0), (0.0, 0.0, 2.0), (150.0, 0.0, 3.0), (150.0, 150.0, 4.0)] {
        p.push_with(x, y, &[("w", w), ("v", 10.0 * w)]);
    }
    p
}

fn grid_2x2() -> Grid {
    Grid { num_col: 2, num_row: 2, cell_size: [100.0, 100.0], origin: [0.0, 0.0] }
}

fn channels(specs: &[ChannelSpec]) -> Vec<WeightChannel> {
    normalize_channels(specs).expect("valid channel specs")
}

#[test]
fn sum_scenario() {
    let ch = channels(&[ChannelSpec::new("w", &["w"], "SUM")]);
    for agg in backends() {
        let r = run(agg.as_ref(), &four_points(), &ch, &grid_2x2());
        let w = &r.channels[0];
        assert_eq!(w.cells, vec![
            3.0, 0.0, 0.0, 2.0, // (0,0)
            3.0, 0.0, 0.0, 1.0, // (1,0)
            0.0, 0.0, 0.0, 0.0, // (0,1)
            4.0, 0.0, 0.0, 1.0, // (1,1)
        ], "{:?}", agg.backend());
        assert_eq!(w.global_total[0], 10.0);
        assert_eq!(w.total_count(), 4.0);
        assert_eq!(w.global_count[0], 3.0);
        assert_eq!(w.value(2, 0), None);
        // extrema not requested
        assert_eq!(w.global_min, [INF, INF, INF, 4.0]);
        assert_eq!(w.global_max, [-INF, -INF, -INF, 4.0]);
        assert_eq!(w.min_max, None);
    }
}

#[test]
fn combined_min_max_packs_over_non_empty_cells() {
    let ch = channels(&[ChannelSpec::new("w", &["w"], "sum").combined()]);
    for agg in backends() {
        let r = run(agg.as_ref(), &four_points(), &ch, &grid_2x2());
        let w = &r.channels[0];
        // max over cells {3, 3, 4}; min over the same cells, the empty cell's 0 excluded
        assert_eq!(w.min_max, Some([4.0, -INF, -INF, 3.0]), "{:?}", agg.backend());
        assert_eq!(w.global_max[0], 4.0);
        assert_eq!(w.global_min[0], 3.0);
    }
}

#[test]
fn separate_min_max_match_packed_values() {
    let packed = channels(&[ChannelSpec::new("w", &["w"], "sum").combined()]);
    let separate = channels(&[ChannelSpec::new("w", &["w"], "sum").with_min_max(true, true)]);
    for agg in backends() {
        let a = run(agg.as_ref(), &four_points(), &packed, &grid_2x2());
        let b = run(agg.as_ref(), &four_points(), &separate, &grid_2x2());
        assert_eq!(a.channels[0].global_max, b.channels[0].global_max);
        assert_eq!(a.channels[0].global_min, b.channels[0].global_min);
        assert_eq!(b.channels[0].global_min, [3.0, INF, INF, 4.0]);
    }
}

#[test]
fn min_max_and_mean_operations() {
    let ch = channels(&[
        ChannelSpec::new("lo", &["w"], "MIN").with_min_max(true, false),
        ChannelSpec::new("hi", &["w"], "MAX").with_min_max(false, true),
        ChannelSpec::new("avg", &["w"], "MEAN").with_min_max(true, true),
    ]);
    for agg in backends() {
        let r = run(agg.as_ref(), &four_points(), &ch, &grid_2x2());
        let (lo, hi, avg) = (&r.channels[0], &r.channels[1], &r.channels[2]);

        assert_eq!(lo.value(0, 0), Some(1.0));
        assert_eq!(lo.cells[2 * ELEMENT_COUNT], INF);
        assert_eq!(lo.count(0), 2.0);
        assert_eq!(lo.global_min[0], 1.0);

        assert_eq!(hi.value(0, 0), Some(2.0));
        assert_eq!(hi.cells[2 * ELEMENT_COUNT], -INF);
        assert_eq!(hi.global_max[0], 4.0);

        // stored as sum, read as mean
        assert_eq!(avg.cells[0], 3.0);
        assert_eq!(avg.value(0, 0), Some(1.5));
        assert_eq!(avg.global_min[0], 1.5);
        assert_eq!(avg.global_max[0], 4.0);
        assert_eq!(avg.global_total[0], 1.5 + 3.0 + 4.0);
    }
}

#[test]
fn mean_globals_are_taken_over_cell_means() {
    let mut pts = PointSet::default();
    for (x, y, w) in [(10.0, 10.0, 1.0), (20.0, 20.0, 3.0), (150.0, 10.0, 10.0)] {
        pts.push_with(x, y, &[("w", w)]);
    }
    let ch = channels(&[ChannelSpec::new("avg", &["w"], "mean").with_min_max(true, true)]);
    for agg in backends() {
        let avg = &run(agg.as_ref(), &pts, &ch, &grid_2x2()).channels[0];
        assert_eq!((avg.value(0, 0), avg.value(1, 0)), (Some(2.0), Some(10.0)));
        assert_eq!(avg.global_min[0], 2.0);
        assert_eq!(avg.global_max[0], 10.0);
        assert_eq!(avg.global_total[0], 12.0);
        assert_eq!(avg.global_count[0], 2.0);
        assert_eq!(avg.global_total[COUNT_SLOT], 3.0);
        // point-weighted mean from the stored sums
        let sums: f32 = avg.cells.chunks_exact(ELEMENT_COUNT).map(|s| s[0]).sum();
        assert_eq!(sums / avg.total_count(), 14.0 / 3.0);
    }
}

#[test]
fn multi_component_channel() {
    let ch = channels(&[ChannelSpec::new("wv", &["w", "v"], "sum").with_min_max(false, true)]);
    for agg in backends() {
        let r = run(agg.as_ref(), &four_points(), &ch, &grid_2x2());
        let c = &r.channels[0];
        assert_eq!(&c.cells[..ELEMENT_COUNT], &[3.0, 30.0, 0.0, 2.0]);
        assert_eq!(c.global_max, [4.0, 40.0, -INF, 4.0]);
        assert_eq!(c.global_total, [10.0, 100.0, 0.0, 4.0]);
        assert_eq!(c.global_count, [3.0, 3.0, 0.0, 4.0]);
    }
}

#[test]
fn points_on_cell_boundaries_use_half_open_intervals() {
    let grid = Grid { num_col: 4, num_row: 1, cell_size: [2.5, 4.0], origin: [10.0, -5.0] };
    let mut pts = PointSet::default();
    for k in 0..=4 {
        pts.push(grid.origin[0] + k as f64 * grid.cell_size[0], grid.origin[1]);
    }
    let ch = channels(&[ChannelSpec::count("n")]);
    for agg in backends() {
        let r = run(agg.as_ref(), &pts, &ch, &grid);
        let n = &r.channels[0];
        for k in 0..4 {
            assert_eq!(n.count(k), 1.0, "cell {k} on {:?}", agg.backend());
        }
        // k == 4 sits on the grid's upper edge and is dropped
        assert_eq!(n.total_count(), 4.0);
    }
}

#[test]
fn empty_input_keeps_identities() {
    let grid = Grid { num_col: 3, num_row: 2, cell_size: [1.0, 1.0], origin: [0.0, 0.0] };
    let ch = channels(&[
        ChannelSpec::new("w", &["w"], "mean").with_min_max(true, true),
        ChannelSpec::new("m", &["w"], "max").combined(),
    ]);
    let mut pts = PointSet::default();
    pts.attrs_f32.insert("w".into(), Vec::new());
    for agg in backends() {
        let r = run(agg.as_ref(), &pts, &ch, &grid);
        assert!(r.is_empty());
        for c in &r.channels {
            assert_eq!(c.num_cells(), 6);
            assert!(c.cells.chunks_exact(ELEMENT_COUNT).all(|s| s[COUNT_SLOT] == 0.0));
            assert!(!c.global_min[0].is_nan() && !c.global_max[0].is_nan());
            assert_eq!(c.global_min[0], INF);
            assert_eq!(c.global_max[0], -INF);
            assert_eq!(c.global_total, [0.0; ELEMENT_COUNT]);
        }
        assert_eq!(r.channels[1].min_max, Some([-INF, -INF, -INF, INF]));
    }
}

#[test]
fn points_outside_the_grid_are_dropped() {
    let grid = Grid { num_col: 1, num_row: 1, cell_size: [10.0, 10.0], origin: [0.0, 0.0] };
    let mut pts = PointSet::default();
    for p in [[-1.0, 5.0], [5.0, 10.0], [10.0, 0.0], [f64::NAN, 1.0]] {
        pts.push(p[0], p[1]);
    }
    let ch = channels(&[ChannelSpec::count("n").with_min_max(true, true)]);
    for agg in backends() {
        let r = run(agg.as_ref(), &pts, &ch, &grid);
        assert!(r.is_empty());
        assert_eq!(r.channels[0].global_min[0], INF);
    }
}

#[test]
fn zero_cell_grid_is_not_an_error() {
    let ch = channels(&[ChannelSpec::count("n")]);
    for agg in backends() {
        let r = run(agg.as_ref(), &four_points(), &ch, &Grid::default());
        assert!(r.channels[0].cells.is_empty());
        assert_eq!(r.channels[0].total_count(), 0.0);
    }
}

#[test]
fn missing_weights_fail_without_touching_the_result() {
    let ch = channels(&[ChannelSpec::new("w", &["nope"], "sum")]);
    let pts = four_points();
    let positions: Vec<[f64; 2]> = pts.positions().collect();
    let grid = grid_2x2();
    for agg in backends() {
        let mut out = AggregationResult::default();
        let input = AggregateInput { positions: &positions, points: &pts, channels: &ch, grid: &grid };
        let err = agg.aggregate_into(&input, &mut out).unwrap_err();
        assert!(matches!(err, AggError::MissingWeights { .. }));
        assert!(out.channels.is_empty());
    }
}

#[test]
#[should_panic(expected = "non-finite weight")]
fn sequential_rejects_non_finite_weights() {
    let mut pts = four_points();
    pts.attrs_f32.get_mut("w").unwrap()[2] = f32::NAN;
    let ch = channels(&[ChannelSpec::new("w", &["w"], "sum")]);
    run(&SequentialAggregator, &pts, &ch, &grid_2x2());
}

#[test]
#[should_panic(expected = "non-finite weight")]
fn parallel_rejects_non_finite_weights() {
    let mut pts = four_points();
    pts.attrs_f32.get_mut("w").unwrap()[3] = f32::INFINITY;
    let ch = channels(&[ChannelSpec::new("w", &["w"], "max")]);
    run(&parallel(Precision::Double), &pts, &ch, &grid_2x2());
}

#[test]
fn disabled_parallel_backend_is_unavailable() {
    let cfg = ParallelConfig { enabled: false, ..Default::default() };
    assert!(matches!(ParallelAggregator::new(&cfg), Err(AggError::BackendUnavailable(_))));
}

#[test]
fn single_precision_matches_on_grid_aligned_data() {
    let ch = channels(&[ChannelSpec::new("w", &["w"], "sum").combined()]);
    let seq = run(&SequentialAggregator, &four_points(), &ch, &grid_2x2());
    let par = run(&parallel(Precision::Single), &four_points(), &ch, &grid_2x2());
    assert_eq!(seq, par);
    assert_eq!(SequentialAggregator.backend(), Backend::Sequential);
}

#[test]
fn oversized_grid_fails_before_allocating() {
    let ch = channels(&[ChannelSpec::count("n")]);
    let grid = Grid { num_col: 1 << 20, num_row: 1 << 20, cell_size: [1.0, 1.0], origin: [0.0, 0.0] };
    let positions: Vec<[f64; 2]> = four_points().positions().collect();
    let pts = four_points();
    let input = AggregateInput { positions: &positions, points: &pts, channels: &ch, grid: &grid };
    for agg in backends() {
        let mut out = AggregationResult::default();
        assert!(matches!(agg.aggregate_into(&input, &mut out), Err(AggError::InvalidGrid(_))));
        assert!(out.channels.is_empty());
    }
}

#[test]
fn f64_positions_on_inexact_cell_edges_bin_identically() {
    let ch = channels(&[ChannelSpec::count("n"), ChannelSpec::new("w", &["w"], "sum")]);
    for (origin, cell) in [(0.1, 0.1), (0.7, 0.3), (1234.567, 0.01), (-3.3, 0.7), (100_000.1, 0.1)] {
        let grid = Grid { num_col: 64, num_row: 64, cell_size: [cell, cell], origin: [origin, origin] };
        let mut pts = PointSet::default();
        for k in 0..64 {
            let edge = origin + k as f64 * cell;
            pts.push_with(edge, origin + (63 - k) as f64 * cell, &[("w", k as f32)]);
        }
        let seq = run(&SequentialAggregator, &pts, &ch, &grid);
        let par = run(&parallel(Precision::Double), &pts, &ch, &grid);
        assert_eq!(seq, par, "origin {origin} cell {cell}");
        // every edge point sits in the cell that starts at it
        for k in 0..64 {
            assert_eq!(seq.channels[0].count(k + (63 - k) * 64), 1.0, "origin {origin} cell {cell} edge {k}");
        }
    }
}

// ---------- equivalence over random data ----------

fn random_points(n: usize, seed: u64) -> PointSet {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut p = PointSet::default();
    for _ in 0..n {
        // f32-representable positions keep Precision::Single on the same cells
        let x = rng.gen_range(-50.0..1050.0f32) as f64;
        let y = rng.gen_range(-50.0..1050.0f32) as f64;
        let int_w = rng.gen_range(0..10) as f32;
        let a = rng.gen_range(0.0..10.0f32);
        let b = rng.gen_range(-5.0..5.0f32);
        p.push_with(x, y, &[("i", int_w), ("a", a), ("b", b)]);
    }
    p
}

fn assert_close(a: f32, b: f32, rel: f32, what: &str) {
    if a.is_infinite() || b.is_infinite() {
        assert_eq!(a, b, "{what}");
        return;
    }
    let tol = rel * a.abs().max(b.abs()).max(1.0);
    assert!((a - b).abs() <= tol, "{what}: {a} vs {b}");
}

fn assert_channel_close(seq: &ChannelResult, par: &ChannelResult, rel: f32) {
    assert_eq!(seq.cells.len(), par.cells.len());
    for (i, (s, p)) in seq.cells.iter().zip(&par.cells).enumerate() {
        assert_close(*s, *p, rel, &format!("{} slot {i}", seq.id));
    }
    for (name, s, p) in [
        ("min", seq.global_min, par.global_min),
        ("max", seq.global_max, par.global_max),
        ("total", seq.global_total, par.global_total),
        ("count", seq.global_count, par.global_count),
    ] {
        for c in 0..ELEMENT_COUNT {
            assert_close(s[c], p[c], rel, &format!("{} global {name}[{c}]", seq.id));
        }
    }
    assert_eq!(seq.min_max.is_some(), par.min_max.is_some());
}

#[test]
fn sequential_and_parallel_agree() {
    let pts = random_points(20_000, 12345);
    let grid = Grid { num_col: 28, num_row: 28, cell_size: [37.0, 37.0], origin: [0.0, 0.0] };
    let ch = channels(&[
        ChannelSpec::count("n").with_min_max(true, true),
        ChannelSpec::new("int", &["i"], "sum").combined(),
        ChannelSpec::new("lo", &["a", "b"], "min").with_min_max(true, true),
        ChannelSpec::new("hi", &["a", "b"], "max").combined(),
        ChannelSpec::new("sum", &["a", "b"], "sum").with_min_max(true, true),
        ChannelSpec::new("avg", &["a"], "mean").with_min_max(true, true),
    ]);

    let seq = run(&SequentialAggregator, &pts, &ch, &grid);
    for precision in [Precision::Double, Precision::Single] {
        let par = run(&parallel(precision), &pts, &ch, &grid);

        // counts and integer sums carry no rounding error
        for k in 0..2 {
            assert_eq!(seq.channels[k], par.channels[k], "channel {} ({precision:?})", seq.channels[k].id);
        }
        // extrema are exact per cell; their float totals depend on reduction order
        for k in 2..4 {
            let (s, p) = (&seq.channels[k], &par.channels[k]);
            assert_eq!(s.cells, p.cells, "channel {}", s.id);
            assert_eq!((s.global_min, s.global_max, s.min_max), (p.global_min, p.global_max, p.min_max));
            assert_eq!(s.global_count, p.global_count);
            assert_channel_close(s, p, 1e-4);
        }
        assert_channel_close(&seq.channels[4], &par.channels[4], 1e-4);
        assert_channel_close(&seq.channels[5], &par.channels[5], 1e-4);
    }
    assert!(seq.channels[0].total_count() > 15_000.0);
    assert!(seq.channels[0].total_count() < 20_000.0);
}

#[test]
fn parallel_result_is_independent_of_thread_count() {
    let pts = random_points(5_000, 7);
    let grid = Grid { num_col: 10, num_row: 10, cell_size: [100.0, 100.0], origin: [0.0, 0.0] };
    let ch = channels(&[ChannelSpec::new("int", &["i"], "sum").combined(), ChannelSpec::new("m", &["i"], "max")]);
    let one = ParallelAggregator::new(&ParallelConfig { num_threads: 1, ..Default::default() }).unwrap();
    let many = ParallelAggregator::new(&ParallelConfig { num_threads: 8, min_points_per_task: 16, ..Default::default() }).unwrap();
    assert_eq!(one.num_threads(), 1);
    assert_eq!(run(&one, &pts, &ch, &grid), run(&many, &pts, &ch, &grid));
}
