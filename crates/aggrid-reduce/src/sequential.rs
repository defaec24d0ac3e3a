//! Single-threaded, in-order binning and reduction.

use aggrid_core::{AggResult, AggregationResult, ChannelResult, COUNT_SLOT, ELEMENT_COUNT};

use crate::{
    bind_channels, check_weight, fragment, prepare_result, AggregateInput, Aggregator, Backend,
    BlendOp, GlobalPlan, GlobalVectors,
};

/// Reference backend: one pass over the points, one pass over the cells.
#[derive(Copy, Clone, Debug, Default)]
pub struct SequentialAggregator;

impl Aggregator for SequentialAggregator {
    fn backend(&self) -> Backend { Backend::Sequential }

    fn aggregate_into(&self, input: &AggregateInput<'_>, out: &mut AggregationResult) -> AggResult<()> {
        let weights = bind_channels(input)?;
        let grid = input.grid;
        prepare_result(out, input.channels, grid.checked_num_cells()?);

        let ops: Vec<BlendOp> = input.channels.iter().map(|ch| ch.operation.into()).collect();

        // 1) bin assignment + cell reduction
        for (i, &p) in input.positions.iter().enumerate() {
            let Some(cell) = grid.cell_of(p) else { continue };
            let base = cell * ELEMENT_COUNT;
            for (k, res) in out.channels.iter_mut().enumerate() {
                let (ch, w, op) = (&input.channels[k], &weights[k], ops[k]);
                for c in 0..ch.size {
                    let v = w.get(i, c);
                    check_weight(ch, i, v);
                    res.cells[base + c] = op.blend(res.cells[base + c], v);
                }
                res.cells[base + COUNT_SLOT] += 1.0;
            }
        }

        // 2) global reduction over non-empty cells
        for res in out.channels.iter_mut() {
            let globals = fold_globals(res);
            globals.store(res);
        }
        Ok(())
    }
}

fn fold_globals(res: &ChannelResult) -> GlobalVectors {
    let (op, size) = (res.operation, res.size);
    let plan = GlobalPlan::for_channel(res);

    let mut count = BlendOp::Add.identity();
    let mut total = BlendOp::Add.identity();
    let mut min = BlendOp::Min.identity();
    let mut max = BlendOp::Max.identity();
    let mut packed = BlendOp::MaxMin.identity();

    for slot in res.cells.chunks_exact(ELEMENT_COUNT) {
        if slot[COUNT_SLOT] <= 0.0 { continue; }
        count = BlendOp::Add.blend4(count, fragment::count(size, slot));
        total = BlendOp::Add.blend4(total, fragment::total(op, size, slot));
        if plan.min { min = BlendOp::Min.blend4(min, fragment::min(op, size, slot)); }
        if plan.max { max = BlendOp::Max.blend4(max, fragment::max(op, size, slot)); }
        if plan.packed { packed = BlendOp::MaxMin.blend4(packed, fragment::packed(op, size, slot)); }
    }

    GlobalVectors {
        count,
        total,
        min: plan.min.then_some(min),
        max: plan.max.then_some(max),
        packed: plan.packed.then_some(packed),
    }
}
