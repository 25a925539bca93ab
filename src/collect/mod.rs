//! Builds the per-task block collection from one CPU's tsc windows and
//! scheduling quanta, then merges every CPU's timeline into task order
//! (§4.5). Serialization lives in [`serialize`].

pub mod serialize;

use rustc_hash::FxHashMap;

use crate::packet::{ParseEvent, Parser};
use crate::sched::Quantum;
use crate::timing::TscHeuristics;

/// One record in a task's chronological block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Trace {
        cpu: u32,
        tsc_start: u64,
        tsc_end: u64,
        pos_start: u64,
        lip_start: u64,
        pos_end: u64,
        lip_end: u64,
    },
    Enter {
        cpu: u32,
        tsc: u64,
    },
    Leave {
        cpu: u32,
        tsc: u64,
    },
    Bad {
        cpu: u32,
        tsc_start: u64,
        tsc_end: u64,
    },
}

impl Block {
    pub fn tsc_start(&self) -> u64 {
        match *self {
            Block::Trace { tsc_start, .. } => tsc_start,
            Block::Enter { tsc, .. } => tsc,
            Block::Leave { tsc, .. } => tsc,
            Block::Bad { tsc_start, .. } => tsc_start,
        }
    }

    pub fn cpu(&self) -> u32 {
        match *self {
            Block::Trace { cpu, .. }
            | Block::Enter { cpu, .. }
            | Block::Leave { cpu, .. }
            | Block::Bad { cpu, .. } => cpu,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Task {
    pub tid: u32,
    pub name: Option<String>,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
pub struct VmSectionDecl {
    pub start: u64,
    pub size: u64,
    pub offset: u64,
    pub tid: u32,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct VmFuncDecl {
    pub start: u64,
    pub end: u64,
    pub module: String,
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub traces: Vec<String>,
    pub sideband: Option<String>,
    pub vm_sections: Vec<VmSectionDecl>,
    pub vm_funcs: Vec<VmFuncDecl>,
    pub tasks: FxHashMap<u32, Task>,
}

impl Collection {
    pub fn task_mut(&mut self, tid: u32) -> &mut Task {
        self.tasks.entry(tid).or_insert_with(|| Task {
            tid,
            name: None,
            blocks: Vec::new(),
        })
    }

    /// Tasks in ascending tid order, the order [`serialize::write`] uses.
    pub fn sorted_tids(&self) -> Vec<u32> {
        let mut tids: Vec<u32> = self.tasks.keys().copied().collect();
        tids.sort_unstable();
        tids
    }
}

/// Builds one CPU's `(tid, block)` timeline: has-tsc ranges become TRACE
/// blocks split at quantum boundaries, each quantum contributes an `Enter`
/// and (when its end position is known) a `Leave` (§4.5 "Per-CPU
/// construction").
pub fn build_cpu_timeline(
    cpu: u32,
    data: &[u8],
    base_offset: u64,
    end_offset: u64,
    timing: &TscHeuristics,
    quanta: &[Quantum],
) -> Vec<(u32, Block)> {
    let lips = lip_positions(data, base_offset);

    let mut cut_points: Vec<u64> = Vec::new();
    for q in quanta {
        if let Some(p) = q.pos_start {
            cut_points.push(p);
        }
        if let Some(p) = q.pos_end {
            cut_points.push(p);
        }
    }
    cut_points.sort_unstable();
    cut_points.dedup();

    let mut timeline = Vec::new();

    for range in timing.ranges(base_offset, end_offset) {
        let Some((tsc_begin, tsc_end_w)) = range.window else {
            continue;
        };
        let mut segment_start = range.pos_start;
        let mut local_cuts: Vec<u64> = cut_points
            .iter()
            .copied()
            .filter(|&p| p > range.pos_start && p < range.pos_end)
            .collect();
        local_cuts.push(range.pos_end);

        for cut in local_cuts {
            if cut == segment_start {
                continue;
            }
            let tid = tid_at_tsc(quanta, tsc_begin);
            let lip_start = lip_at(&lips, segment_start);
            let lip_end = lip_at(&lips, cut);
            timeline.push((
                tid,
                Block::Trace {
                    cpu,
                    tsc_start: tsc_begin,
                    tsc_end: tsc_end_w,
                    pos_start: segment_start,
                    lip_start,
                    pos_end: cut,
                    lip_end,
                },
            ));
            segment_start = cut;
        }
    }

    for q in quanta {
        let enter_tsc = q
            .pos_start
            .and_then(|p| timing.window_at(p))
            .map(|(begin, _)| begin)
            .unwrap_or(q.tsc_start);
        timeline.push((q.tid, Block::Enter { cpu, tsc: enter_tsc }));
        if q.pos_end.is_some() {
            timeline.push((q.tid, Block::Leave { cpu, tsc: q.tsc_end }));
        }
    }

    timeline.sort_by_key(|(_, b)| b.tsc_start());
    timeline
}

fn tid_at_tsc(quanta: &[Quantum], tsc: u64) -> u32 {
    quanta
        .iter()
        .find(|q| tsc >= q.tsc_start && tsc < q.tsc_end)
        .map(|q| q.tid)
        .unwrap_or(0)
}

fn lip_positions(data: &[u8], base_offset: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut parser = Parser::new(data, base_offset, 0);
    while let Some(ev) = parser.next() {
        if let ParseEvent::Token(token) = ev {
            out.push((token.offset, token.lip));
        }
    }
    out
}

fn lip_at(lips: &[(u64, u64)], offset: u64) -> u64 {
    match lips.binary_search_by_key(&offset, |&(p, _)| p) {
        Ok(idx) => lips[idx].1,
        Err(0) => 0,
        Err(idx) => lips[idx - 1].1,
    }
}

/// Merges every CPU's timeline into the collection's per-task block lists,
/// at each step appending the globally smallest-`tsc_start` block (§4.5
/// "Merging"). CPUs are scanned in index order, so ties break by cpu id.
pub fn merge_into_collection(collection: &mut Collection, timelines: &[Vec<(u32, Block)>]) {
    let mut cursors = vec![0usize; timelines.len()];
    loop {
        let mut best: Option<(usize, u64)> = None;
        for (ci, timeline) in timelines.iter().enumerate() {
            if let Some((_, block)) = timeline.get(cursors[ci]) {
                let tsc = block.tsc_start();
                if best.map(|(_, b)| tsc < b).unwrap_or(true) {
                    best = Some((ci, tsc));
                }
            }
        }
        let Some((ci, _)) = best else { break };
        let (tid, block) = timelines[ci][cursors[ci]];
        collection.task_mut(tid).blocks.push(block);
        cursors[ci] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Quantum;

    #[test]
    fn merge_orders_by_ascending_tsc_across_cpus() {
        let mut collection = Collection::default();
        let cpu0 = vec![(
            1u32,
            Block::Trace {
                cpu: 0,
                tsc_start: 10,
                tsc_end: 20,
                pos_start: 0,
                lip_start: 0,
                pos_end: 5,
                lip_end: 0,
            },
        )];
        let cpu1 = vec![(
            1u32,
            Block::Trace {
                cpu: 1,
                tsc_start: 5,
                tsc_end: 15,
                pos_start: 0,
                lip_start: 0,
                pos_end: 5,
                lip_end: 0,
            },
        )];
        merge_into_collection(&mut collection, &[cpu0, cpu1]);
        let blocks = &collection.tasks[&1].blocks;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].cpu(), 1);
        assert_eq!(blocks[1].cpu(), 0);
    }

    #[test]
    fn trace_block_splits_at_quantum_boundary() {
        let mut data = vec![];
        data.push(0b1000_0111u8);
        data.extend_from_slice(&0xffff_ffff_8100_0000u64.to_le_bytes()[..6]);
        let timing = TscHeuristics::build(&data, 0, data.len() as u64);
        let quanta = vec![Quantum {
            tsc_start: 0,
            tsc_end: 1,
            tid: 7,
            pos_start: Some(0),
            pos_end: Some(3),
        }];
        let timeline = build_cpu_timeline(0, &data, 0, data.len() as u64, &timing, &quanta);
        assert!(timeline.iter().any(|(tid, b)| *tid == 7 && matches!(b, Block::Enter { .. })));
    }
}
