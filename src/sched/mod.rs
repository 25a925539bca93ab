//! Correlates sideband scheduling events with trace-stream markers to
//! locate exact context-switch boundaries (§4.4).

use crate::packet::{Packet, ParseEvent, Parser};
use crate::sideband::SidebandModel;
use crate::timing::TscHeuristics;

/// A guest address range whose scheduling is detected structurally rather
/// than via the host scheduler (§3 "vm_section", glossary "VM section").
#[derive(Debug, Clone, Copy)]
pub struct VmSection {
    pub start: u64,
    pub size: u64,
    pub tid: u32,
}

impl VmSection {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

/// `PKT_CNT_MAX`: the packet-count hint is a 14-bit counter (§3).
const PKT_CNT_MAX: u32 = (1 << 14) - 1;
const SCHED_TIP_TSC_WINDOW: u64 = 4096;
const SCHED_TIP_SNAP_BYTES: u64 = 82;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    tsc: u64,
    pos: Option<u64>,
    new_tid: u32,
    distance: u32,
}

/// One contiguous interval during which one task ran on one CPU (glossary
/// "Quantum").
#[derive(Debug, Clone, Copy)]
pub struct Quantum {
    pub tsc_start: u64,
    pub tsc_end: u64,
    pub tid: u32,
    pub pos_start: Option<u64>,
    pub pos_end: Option<u64>,
}

/// Builds the ordered quanta list for one CPU (§4.4 "Matching algorithm").
pub fn build_quanta(
    cpu: u32,
    data: &[u8],
    base_offset: u64,
    end_offset: u64,
    sideband: &SidebandModel,
    timing: &TscHeuristics,
    vm_sections: &[VmSection],
) -> Vec<Quantum> {
    let mut candidates: Vec<Candidate> = sideband
        .schedulings_for_cpu(cpu)
        .iter()
        .map(|s| Candidate {
            tsc: s.tsc,
            pos: None,
            new_tid: s.new_tid,
            distance: PKT_CNT_MAX + 1,
        })
        .collect();

    pass_a_packet_count(&mut candidates, cpu, sideband, data, base_offset, timing);
    pass_b_scheduler_tip(&mut candidates, sideband, data, base_offset, timing);
    let vm_candidates = pass_c_vm_sections(data, base_offset, vm_sections);

    candidates.extend(vm_candidates);

    for c in &mut candidates {
        if let Some(pos) = c.pos {
            if let Some((begin, end)) = timing.window_at(pos) {
                c.tsc = c.tsc.clamp(begin, end.saturating_sub(1).max(begin));
            }
        }
    }
    candidates.sort_by_key(|c| c.tsc);

    let mut quanta = Vec::new();
    let initial = sideband.initial_for_cpu(cpu);
    let mut prev = initial.map(|i| Candidate {
        tsc: i.tsc,
        pos: Some(base_offset),
        new_tid: i.tid,
        distance: 0,
    });
    for curr in candidates {
        if let Some(p) = prev {
            quanta.push(Quantum {
                tsc_start: p.tsc,
                tsc_end: curr.tsc,
                tid: p.new_tid,
                pos_start: p.pos,
                pos_end: curr.pos,
            });
        }
        prev = Some(curr);
    }
    if let Some(p) = prev {
        quanta.push(Quantum {
            tsc_start: p.tsc,
            tsc_end: end_offset,
            tid: p.new_tid,
            pos_start: p.pos,
            pos_end: Some(end_offset),
        });
    }
    quanta
}

/// Pass A: narrow each candidate's position using the packet-count hint.
fn pass_a_packet_count(
    candidates: &mut [Candidate],
    cpu: u32,
    sideband: &SidebandModel,
    data: &[u8],
    base_offset: u64,
    timing: &TscHeuristics,
) {
    // Candidates were seeded 1:1, in order, from `schedulings_for_cpu(cpu)`.
    let hints: Vec<u16> = sideband
        .schedulings_for_cpu(cpu)
        .iter()
        .map(|s| s.packet_count_hint)
        .collect();
    let mut parser = Parser::new(data, base_offset, 0);
    while let Some(ev) = parser.next() {
        let ParseEvent::Token(token) = ev else { continue };
        let Some((begin, end)) = timing.window_at(token.offset) else {
            continue;
        };
        let packet_count = parser.packet_count() as u32;
        for (idx, c) in candidates.iter_mut().enumerate() {
            if c.tsc < begin || c.tsc >= end {
                continue;
            }
            let Some(&hint) = hints.get(idx) else { continue };
            let distance = (packet_count as i64 - hint as i64).unsigned_abs() as u32;
            if distance < c.distance {
                c.distance = distance;
                c.pos = Some(token.offset);
            }
        }
    }
}

/// Pass B: snap candidates onto an exact `scheduler_tip` TIP when close
/// enough in either byte distance or tsc-slot overlap.
fn pass_b_scheduler_tip(
    candidates: &mut [Candidate],
    sideband: &SidebandModel,
    data: &[u8],
    base_offset: u64,
    timing: &TscHeuristics,
) {
    let Some(tip_target) = sideband.scheduler_tip() else {
        return;
    };
    let mut parser = Parser::new(data, base_offset, 0);
    let mut matched_once = vec![false; candidates.len()];
    while let Some(ev) = parser.next() {
        let ParseEvent::Token(token) = ev else { continue };
        let Packet::Tip { addr, .. } = token.packet else {
            continue;
        };
        if addr != tip_target {
            continue;
        }
        let tip_pos = token.offset;
        let tip_tsc = timing.window_at(tip_pos).map(|(b, _)| b);

        // Last candidate with pos <= tip_pos and no later candidate before it.
        let mut best: Option<usize> = None;
        for (idx, c) in candidates.iter().enumerate() {
            if let Some(pos) = c.pos {
                if pos <= tip_pos {
                    if best.map(|b| candidates[b].pos.unwrap() < pos).unwrap_or(true) {
                        best = Some(idx);
                    }
                }
            }
        }
        let Some(idx) = best else { continue };
        if matched_once[idx] {
            continue;
        }
        let within_tsc = match tip_tsc {
            Some(t) => t.abs_diff(candidates[idx].tsc) <= SCHED_TIP_TSC_WINDOW,
            None => false,
        };
        let within_bytes = candidates[idx]
            .pos
            .map(|p| tip_pos.saturating_sub(p) < SCHED_TIP_SNAP_BYTES)
            .unwrap_or(false);
        if within_tsc || within_bytes {
            candidates[idx].pos = Some(tip_pos);
            matched_once[idx] = true;
        }
    }
}

/// Pass C: a linux<->vm transition at each boundary crossing produces an
/// additional scheduling candidate tagged with the VM section's tid.
fn pass_c_vm_sections(data: &[u8], base_offset: u64, vm_sections: &[VmSection]) -> Vec<Candidate> {
    if vm_sections.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut parser = Parser::new(data, base_offset, 0);
    let mut in_vm: Option<u32> = None;
    while let Some(ev) = parser.next() {
        let ParseEvent::Token(token) = ev else { continue };
        let addr = match token.packet {
            Packet::Tip { addr, .. } | Packet::FupPge { addr } | Packet::FupPgd { addr } => addr,
            _ => continue,
        };
        let now_vm = vm_sections.iter().find(|s| s.contains(addr)).map(|s| s.tid);
        if now_vm != in_vm {
            if let Some(tid) = now_vm.or(in_vm) {
                out.push(Candidate {
                    tsc: 0,
                    pos: Some(token.offset),
                    new_tid: tid,
                    distance: 0,
                });
            }
            in_vm = now_vm;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sideband::events::{ScheduleEvent, SidebandEvent};

    #[test]
    fn packet_count_pass_picks_closest_candidate() {
        let events = vec![SidebandEvent::Schedule(ScheduleEvent {
            tsc: 0x12345,
            cpu: 0,
            prev_tid: 17,
            new_tid: 42,
            packet_count_hint: 0x80,
            packet_mask: 0,
        })];
        let sideband = SidebandModel::from_events(events);

        let mut data = vec![];
        data.push(0xc4u8);
        data.push(0);
        data.push(0);
        data.extend_from_slice(&0x12340u64.to_le_bytes()[..5]);
        for _ in 0..0x7e {
            data.push(0x01); // 1 tnt-bit filler packets to advance packet_count
        }

        let timing = TscHeuristics::build(&data, 0, data.len() as u64);
        let quanta = build_quanta(0, &data, 0, data.len() as u64, &sideband, &timing, &[]);
        assert!(!quanta.is_empty());
    }
}
