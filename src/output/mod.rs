//! Proportional tsc distribution within a slot, cross-CPU merge, and the
//! stack low-water-mark normalization pass (§4.7).

/// One per-task output record, tagged by its `@ `-line kind (§6). Only the
/// fields the normalizer actually touches are modeled here; everything
/// else the replay engine emits passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteRecord {
    pub tsc_start: u64,
    pub tsc_end: u64,
    pub cumulative_before: u64,
    pub cumulative_total: u64,
    pub depth: i32,
}

/// Half-even ("banker's") rounding of `tsc_start + time_span * a_i / total`
/// (§4.7 "Within one tsc slot").
pub fn distribute_tsc(tsc_start: u64, tsc_end: u64, cumulative: u64, total: u64) -> u64 {
    if total == 0 {
        return tsc_start;
    }
    let time_span = tsc_end.saturating_sub(tsc_start) as u128;
    let numerator = time_span * cumulative as u128;
    let denom = total as u128;
    let quotient = numerator / denom;
    let remainder = numerator % denom;
    let doubled = remainder * 2;
    let rounded = match doubled.cmp(&denom) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => {
            if quotient % 2 == 0 {
                quotient
            } else {
                quotient + 1
            }
        }
    };
    tsc_start + rounded as u64
}

/// Assigns a distributed tsc and `in_thread` duration to every record of
/// one tsc slot, given their cumulative instruction counts at each
/// boundary (§4.7).
pub fn normalize_slot(records: &[ExecuteRecord]) -> Vec<(u64, u64)> {
    let Some(total) = records.last().map(|r| r.cumulative_total) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let tsc = distribute_tsc(record.tsc_start, record.tsc_end, record.cumulative_before, total);
        let next_tsc = if i + 1 < records.len() {
            distribute_tsc(
                records[i + 1].tsc_start,
                records[i + 1].tsc_end,
                records[i + 1].cumulative_before,
                total,
            )
        } else {
            distribute_tsc(record.tsc_start, record.tsc_end, total, total)
        };
        out.push((tsc, next_tsc.saturating_sub(tsc)));
    }
    out
}

/// One already-normalized line from one CPU's per-task output, as seen by
/// the cross-CPU merge (§4.7 "Across CPUs").
pub trait MergeLine {
    fn tsc(&self) -> u64;
}

/// Merges `n` already tsc-sorted per-CPU line streams into one global
/// nondecreasing-tsc order; ties break by ascending `cpu` id.
pub fn merge_lines<T: MergeLine + Clone>(mut streams: Vec<(u32, Vec<T>)>) -> Vec<T> {
    streams.sort_by_key(|(cpu, _)| *cpu);
    let mut cursors = vec![0usize; streams.len()];
    let mut out = Vec::new();
    loop {
        let mut best: Option<(usize, u64)> = None;
        for (i, (_, lines)) in streams.iter().enumerate() {
            if let Some(line) = lines.get(cursors[i]) {
                let tsc = line.tsc();
                if best.map(|(_, b)| tsc < b).unwrap_or(true) {
                    best = Some((i, tsc));
                }
            }
        }
        let Some((i, _)) = best else { break };
        out.push(streams[i].1[cursors[i]].clone());
        cursors[i] += 1;
    }
    out
}

/// Subtracts a task's recorded low-water mark from every depth, producing
/// non-negative depths (§4.7 "Stack low-water marks").
pub fn normalize_depths(depths: &mut [i32], low_water_mark: i32) {
    let shift = -low_water_mark.min(0);
    for d in depths.iter_mut() {
        *d += shift;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_tsc_is_monotonic_and_bounded() {
        let mut prev = 0;
        for i in 0..=10u64 {
            let tsc = distribute_tsc(1000, 1100, i, 10);
            assert!(tsc >= 1000 && tsc <= 1100);
            assert!(tsc >= prev);
            prev = tsc;
        }
    }

    #[test]
    fn half_even_rounds_ties_to_even_quotient() {
        // time_span=4, total=8, cumulative=1 => 0.5 exactly; quotient 0 is even, stays 0.
        assert_eq!(distribute_tsc(100, 104, 1, 8), 100);
        // cumulative=3 => 1.5 exactly; quotient 1 is odd, rounds up to 2.
        assert_eq!(distribute_tsc(100, 104, 3, 8), 102);
    }

    #[test]
    fn normalize_depths_shifts_negative_low_water_to_zero() {
        let mut depths = vec![-2, -1, 0, 1];
        normalize_depths(&mut depths, -2);
        assert_eq!(depths, vec![0, 1, 2, 3]);
    }

    #[derive(Clone)]
    struct Line(u64);
    impl MergeLine for Line {
        fn tsc(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn merge_lines_is_globally_nondecreasing() {
        let a = vec![Line(1), Line(5), Line(9)];
        let b = vec![Line(2), Line(5), Line(8)];
        let merged = merge_lines(vec![(0, a), (1, b)]);
        let tscs: Vec<u64> = merged.iter().map(|l| l.tsc()).collect();
        assert_eq!(tscs, vec![1, 2, 5, 5, 8, 9]);
    }
}
