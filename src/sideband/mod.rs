//! Read-only query interface over a parsed sideband event log (§4.3).
//!
//! Structured the way the teacher splits process bookkeeping from the
//! thing that owns all processes (`linux_shared::process::Process` /
//! `linux_shared::processes::Processes`): a `Process` owns its own mapping
//! history, `SidebandModel` owns a `pid -> Process` table plus the
//! per-CPU scheduling lists and hook inventory.

pub mod events;
pub mod parse;

use rustc_hash::FxHashMap;

use events::{HookEvent, MmapEvent, ScheduleEvent, SidebandEvent};

const PAGE_SIZE: u64 = 4096;

/// One process's `mappings-over-time` structure (§3 "Process"). A fork
/// clones the parent's history at the fork tsc; the first post-fork mmap
/// assigns the process name (mirrored by [`Process::maybe_assign_name`]).
#[derive(Debug, Clone, Default)]
pub struct Process {
    pub pid: i32,
    pub name: Option<String>,
    mappings: Vec<MmapEvent>,
}

impl Process {
    fn new(pid: i32) -> Self {
        Process {
            pid,
            name: None,
            mappings: Vec::new(),
        }
    }

    fn fork_from(parent: &Process, pid: i32, tsc: u64) -> Self {
        let mut mappings: Vec<MmapEvent> =
            parent.mappings.iter().filter(|m| m.tsc <= tsc).cloned().collect();
        mappings.iter_mut().for_each(|m| m.pid = pid);
        Process {
            pid,
            name: parent.name.clone(),
            mappings,
        }
    }

    fn add_mmap(&mut self, mmap: MmapEvent) {
        self.maybe_assign_name(&mmap);
        self.mappings.push(mmap);
        self.mappings.sort_by_key(|m| m.tsc);
    }

    fn add_tombstone(&mut self, tsc: u64, start: u64, length: u64) {
        self.mappings.push(MmapEvent {
            tsc,
            pid: self.pid,
            start,
            length,
            page_offset: 0,
            path: "unmapped".to_string(),
        });
        self.mappings.sort_by_key(|m| m.tsc);
    }

    fn maybe_assign_name(&mut self, mmap: &MmapEvent) {
        if self.name.is_none() && mmap.path != "unmapped" {
            self.name = Some(mmap.path.clone());
        }
    }

    /// §4.3 "Memory map lookup".
    fn lookup(&self, address: u64, tsc: u64) -> Option<(String, u64)> {
        self.mappings
            .iter()
            .rev()
            .find(|m| m.tsc <= tsc && m.start <= address && address < m.start + m.length)
            .and_then(|m| {
                if m.path == "unmapped" {
                    None
                } else {
                    let load_start = m.start.wrapping_sub(PAGE_SIZE * m.page_offset);
                    Some((m.path.clone(), load_start))
                }
            })
    }

    /// All target filesystem paths mapped as of `tsc`, newest occurrence
    /// of each path first — used by relocation resolution (§4.6) to probe
    /// every currently mapped binary for a matching symbol.
    pub fn mapped_paths_as_of(&self, tsc: u64) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for m in self.mappings.iter().rev().filter(|m| m.tsc <= tsc) {
            if m.path != "unmapped" && seen.insert(m.path.clone()) {
                out.push(m.path.clone());
            }
        }
        out
    }
}

/// A code-patch hook (§3, §4.3 "Hook adjustment", glossary "Hook").
#[derive(Debug, Clone)]
pub struct Hook {
    pub original_addr: u64,
    pub copy_range: Option<(u64, u64)>,
    pub wrapper_addr: Option<u64>,
    pub name: Option<String>,
}

/// Per-CPU starting point before its first sideband scheduling record.
#[derive(Debug, Clone, Copy)]
pub struct CpuInitial {
    pub tsc: u64,
    pub tid: u32,
    pub packet_mask: u8,
}

pub struct SidebandModel {
    processes: FxHashMap<i32, Process>,
    schedulings: FxHashMap<u32, Vec<ScheduleEvent>>,
    initial: FxHashMap<u32, CpuInitial>,
    hooks: Vec<Hook>,
    scheduler_tip_addr: Option<u64>,
    /// tid -> owning pid, to resolve a tid to its process's mapping history.
    tid_to_pid: FxHashMap<u32, i32>,
}

impl SidebandModel {
    pub fn from_events(events: impl IntoIterator<Item = SidebandEvent>) -> Self {
        let mut model = SidebandModel {
            processes: FxHashMap::default(),
            schedulings: FxHashMap::default(),
            initial: FxHashMap::default(),
            hooks: Vec::new(),
            scheduler_tip_addr: None,
            tid_to_pid: FxHashMap::default(),
        };
        for event in events {
            model.apply(event);
        }
        for list in model.schedulings.values_mut() {
            list.sort_by_key(|s| s.tsc);
        }
        model
    }

    fn apply(&mut self, event: SidebandEvent) {
        match event {
            SidebandEvent::Init {
                cpu,
                tsc,
                tid,
                packet_mask,
            } => {
                self.initial.insert(
                    cpu,
                    CpuInitial {
                        tsc,
                        tid,
                        packet_mask,
                    },
                );
            }
            SidebandEvent::Process {
                pid, parent_pid, ..
            } => {
                let process = match parent_pid.and_then(|ppid| self.processes.get(&ppid)) {
                    Some(parent) => Process::fork_from(parent, pid, 0),
                    None => Process::new(pid),
                };
                self.processes.insert(pid, process);
            }
            SidebandEvent::Mmap(mmap) => {
                self.tid_to_pid.insert(mmap.pid as u32, mmap.pid);
                self.processes
                    .entry(mmap.pid)
                    .or_insert_with(|| Process::new(mmap.pid))
                    .add_mmap(mmap);
            }
            SidebandEvent::Munmap(m) => {
                self.processes
                    .entry(m.pid)
                    .or_insert_with(|| Process::new(m.pid))
                    .add_tombstone(m.tsc, m.start, m.length);
            }
            SidebandEvent::Schedule(sched) => {
                self.schedulings.entry(sched.cpu).or_default().push(sched);
            }
            SidebandEvent::Hook(HookEvent {
                original_addr,
                copy_addr,
                copy_len,
                wrapper_addr,
                name,
            }) => {
                if name.as_deref() == Some("__switch_to") {
                    self.scheduler_tip_addr = copy_addr.or(Some(original_addr));
                }
                self.hooks.push(Hook {
                    original_addr,
                    copy_range: copy_addr.map(|a| (a, a + copy_len)),
                    wrapper_addr,
                    name,
                });
            }
            SidebandEvent::Module { .. } => {
                // VM x86_64 function regions: accepted as a feature-complete
                // interface per §9(c), not wired into scheduling detection
                // without recorded traces to validate it against.
            }
        }
    }

    /// §4.3 "Scheduling iteration": ascending-tsc schedulings for one CPU.
    pub fn schedulings_for_cpu(&self, cpu: u32) -> &[ScheduleEvent] {
        self.schedulings.get(&cpu).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn initial_for_cpu(&self, cpu: u32) -> Option<CpuInitial> {
        self.initial.get(&cpu).copied()
    }

    /// §4.3 "Memory map lookup", resolved via the process owning `tid`.
    pub fn lookup_mapping(&self, tid: u32, address: u64, tsc: u64) -> Option<(String, u64)> {
        let pid = self.tid_to_pid.get(&tid).copied().unwrap_or(tid as i32);
        self.processes.get(&pid)?.lookup(address, tsc)
    }

    pub fn process_for_tid(&self, tid: u32) -> Option<&Process> {
        let pid = self.tid_to_pid.get(&tid).copied().unwrap_or(tid as i32);
        self.processes.get(&pid)
    }

    /// §4.3 "Hook adjustment".
    pub fn adjust_for_hook(&self, pc: u64) -> u64 {
        for hook in &self.hooks {
            if pc == hook.original_addr {
                if let Some(wrapper) = hook.wrapper_addr {
                    return wrapper;
                }
            }
            if let Some((start, end)) = hook.copy_range {
                if pc >= start && pc < end {
                    return hook.original_addr + (pc - start);
                }
            }
        }
        pc
    }

    /// §4.3 "Scheduler TIP".
    pub fn scheduler_tip(&self) -> Option<u64> {
        self.scheduler_tip_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::MunmapEvent;

    #[test]
    fn mmap_lookup_honours_tombstones_and_page_offset() {
        let events = vec![
            SidebandEvent::Mmap(MmapEvent {
                tsc: 10,
                pid: 5,
                start: 0x1000,
                length: 0x1000,
                page_offset: 2,
                path: "/bin/foo".to_string(),
            }),
            SidebandEvent::Munmap(MunmapEvent {
                tsc: 20,
                pid: 5,
                start: 0x1000,
                length: 0x1000,
            }),
        ];
        let model = SidebandModel::from_events(events);
        let (path, load_start) = model.lookup_mapping(5, 0x1500, 15).unwrap();
        assert_eq!(path, "/bin/foo");
        assert_eq!(load_start, 0x1000u64.wrapping_sub(PAGE_SIZE * 2));
        assert!(model.lookup_mapping(5, 0x1500, 25).is_none());
    }

    #[test]
    fn hook_redirects_into_wrapper_and_back() {
        let events = vec![SidebandEvent::Hook(HookEvent {
            original_addr: 0xffff_ffff_8150_0000,
            copy_addr: Some(0xffff_ffff_c000_0000),
            copy_len: 64,
            wrapper_addr: Some(0xffff_ffff_c100_0000),
            name: None,
        })];
        let model = SidebandModel::from_events(events);
        assert_eq!(
            model.adjust_for_hook(0xffff_ffff_8150_0000),
            0xffff_ffff_c100_0000
        );
        assert_eq!(
            model.adjust_for_hook(0xffff_ffff_c000_0020),
            0xffff_ffff_8150_0020
        );
    }
}
