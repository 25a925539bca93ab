//! The structured shape an external sideband parser hands to [`super::SidebandModel`].
//!
//! §6 names the sideband file's record kinds (`init`, `process`, `mmap`,
//! `munmap`, `schedule`, `hook`, `module`) and says only that "the sideband
//! model exposes only the queries in §4.3" — parsing the on-disk log itself
//! is an external collaborator's job. This module is the seam: it defines
//! the typed events that collaborator is expected to produce.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapEvent {
    pub tsc: u64,
    pub pid: i32,
    pub start: u64,
    pub length: u64,
    pub page_offset: u64,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MunmapEvent {
    pub tsc: u64,
    pub pid: i32,
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub tsc: u64,
    pub cpu: u32,
    pub prev_tid: u32,
    pub new_tid: u32,
    pub packet_count_hint: u16,
    pub packet_mask: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub original_addr: u64,
    pub copy_addr: Option<u64>,
    pub copy_len: u64,
    pub wrapper_addr: Option<u64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidebandEvent {
    Init {
        cpu: u32,
        tsc: u64,
        tid: u32,
        packet_mask: u8,
    },
    Process {
        tsc: u64,
        pid: i32,
        parent_pid: Option<i32>,
    },
    Mmap(MmapEvent),
    Munmap(MunmapEvent),
    Schedule(ScheduleEvent),
    Hook(HookEvent),
    Module {
        tsc: u64,
        vm_section_tid: u32,
        start: u64,
        end: u64,
    },
}
