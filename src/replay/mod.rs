//! Per-task replay (§4.6): walks a task's TRACE blocks, drives a
//! disassembler-led program-counter cursor, and emits one record per
//! executed run, call, return, module change, and schedule event.

pub mod disasm;

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::collect::{Block, Task};
use crate::error::Warning;
use crate::packet::{Packet, ParseEvent, Parser};
use crate::sideband::SidebandModel;
use crate::timing::TscHeuristics;
use disasm::{Disassembler, Transfer};

pub type ModuleId = u32;
pub type SymbolId = u32;

/// External collaborator: maps `(tid, addr, tsc)` to loaded code and
/// symbol identity (§4.6 "Relocation resolution"). A concrete
/// implementation backs this with the `object`-crate ELF reader and the
/// sideband model's mapping history.
pub trait SymbolResolver {
    fn module_for(&mut self, tid: u32, addr: u64, tsc: u64) -> Option<ModuleId>;
    fn bytes_at(&mut self, tid: u32, addr: u64, tsc: u64, max_len: usize) -> Option<Vec<u8>>;
    fn symbol_id(&mut self, module: ModuleId, addr: u64) -> SymbolId;
    /// Looks up a global function named `name` in every path currently
    /// mapped into `tid`'s process, returning the first match's address.
    fn resolve_relocation(&mut self, tid: u32, tsc: u64, name: &str) -> Option<u64>;
    /// The relocation's original symbol name for a direct call whose
    /// target lands inside its own operand-patched byte range.
    fn relocation_name_at(&mut self, module: ModuleId, addr: u64) -> Option<String>;
}

/// Sink for the per-task output stream (§6 "Per-task output stream").
pub trait Emitter {
    fn timestamp(&mut self, tsc: u64);
    fn execute(&mut self, depth: i32, module: ModuleId, symbol: SymbolId, instr_count: u64, tsc: u64);
    fn call(&mut self, depth: i32, callee_symbol: SymbolId);
    fn module(&mut self, module: ModuleId);
    fn schedule_in(&mut self, cpu: u32, tid: u32);
    fn schedule_out(&mut self, cpu: u32, tid: u32);
    fn interrupt_return(&mut self, depth: i32, addr: u64);
    fn warning(&mut self, warning: Warning);
}

/// Kernel-symbol suppression/rewriting table (§4.6 "Kernel heuristics").
#[derive(Debug, Clone, Default)]
pub struct KernelHeuristics {
    pub enabled: bool,
    pub suppressed: Vec<u64>,
    pub cmpxchg_helper: Option<u64>,
    pub copy_user_from: Option<u64>,
    pub copy_user_to: Option<u64>,
}

impl KernelHeuristics {
    fn should_suppress(&self, target: u64) -> bool {
        self.enabled && (self.suppressed.contains(&target) || Some(target) == self.cmpxchg_helper)
    }

    fn rewrite(&self, target: u64) -> u64 {
        if self.enabled && Some(target) == self.copy_user_from {
            self.copy_user_to.unwrap_or(target)
        } else {
            target
        }
    }
}

/// One CPU's raw trace bytes plus the tsc heuristics built over it, as
/// handed to the replay loop for every TRACE block it encounters.
pub struct CpuTrace<'a> {
    pub data: &'a [u8],
    pub timing: &'a TscHeuristics,
}

struct RunState {
    depth: i32,
    module: Option<ModuleId>,
    symbol: Option<SymbolId>,
    instr_count: u64,
    tsc: u64,
}

struct Context {
    pc: u64,
    lost: bool,
    call_stack: Vec<u64>,
    /// Number of frames present on `call_stack` at task start, e.g. when a
    /// trace begins mid-call. Depths reported to the emitter are relative
    /// to this baseline, not to an absolute stack size.
    seed_depth: i32,
    depth_low_water: i32,
    fup_far: Option<u64>,
    pending_tip: Option<u64>,
    tnt_bits: VecDeque<bool>,
    run: Option<RunState>,
    last_emitted_tsc: u64,
    current_tsc: u64,
}

impl Context {
    fn new() -> Self {
        Context {
            pc: 0,
            lost: true,
            call_stack: Vec::new(),
            seed_depth: 0,
            depth_low_water: 0,
            fup_far: None,
            pending_tip: None,
            tnt_bits: VecDeque::new(),
            run: None,
            last_emitted_tsc: 0,
            current_tsc: 0,
        }
    }

    /// Depth reported to the emitter never goes negative; an over-return
    /// past the seeded baseline is tracked separately in
    /// `depth_low_water` rather than surfacing as a negative depth here.
    fn depth(&self) -> i32 {
        (self.call_stack.len() as i32 - self.seed_depth).max(0)
    }

    fn enter_lost(&mut self, emitter: &mut (impl Emitter + ?Sized)) {
        self.flush_run(emitter);
        self.lost = true;
        emitter.warning(Warning::Lost);
    }

    fn flush_run(&mut self, emitter: &mut (impl Emitter + ?Sized)) {
        if let Some(run) = self.run.take() {
            if let (Some(module), Some(symbol)) = (run.module, run.symbol) {
                emitter.execute(run.depth, module, symbol, run.instr_count, run.tsc);
            }
        }
    }

    fn maybe_emit_timestamp(&mut self, emitter: &mut (impl Emitter + ?Sized)) {
        if self.current_tsc != self.last_emitted_tsc {
            emitter.timestamp(self.current_tsc);
            self.last_emitted_tsc = self.current_tsc;
        }
    }

    fn account(
        &mut self,
        module: ModuleId,
        symbol: SymbolId,
        emitter: &mut (impl Emitter + ?Sized),
    ) {
        let same = self
            .run
            .as_ref()
            .map(|r| r.module == Some(module) && r.symbol == Some(symbol))
            .unwrap_or(false);
        if !same {
            self.flush_run(emitter);
            if self.run.as_ref().map(|r| r.module) != Some(Some(module)) {
                emitter.module(module);
            }
            self.run = Some(RunState {
                depth: self.depth(),
                module: Some(module),
                symbol: Some(symbol),
                instr_count: 0,
                tsc: self.current_tsc,
            });
        }
        if let Some(run) = self.run.as_mut() {
            run.instr_count += 1;
        }
    }
}

/// Replays every TRACE block of `task`, in order, interleaving
/// SCHEDULE_IN/SCHEDULE_OUT emissions at `Enter`/`Leave` blocks.
pub fn replay_task(
    task: &Task,
    traces: &FxHashMap<u32, CpuTrace<'_>>,
    sideband: &SidebandModel,
    resolver: &mut dyn SymbolResolver,
    emitter: &mut dyn Emitter,
    disassembler: &dyn Disassembler,
    kernel: &KernelHeuristics,
) {
    let mut ctx = Context::new();
    for block in &task.blocks {
        match *block {
            Block::Enter { cpu, tsc } => {
                ctx.current_tsc = tsc;
                ctx.maybe_emit_timestamp(emitter);
                emitter.schedule_in(cpu, task.tid);
            }
            Block::Leave { cpu, tsc } => {
                ctx.flush_run(emitter);
                ctx.current_tsc = tsc;
                ctx.maybe_emit_timestamp(emitter);
                emitter.schedule_out(cpu, task.tid);
            }
            Block::Bad { .. } => {
                ctx.enter_lost(emitter);
            }
            Block::Trace {
                cpu,
                pos_start,
                lip_start,
                pos_end,
                ..
            } => {
                let Some(cpu_trace) = traces.get(&cpu) else {
                    continue;
                };
                replay_trace_block(
                    &mut ctx,
                    task.tid,
                    cpu,
                    cpu_trace,
                    pos_start,
                    lip_start,
                    pos_end,
                    sideband,
                    resolver,
                    emitter,
                    disassembler,
                    kernel,
                );
            }
        }
    }
    ctx.flush_run(emitter);
}

#[allow(clippy::too_many_arguments)]
fn replay_trace_block(
    ctx: &mut Context,
    tid: u32,
    cpu: u32,
    cpu_trace: &CpuTrace<'_>,
    pos_start: u64,
    lip_start: u64,
    pos_end: u64,
    sideband: &SidebandModel,
    resolver: &mut dyn SymbolResolver,
    emitter: &mut dyn Emitter,
    disassembler: &dyn Disassembler,
    kernel: &KernelHeuristics,
) {
    let mut parser = Parser::new(cpu_trace.data, pos_start, lip_start);
    while let Some(ev) = parser.next() {
        let token = match ev {
            ParseEvent::Token(t) => t,
            ParseEvent::Skip { warning, .. } => {
                emitter.warning(warning);
                continue;
            }
        };
        if token.offset >= pos_end {
            break;
        }

        match token.packet {
            Packet::Tnt { bits, count } => {
                for i in (0..count).rev() {
                    ctx.tnt_bits.push_back((bits >> i) & 1 != 0);
                }
            }
            Packet::Tip { addr, compressed } => {
                handle_tip(ctx, addr, compressed, emitter);
            }
            Packet::FupPge { addr } => {
                ctx.pc = addr;
                ctx.lost = false;
            }
            Packet::FupPgd { addr } => {
                ctx.pc = addr;
                ctx.enter_lost(emitter);
            }
            Packet::FupFar { addr } => {
                ctx.fup_far = Some(addr);
            }
            Packet::FupBufferOverflow { addr, compressed } => {
                emitter.warning(Warning::OverflowCompressed);
                ctx.flush_run(emitter);
                if compressed {
                    ctx.enter_lost(emitter);
                } else {
                    ctx.pc = addr;
                    ctx.lost = false;
                }
            }
            Packet::Mtc { .. } | Packet::Sts { .. } => {
                if let Some((begin, _)) = cpu_trace.timing.window_at(token.offset) {
                    ctx.current_tsc = begin;
                }
            }
            Packet::Pip { cr3, .. } => {
                sideband_associate(sideband, tid, cr3);
            }
            Packet::Psb | Packet::Ccp { .. } | Packet::TraceStop => {}
        }

        run_disassembler(ctx, tid, cpu, sideband, resolver, emitter, disassembler, kernel);
    }
}

fn sideband_associate(_sideband: &SidebandModel, _tid: u32, _cr3: u64) {
    // No cr3 field exists anywhere in the sideband event grammar to
    // cross-reference against; `tid` is already fixed by the enclosing
    // task, so there is nothing this association could change. See
    // DESIGN.md's C6 entry.
}

fn handle_tip(ctx: &mut Context, addr: u64, compressed: bool, emitter: &mut (impl Emitter + ?Sized)) {
    if ctx.lost && compressed {
        return;
    }
    if let Some(far) = ctx.fup_far {
        if ctx.pc != far {
            // Replay forward until pc reaches the FAR address before
            // consuming this TIP; the disassembler loop below drives that.
            ctx.pending_tip = Some(addr);
            return;
        }
        ctx.fup_far = None;
    }
    ctx.pending_tip = Some(addr);
    let _ = emitter;
}

#[allow(clippy::too_many_arguments)]
fn run_disassembler(
    ctx: &mut Context,
    tid: u32,
    cpu: u32,
    sideband: &SidebandModel,
    resolver: &mut dyn SymbolResolver,
    emitter: &mut dyn Emitter,
    disassembler: &dyn Disassembler,
    kernel: &KernelHeuristics,
) {
    let _ = cpu;
    if ctx.lost {
        return;
    }
    loop {
        let pc = sideband.adjust_for_hook(ctx.pc);
        let Some(module) = resolver.module_for(tid, pc, ctx.current_tsc) else {
            ctx.enter_lost(emitter);
            return;
        };
        let Some(bytes) = resolver.bytes_at(tid, pc, ctx.current_tsc, 16) else {
            ctx.enter_lost(emitter);
            return;
        };
        let Some(insn) = disassembler.decode(&bytes, pc) else {
            ctx.enter_lost(emitter);
            return;
        };

        let symbol = resolver.symbol_id(module, pc);
        ctx.account(module, symbol, emitter);
        let fallthrough = pc.wrapping_add(insn.len);

        match insn.transfer {
            Transfer::None => {
                ctx.pc = fallthrough;
                if ctx.fup_far == Some(ctx.pc) {
                    ctx.fup_far = None;
                }
            }
            Transfer::DirectJump(target) => {
                ctx.pc = target;
            }
            Transfer::DirectConditional(target) => {
                let Some(taken) = ctx.tnt_bits.pop_front() else {
                    ctx.enter_lost(emitter);
                    return;
                };
                ctx.pc = if taken { target } else { fallthrough };
            }
            Transfer::DirectCall(target) => {
                let target = if target == fallthrough {
                    fallthrough
                } else if target > pc && target < fallthrough {
                    resolver
                        .relocation_name_at(module, target)
                        .and_then(|name| resolver.resolve_relocation(tid, ctx.current_tsc, &name))
                        .unwrap_or(target)
                } else {
                    target
                };
                let target = kernel.rewrite(target);
                if kernel.should_suppress(target) {
                    ctx.pc = fallthrough;
                } else {
                    ctx.call_stack.push(fallthrough);
                    let callee = resolver.symbol_id(module, target);
                    ctx.flush_run(emitter);
                    emitter.call(ctx.depth(), callee);
                    ctx.pc = target;
                }
            }
            Transfer::Indirect { is_call } => {
                let Some(target) = ctx.pending_tip.take() else {
                    ctx.enter_lost(emitter);
                    return;
                };
                let target = kernel.rewrite(target);
                if is_call {
                    if kernel.should_suppress(target) {
                        ctx.pc = fallthrough;
                    } else {
                        ctx.call_stack.push(fallthrough);
                        let callee_module = resolver.module_for(tid, target, ctx.current_tsc);
                        let callee = callee_module
                            .map(|m| resolver.symbol_id(m, target))
                            .unwrap_or(0);
                        ctx.flush_run(emitter);
                        emitter.call(ctx.depth(), callee);
                        ctx.pc = target;
                    }
                } else {
                    ctx.pc = target;
                }
            }
            Transfer::Return => {
                if let Some(ret_addr) = ctx.call_stack.pop() {
                    if resolver.module_for(tid, ret_addr, ctx.current_tsc).is_some() {
                        ctx.pc = ret_addr;
                    } else {
                        ctx.flush_run(emitter);
                        emitter.interrupt_return(ctx.depth(), ret_addr);
                        ctx.pc = ret_addr;
                        return;
                    }
                } else {
                    ctx.depth_low_water -= 1;
                    ctx.pc = fallthrough;
                }
            }
            Transfer::InterruptReturn => {
                let Some(target) = ctx.pending_tip.take() else {
                    ctx.enter_lost(emitter);
                    return;
                };
                while ctx.call_stack.last() != Some(&target) && !ctx.call_stack.is_empty() {
                    ctx.call_stack.pop();
                }
                ctx.flush_run(emitter);
                emitter.interrupt_return(ctx.depth(), target);
                ctx.pc = target;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::replay::disasm::DecodedInsn;
    use crate::sideband::events::{HookEvent, SidebandEvent};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Module(ModuleId),
        Execute(i32, ModuleId, SymbolId, u64),
        Call(i32, SymbolId),
        InterruptReturn(i32, u64),
        Warning(Warning),
    }

    #[derive(Default)]
    struct RecordingEmitter(Vec<Event>);

    impl Emitter for RecordingEmitter {
        fn timestamp(&mut self, _tsc: u64) {}

        fn execute(&mut self, depth: i32, module: ModuleId, symbol: SymbolId, instr_count: u64, _tsc: u64) {
            self.0.push(Event::Execute(depth, module, symbol, instr_count));
        }

        fn call(&mut self, depth: i32, callee_symbol: SymbolId) {
            self.0.push(Event::Call(depth, callee_symbol));
        }

        fn module(&mut self, module: ModuleId) {
            self.0.push(Event::Module(module));
        }

        fn schedule_in(&mut self, _cpu: u32, _tid: u32) {}
        fn schedule_out(&mut self, _cpu: u32, _tid: u32) {}

        fn interrupt_return(&mut self, depth: i32, addr: u64) {
            self.0.push(Event::InterruptReturn(depth, addr));
        }

        fn warning(&mut self, warning: Warning) {
            self.0.push(Event::Warning(warning));
        }
    }

    struct FakeDisassembler(BTreeMap<u64, DecodedInsn>);

    impl Disassembler for FakeDisassembler {
        fn decode(&self, _code: &[u8], pc: u64) -> Option<DecodedInsn> {
            self.0.get(&pc).copied()
        }
    }

    /// Single flat module covering a set of half-open `[lo, hi)` ranges;
    /// symbol ids are derived from address so runs of adjacent instructions
    /// that should merge into one `account()` cluster share a symbol.
    struct FakeResolver {
        ranges: Vec<(u64, u64)>,
    }

    impl FakeResolver {
        fn mapped(&self, addr: u64) -> bool {
            self.ranges.iter().any(|(lo, hi)| addr >= *lo && addr < *hi)
        }
    }

    impl SymbolResolver for FakeResolver {
        fn module_for(&mut self, _tid: u32, addr: u64, _tsc: u64) -> Option<ModuleId> {
            self.mapped(addr).then_some(0)
        }

        fn bytes_at(&mut self, _tid: u32, addr: u64, _tsc: u64, _max_len: usize) -> Option<Vec<u8>> {
            self.mapped(addr).then(|| vec![0u8; 16])
        }

        fn symbol_id(&mut self, _module: ModuleId, addr: u64) -> SymbolId {
            (addr / 0x10) as SymbolId
        }

        fn resolve_relocation(&mut self, _tid: u32, _tsc: u64, _name: &str) -> Option<u64> {
            None
        }

        fn relocation_name_at(&mut self, _module: ModuleId, _addr: u64) -> Option<String> {
            None
        }
    }

    fn no_sideband() -> SidebandModel {
        SidebandModel::from_events(Vec::new())
    }

    fn kernel_off() -> KernelHeuristics {
        KernelHeuristics::default()
    }

    fn run(
        ctx: &mut Context,
        sideband: &SidebandModel,
        resolver: &mut FakeResolver,
        disassembler: &FakeDisassembler,
        kernel: &KernelHeuristics,
    ) -> Vec<Event> {
        let mut emitter = RecordingEmitter::default();
        run_disassembler(ctx, 7, 0, sideband, resolver, &mut emitter, disassembler, kernel);
        emitter.0
    }

    /// S1: `add; ret` at 0x1000 with the call stack seeded with 0xdead,
    /// which the original frame never resolves to a mapped module.
    #[test]
    fn s1_return_past_seeded_frame_emits_interrupt_return() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x1000, DecodedInsn { len: 3, transfer: Transfer::None }),
            (0x1003, DecodedInsn { len: 1, transfer: Transfer::Return }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x1000, 0x1004)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x1000;
        ctx.current_tsc = 100;
        ctx.call_stack.push(0xdead);
        ctx.seed_depth = 1;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![
                Event::Module(0),
                Event::Execute(0, 0, 0x100, 2),
                Event::InterruptReturn(0, 0xdead),
            ]
        );
        assert_eq!(ctx.pc, 0xdead);
        assert!(!ctx.lost);
        assert!(ctx.call_stack.is_empty());
    }

    /// A straight-line run of non-transfer instructions must be walked to
    /// completion in a single `run_disassembler` pass, not stopped after
    /// the first instruction.
    #[test]
    fn straight_line_run_is_walked_without_stopping_per_instruction() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x2000, DecodedInsn { len: 1, transfer: Transfer::None }),
            (0x2001, DecodedInsn { len: 1, transfer: Transfer::None }),
            (0x2002, DecodedInsn { len: 1, transfer: Transfer::None }),
            (0x2003, DecodedInsn { len: 1, transfer: Transfer::None }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x2000, 0x2004)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x2000;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x200, 4), Event::Warning(Warning::Lost)]
        );
        assert!(ctx.lost);
    }

    /// A multi-bit TNT packet must resolve every pending conditional it
    /// covers in one pass, not one bit per subsequent packet.
    #[test]
    fn multi_bit_tnt_resolves_several_conditionals_in_one_pass() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x4000, DecodedInsn { len: 2, transfer: Transfer::DirectConditional(0x4100) }),
            (0x4002, DecodedInsn { len: 2, transfer: Transfer::DirectConditional(0x4200) }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x4000, 0x4004)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x4000;
        ctx.tnt_bits.extend([false, true]);

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x400, 2), Event::Warning(Warning::Lost)]
        );
        assert_eq!(ctx.pc, 0x4200);
        assert!(ctx.tnt_bits.is_empty());
    }

    /// A return to a resolvable caller must continue the walk silently;
    /// only a return to an unresolvable address is reported.
    #[test]
    fn return_to_mapped_caller_continues_without_emission() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x5000, DecodedInsn { len: 1, transfer: Transfer::Return }),
            (0x6000, DecodedInsn { len: 1, transfer: Transfer::None }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x5000, 0x5001), (0x6000, 0x6001)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x5000;
        ctx.call_stack.push(0x6000);
        ctx.seed_depth = 1;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![
                Event::Module(0),
                Event::Execute(0, 0, 0x500, 1),
                Event::Execute(0, 0, 0x600, 1),
                Event::Warning(Warning::Lost),
            ]
        );
        assert!(ctx.call_stack.is_empty());
    }

    /// Returning past an empty call stack is a low-water excursion, not a
    /// reportable event.
    #[test]
    fn empty_call_stack_return_decrements_low_water_silently() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x7000, DecodedInsn { len: 1, transfer: Transfer::Return }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x7000, 0x7001)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x7000;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x700, 1), Event::Warning(Warning::Lost)]
        );
        assert_eq!(ctx.depth_low_water, -1);
    }

    /// Boundary: a conditional that finds no pending TNT bit enters the
    /// lost state rather than guessing a direction.
    #[test]
    fn conditional_with_no_tnt_bit_is_lost() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x8000, DecodedInsn { len: 2, transfer: Transfer::DirectConditional(0x8100) }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x8000, 0x8002)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x8000;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x800, 1), Event::Warning(Warning::Lost)]
        );
        assert!(ctx.lost);
    }

    /// Boundary: an indirect call with no pending TIP enters the lost
    /// state rather than guessing a target.
    #[test]
    fn indirect_call_with_no_pending_tip_is_lost() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x9000, DecodedInsn { len: 2, transfer: Transfer::Indirect { is_call: true } }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x9000, 0x9002)] };
        let sideband = no_sideband();
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x9000;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x900, 1), Event::Warning(Warning::Lost)]
        );
        assert!(ctx.lost);
    }

    /// A kernel-suppressed direct call (mcount-style) must not be recorded
    /// as a call and the walk must continue past it.
    #[test]
    fn kernel_suppressed_call_is_skipped_and_walk_continues() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x1000, DecodedInsn { len: 5, transfer: Transfer::DirectCall(0x2000) }),
            (0x1005, DecodedInsn { len: 1, transfer: Transfer::None }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x1000, 0x1006)] };
        let sideband = no_sideband();
        let mut kernel = kernel_off();
        kernel.enabled = true;
        kernel.suppressed.push(0x2000);

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0x1000;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x100, 2), Event::Warning(Warning::Lost)]
        );
        assert!(!events.iter().any(|e| matches!(e, Event::Call(..))));
    }

    /// S6: a pc inside a hook's copy range is resolved as if it were the
    /// original address before the resolver or disassembler ever see it.
    #[test]
    fn hook_copy_range_resolves_through_original_address() {
        let disassembler = FakeDisassembler(BTreeMap::from([
            (0x8150_0020, DecodedInsn { len: 1, transfer: Transfer::None }),
        ]));
        let mut resolver = FakeResolver { ranges: vec![(0x8150_0020, 0x8150_0021)] };
        let sideband = SidebandModel::from_events([SidebandEvent::Hook(HookEvent {
            original_addr: 0x8150_0000,
            copy_addr: Some(0xc000_0000),
            copy_len: 0x40,
            wrapper_addr: None,
            name: None,
        })]);
        let kernel = kernel_off();

        let mut ctx = Context::new();
        ctx.lost = false;
        ctx.pc = 0xc000_0020;

        let events = run(&mut ctx, &sideband, &mut resolver, &disassembler, &kernel);

        assert_eq!(
            events,
            vec![Event::Module(0), Event::Execute(0, 0, 0x8150002, 1), Event::Warning(Warning::Lost)]
        );
    }
}
