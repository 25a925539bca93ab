//! Orchestration: builds the collection from raw traces and a sideband
//! log, then fans out one replay worker process per task up to `-P`
//! (§5 "Scheduling model"), grounded on the re-exec pattern `samply`
//! avoids but `perfrecord`'s child-process launch in
//! `samply/src/linux/profiler.rs` demonstrates for this codebase's idiom
//! of shelling out to `std::process::Command`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{info, warn};
use memmap2::Mmap;

use crate::cli::Opt;
use crate::collect::{self, serialize, Collection};
use crate::error::{ReconstructError, Result, Summary, Warning};
use crate::sched::{self, VmSection};
use crate::sideband::{self, SidebandModel};
use crate::timing::TscHeuristics;

pub fn run(opt: &Opt) -> Result<()> {
    if let Some(tid) = opt.replay_worker {
        return run_worker(opt, tid);
    }
    run_driver(opt)
}

fn open_mmap(path: &PathBuf) -> Result<Mmap> {
    let file = File::open(path).map_err(|source| ReconstructError::Open {
        path: path.clone(),
        source,
    })?;
    unsafe { Mmap::map(&file) }.map_err(|source| ReconstructError::Read {
        path: path.clone(),
        source,
    })
}

fn load_sideband(path: &PathBuf) -> Result<SidebandModel> {
    let file = File::open(path).map_err(|source| ReconstructError::Open {
        path: path.clone(),
        source,
    })?;
    let events = sideband::parse::read(BufReader::new(file))?;
    Ok(SidebandModel::from_events(events))
}

fn run_driver(opt: &Opt) -> Result<()> {
    let sideband = match &opt.sideband {
        Some(path) => load_sideband(path)?,
        None => SidebandModel::from_events(std::iter::empty()),
    };

    let mmaps: Vec<Mmap> = opt.raw.iter().map(open_mmap).collect::<Result<_>>()?;
    let mut collection = Collection::default();
    collection.sideband = opt.sideband.as_ref().map(|p| p.display().to_string());
    for path in &opt.raw {
        collection.traces.push(path.display().to_string());
    }

    let mut timelines = Vec::with_capacity(mmaps.len());
    for (cpu, mmap) in mmaps.iter().enumerate() {
        let cpu = cpu as u32;
        let data: &[u8] = mmap;
        let end = data.len() as u64;
        let timing = TscHeuristics::build(data, 0, end);
        let vm_sections: Vec<VmSection> = Vec::new();
        let quanta = sched::build_quanta(cpu, data, 0, end, &sideband, &timing, &vm_sections);
        let timeline = collect::build_cpu_timeline(cpu, data, 0, end, &timing, &quanta);
        timelines.push(timeline);
    }
    collect::merge_into_collection(&mut collection, &timelines);

    for tid in collection.sorted_tids() {
        if let Some(process) = sideband.process_for_tid(tid) {
            collection.task_mut(tid).name = process.name.clone();
        }
    }

    let collection_file = File::create(&opt.collection).map_err(|source| ReconstructError::Open {
        path: opt.collection.clone(),
        source,
    })?;
    serialize::write(&collection, BufWriter::new(collection_file)).map_err(|source| {
        ReconstructError::Read {
            path: opt.collection.clone(),
            source,
        }
    })?;

    let tids = collection.sorted_tids();
    info!("collection built: {} tasks across {} cpus", tids.len(), opt.raw.len());
    spawn_workers(opt, &tids)
}

fn spawn_workers(opt: &Opt, tids: &[u32]) -> Result<()> {
    let exe = std::env::current_exe().map_err(|source| ReconstructError::WorkerSpawn {
        tid: tids.first().copied().unwrap_or(0),
        source,
    })?;

    let mut pending: VecDeque<u32> = tids.iter().copied().collect();
    let mut running: Vec<(u32, std::process::Child)> = Vec::new();
    let mut failures = 0usize;
    let mut summary = Summary::new();

    while !pending.is_empty() || !running.is_empty() {
        while running.len() < opt.parallel.max(1) {
            let Some(tid) = pending.pop_front() else { break };
            let mut cmd = Command::new(&exe);
            cmd.arg("--replay-worker").arg(tid.to_string());
            cmd.arg("-C").arg(&opt.collection);
            if let Some(out) = &opt.output {
                cmd.arg("-o").arg(out);
            }
            if let Some(w) = &opt.low_water {
                cmd.arg("-w").arg(w);
            }
            for root in &opt.target_roots {
                cmd.arg("-t").arg(root);
            }
            cmd.stdout(Stdio::piped());
            let child = cmd.spawn().map_err(|source| ReconstructError::WorkerSpawn { tid, source })?;
            running.push((tid, child));
        }

        if let Some((tid, mut child)) = running.pop() {
            let output = child.wait_with_output();
            match output {
                Ok(output) if output.status.success() => {
                    for line in String::from_utf8_lossy(&output.stdout).lines() {
                        if let Some((tag, count)) = line.split_once(": ") {
                            if let (Some(w), Ok(n)) = (Warning::from_tag(tag), count.trim().parse::<u64>()) {
                                for _ in 0..n {
                                    summary.record(w);
                                }
                            }
                        }
                    }
                }
                Ok(_) => {
                    failures += 1;
                    warn!("replay worker for tid {tid} exited with a non-zero status");
                }
                Err(source) => return Err(ReconstructError::WorkerSpawn { tid, source }),
            }
        }
    }

    for line in summary.report_lines() {
        println!("{line}");
    }

    reconcile_tables(opt, tids)?;

    if failures > 0 {
        return Err(ReconstructError::WorkersFailed { count: failures });
    }
    Ok(())
}

/// Symbol/executable table path for one worker's temporary output, merged
/// into the final `-n`/`-e`/`-h` path once every worker has exited (§6
/// "Symbol and module tables" are append-only text files reconciled after
/// the run; each worker owns a disjoint set of module/symbol ids so the
/// reconciliation is a plain line-level merge, not a renumbering).
fn worker_table_path(base: &Path, tid: u32) -> PathBuf {
    let mut name = base.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{tid}"));
    base.with_file_name(name)
}

fn reconcile_tables(opt: &Opt, tids: &[u32]) -> Result<()> {
    for base in [&opt.symbols, &opt.executables, &opt.host_executables]
        .into_iter()
        .flatten()
    {
        let mut out = String::new();
        for &tid in tids {
            let part = worker_table_path(base, tid);
            if let Ok(contents) = std::fs::read_to_string(&part) {
                out.push_str(&contents);
                let _ = std::fs::remove_file(&part);
            }
        }
        std::fs::write(base, out).map_err(|source| ReconstructError::Open {
            path: base.clone(),
            source,
        })?;
    }
    Ok(())
}

fn run_worker(opt: &Opt, tid: u32) -> Result<()> {
    let file = File::open(&opt.collection).map_err(|source| ReconstructError::Open {
        path: opt.collection.clone(),
        source,
    })?;
    let collection = serialize::read(BufReader::new(file))?;

    let Some(task) = collection.tasks.get(&tid) else {
        return Ok(());
    };

    let mmaps: Vec<Mmap> = collection
        .traces
        .iter()
        .map(PathBuf::from)
        .map(|p| open_mmap(&p))
        .collect::<Result<_>>()?;
    let timings: Vec<TscHeuristics> = mmaps
        .iter()
        .map(|m| TscHeuristics::build(m, 0, m.len() as u64))
        .collect();

    let mut cpu_traces = rustc_hash::FxHashMap::default();
    for (cpu, (mmap, timing)) in mmaps.iter().zip(timings.iter()).enumerate() {
        cpu_traces.insert(
            cpu as u32,
            crate::replay::CpuTrace {
                data: &mmap[..],
                timing,
            },
        );
    }

    let sideband = match &collection.sideband {
        Some(path) => load_sideband(&PathBuf::from(path))?,
        None => SidebandModel::from_events(std::iter::empty()),
    };

    let mut resolver = crate::elf::ElfResolver::new(&sideband, opt.target_roots.clone());
    let disassembler = crate::replay::disasm::X86_64Disassembler::new();
    let kernel = crate::kernel::load_heuristics(opt)?;

    let output_path = opt
        .output
        .as_deref()
        .map(|fmt| fmt.replace("%u", &tid.to_string()));
    let mut sink = TextEmitter::new(output_path.as_deref())?;

    crate::replay::replay_task(task, &cpu_traces, &sideband, &mut resolver, &mut sink, &disassembler, &kernel);

    write_tables(opt, tid, &resolver)?;

    if let Some(fmt) = &opt.low_water {
        let path = fmt.replace("%u", &tid.to_string());
        let mut f = File::create(&path).map_err(|source| ReconstructError::Open {
            path: path.into(),
            source,
        })?;
        writeln!(f, "{}", sink.low_water_mark).ok();
    }

    for line in sink.summary.report_lines() {
        println!("{line}");
    }
    Ok(())
}

/// Writes this worker's share of the `-n`/`-e`/`-h` tables, later merged by
/// [`reconcile_tables`]. Each module/symbol id is only meaningful within
/// this worker's own table file, so lines carry the resolved name rather
/// than the bare id.
fn write_tables(opt: &Opt, tid: u32, resolver: &crate::elf::ElfResolver<'_>) -> Result<()> {
    if let Some(base) = &opt.symbols {
        let mut out = String::new();
        for name in resolver.symbol_names() {
            out.push_str(name);
            out.push('\n');
        }
        write_table_part(base, tid, &out)?;
    }
    if opt.executables.is_some() || opt.host_executables.is_some() {
        let mut executables = String::new();
        let mut host_executables = String::new();
        for (idx, path) in resolver.module_paths().iter().enumerate() {
            let line = format!("{}\n", path.display());
            if resolver.module_is_host(idx as crate::replay::ModuleId) {
                host_executables.push_str(&line);
            } else {
                executables.push_str(&line);
            }
        }
        if let Some(base) = &opt.executables {
            write_table_part(base, tid, &executables)?;
        }
        if let Some(base) = &opt.host_executables {
            write_table_part(base, tid, &host_executables)?;
        }
    }
    Ok(())
}

fn write_table_part(base: &PathBuf, tid: u32, contents: &str) -> Result<()> {
    let path = worker_table_path(base, tid);
    std::fs::write(&path, contents).map_err(|source| ReconstructError::Open { path, source })
}

/// Writes the `@ `-prefixed per-task output stream (§6 "Per-task output
/// stream") and tracks the low-water mark the normalizer later subtracts.
struct TextEmitter {
    out: Box<dyn Write>,
    low_water_mark: i32,
    summary: Summary,
}

impl TextEmitter {
    fn new(path: Option<&str>) -> Result<Self> {
        let out: Box<dyn Write> = match path {
            Some(path) => Box::new(BufWriter::new(File::create(path).map_err(|source| {
                ReconstructError::Open {
                    path: path.into(),
                    source,
                }
            })?)),
            None => Box::new(std::io::stdout()),
        };
        Ok(TextEmitter {
            out,
            low_water_mark: 0,
            summary: Summary::new(),
        })
    }
}

impl crate::replay::Emitter for TextEmitter {
    fn timestamp(&mut self, tsc: u64) {
        let _ = writeln!(self.out, "@ t {tsc:#x}");
    }

    fn execute(&mut self, depth: i32, _module: u32, symbol: u32, instr_count: u64, _tsc: u64) {
        let _ = writeln!(self.out, "@ e {depth} {symbol} {instr_count}");
    }

    fn call(&mut self, depth: i32, callee_symbol: u32) {
        self.low_water_mark = self.low_water_mark.min(depth);
        let _ = writeln!(self.out, "@ c {depth} {callee_symbol}");
    }

    fn module(&mut self, module: u32) {
        let _ = writeln!(self.out, "@ x {module}");
    }

    fn schedule_in(&mut self, cpu: u32, _tid: u32) {
        let _ = writeln!(self.out, "@ > {cpu}");
    }

    fn schedule_out(&mut self, cpu: u32, _tid: u32) {
        let _ = writeln!(self.out, "@ < {cpu}");
    }

    fn interrupt_return(&mut self, depth: i32, addr: u64) {
        self.low_water_mark = self.low_water_mark.min(depth);
        let _ = writeln!(self.out, "@ r {depth} {addr:#x}");
    }

    fn warning(&mut self, warning: Warning) {
        self.summary.record(warning);
    }
}

