//! Command-line surface (§6 "CLI"), grounded on `samply`'s `clap` derive
//! `Opt` structs in `samply/src/main.rs`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "pt-reconstruct", version, about = "Reconstructs per-task instruction streams from an Intel PT trace and a sideband log")]
pub struct Opt {
    /// Collection file to write (or read, for a replay worker).
    #[arg(short = 'C', long = "collection")]
    pub collection: PathBuf,

    /// Raw per-CPU trace file; repeat once per CPU, in CPU order.
    #[arg(short = 'r', long = "raw")]
    pub raw: Vec<PathBuf>,

    /// Sideband event log.
    #[arg(short = 's', long = "sideband")]
    pub sideband: Option<PathBuf>,

    /// Kernel binary, for symbolizing kernel addresses.
    #[arg(short = 'k', long = "kernel")]
    pub kernel: Option<PathBuf>,

    /// Kernel symbol map (`System.map`-style).
    #[arg(short = 'm', long = "kernel-map")]
    pub kernel_map: Option<PathBuf>,

    /// Target filesystem root to resolve mapped paths against; repeatable.
    #[arg(short = 't', long = "target-root")]
    pub target_roots: Vec<PathBuf>,

    /// Kernel heuristics on/off; pass "off" or "none" to disable.
    #[arg(short = 'K', long = "heuristics")]
    pub heuristics: Option<String>,

    /// Disable return-address compression.
    #[arg(short = 'R', long = "no-return-compression")]
    pub no_return_compression: bool,

    /// Maximum number of parallel replay worker processes.
    #[arg(short = 'P', long = "parallel", default_value_t = 3)]
    pub parallel: usize,

    /// Per-task output path format; `%u` is replaced with the tid.
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Stack low-water-mark path format; `%u` is replaced with the tid.
    #[arg(short = 'w', long = "low-water")]
    pub low_water: Option<String>,

    /// Symbol table output path.
    #[arg(short = 'n', long = "symbols")]
    pub symbols: Option<PathBuf>,

    /// Executable table output path.
    #[arg(short = 'e', long = "executables")]
    pub executables: Option<PathBuf>,

    /// Host-executable table output path.
    #[arg(short = 'h', long = "host-executables")]
    pub host_executables: Option<PathBuf>,

    /// Emit disassembly alongside execution records.
    #[arg(short = 'd', long = "disassembly")]
    pub disassembly: bool,

    /// Increase log verbosity; repeatable.
    #[arg(short = 'D', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also log to standard error (in addition to `RUST_LOG`'s destination).
    #[arg(short = 'l', long = "log-stderr")]
    pub log_stderr: bool,

    /// Internal: re-invoked by the driver as a single-task replay worker.
    #[arg(long = "replay-worker", hide = true)]
    pub replay_worker: Option<u32>,
}

impl Opt {
    pub fn heuristics_enabled(&self) -> bool {
        !matches!(self.heuristics.as_deref(), Some("off") | Some("none"))
    }
}
