use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors: the process that hits one of these exits non-zero
/// with a single diagnostic line, per the error taxonomy's "fatal" row.
#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("syntax error in collection file at line {line}: {message}")]
    CollectionSyntax { line: usize, message: String },

    #[error("sideband/trace mismatch at tsc {tsc:#x}, offset {offset:#x}: {message}")]
    SemanticMismatch {
        tsc: u64,
        offset: u64,
        message: String,
    },

    #[error("failed to spawn replay worker for tid {tid}: {source}")]
    WorkerSpawn {
        tid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} worker(s) exited with a non-zero status")]
    WorkersFailed { count: usize },
}

/// Non-fatal conditions recovered locally and reported as `@ ! <tag> <count>`
/// lines plus an end-of-run summary (§7 "Propagation policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    ReservedPacket,
    TruncatedLip,
    BrokenPsb,
    C0Lookalike,
    OverflowCompressed,
    HugeMtcGap,
    Lost,
    MappingMiss,
}

impl Warning {
    /// The `<tag>` used in `@ ! <tag> <count>` output lines.
    pub fn tag(self) -> &'static str {
        match self {
            Warning::ReservedPacket => "reserved",
            Warning::TruncatedLip => "trunc-lip",
            Warning::BrokenPsb => "broken-psb",
            Warning::C0Lookalike => "c0-bug",
            Warning::OverflowCompressed => "overflow-compressed",
            Warning::HugeMtcGap => "huge-mtc-gap",
            Warning::Lost => "lost",
            Warning::MappingMiss => "mapping-miss",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Warning> {
        Warning::ALL.into_iter().find(|w| w.tag() == tag)
    }

    pub const ALL: [Warning; 8] = [
        Warning::ReservedPacket,
        Warning::TruncatedLip,
        Warning::BrokenPsb,
        Warning::C0Lookalike,
        Warning::OverflowCompressed,
        Warning::HugeMtcGap,
        Warning::Lost,
        Warning::MappingMiss,
    ];
}

/// Per-run warning counters, merged by the driver into one report line
/// per category (§7 "User-visible summary").
#[derive(Debug, Clone, Default)]
pub struct Summary {
    counts: rustc_hash::FxHashMap<&'static str, u64>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, warning: Warning) {
        *self.counts.entry(warning.tag()).or_insert(0) += 1;
    }

    pub fn count(&self, warning: Warning) -> u64 {
        self.counts.get(warning.tag()).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &Summary) {
        for (tag, count) in &other.counts {
            *self.counts.entry(tag).or_insert(0) += count;
        }
    }

    /// One line per non-zero category, in a stable order.
    pub fn report_lines(&self) -> Vec<String> {
        Warning::ALL
            .iter()
            .filter_map(|w| {
                let n = self.count(*w);
                (n > 0).then(|| format!("{}: {}", w.tag(), n))
            })
            .collect()
    }
}

pub type Result<T> = std::result::Result<T, ReconstructError>;
