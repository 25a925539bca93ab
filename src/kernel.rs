//! Loads the kernel symbol table the replay engine's kernel heuristics
//! consult at startup (§4.6 "Kernel heuristics").

use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::cli::Opt;
use crate::error::{ReconstructError, Result};
use crate::replay::KernelHeuristics;

const SUPPRESSED_NAMES: &[&str] = &["mcount", "__fentry__"];
const CMPXCHG_NAME: &str = "this_cpu_cmpxchg16b_emu";
const COPY_USER_FROM: &str = "copy_user_generic_unrolled";
const COPY_USER_TO: &str = "copy_user_generic_string";

/// Parses a `System.map`-style `<hex addr> <type char> <name>` table.
pub fn load_heuristics(opt: &Opt) -> Result<KernelHeuristics> {
    let mut heuristics = KernelHeuristics {
        enabled: opt.heuristics_enabled(),
        ..KernelHeuristics::default()
    };

    let Some(path) = &opt.kernel_map else {
        return Ok(heuristics);
    };
    let file = File::open(path).map_err(|source| ReconstructError::Open {
        path: path.clone(),
        source,
    })?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| ReconstructError::Read {
            path: path.clone(),
            source,
        })?;
        let mut fields = line.split_whitespace();
        let Some(addr_str) = fields.next() else { continue };
        let Some(_kind) = fields.next() else { continue };
        let Some(name) = fields.next() else { continue };
        let Ok(addr) = u64::from_str_radix(addr_str, 16) else {
            continue;
        };
        if SUPPRESSED_NAMES.contains(&name) {
            heuristics.suppressed.push(addr);
        } else if name == CMPXCHG_NAME {
            heuristics.cmpxchg_helper = Some(addr);
        } else if name == COPY_USER_FROM {
            heuristics.copy_user_from = Some(addr);
        } else if name == COPY_USER_TO {
            heuristics.copy_user_to = Some(addr);
        }
    }
    Ok(heuristics)
}
