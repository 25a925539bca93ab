//! End-to-end smoke test driving the compiled binary directly, the way a
//! bin-only crate without a library target has to test its CLI surface.

use std::io::Write;
use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pt-reconstruct"))
}

/// §8 "Boundary behaviors": a trace file containing only a PSB and EOF
/// yields zero emissions and exit 0.
#[test]
fn psb_only_trace_exits_success() {
    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("cpu0.pt");
    let mut trace = std::fs::File::create(&trace_path).unwrap();
    let mut psb = vec![0x82u8, 0x02];
    psb.extend_from_slice(&[0u8; 8]);
    psb.push(0xc0);
    psb.extend_from_slice(&[0u8; 5]);
    trace.write_all(&psb).unwrap();
    drop(trace);

    let collection_path = dir.path().join("collection.txt");

    let status = bin()
        .arg("-C")
        .arg(&collection_path)
        .arg("-r")
        .arg(&trace_path)
        .arg("-P")
        .arg("1")
        .status()
        .expect("failed to run pt-reconstruct");

    assert!(status.success());
    assert!(collection_path.exists());
}

#[test]
fn missing_raw_trace_is_a_fatal_error() {
    let dir = tempfile::tempdir().unwrap();
    let collection_path = dir.path().join("collection.txt");
    let missing = dir.path().join("does-not-exist.pt");

    let status = bin()
        .arg("-C")
        .arg(&collection_path)
        .arg("-r")
        .arg(&missing)
        .status()
        .expect("failed to run pt-reconstruct");

    assert!(!status.success());
}
