//! xtask - Build and test automation for osal-sysarch
//!
//! Usage:
//!   cargo xtask test     # Run host tests (lib alone, then with the host feature)
//!   cargo xtask check    # Type-check the no_std library for a Cortex-M target
//!   cargo xtask smoke    # Run the host-sim binary and validate its markers
//!   cargo xtask help     # Show this help
//!
//! The smoke test drives the adapter end to end on the simulated kernel and
//! checks for deterministic markers on stdout, one per scenario.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const SIM_PATH: &str = "target/release/host-sim";

/// Embedded target used to prove the library stays `no_std`.
const CHECK_TARGET: &str = "thumbv7em-none-eabihf";

/// Scenario markers emitted by host-sim, in order.
const MARKERS: &[&str] = &[
    "Running host kernel", // main() entry, adapter pinned
    "PRIMITIVES_OK",       // mutex, semaphore, mailbox created via sys_arch
    "PIPE_OK",             // producer thread -> mailbox FIFO order verified
    "MTX_OK",              // contended mutex kept the counter exact
    "SEM_OK",              // interrupt-side signal and post handed over
    "HEALTH_OK",           // tick and stat hooks produced a report
];

/// Output that means the run is broken regardless of markers.
const FAILURE_PATTERNS: &[&str] = &["PANIC", "panic", "Failed to"];

/// Number of recent output lines to keep for diagnostics on failure.
const TAIL_LINES: usize = 20;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match cmd {
        "test" => host_test()?,
        "check" => target_check()?,
        "smoke" => sim_smoke()?,
        "help" | "--help" | "-h" => print_help(),
        _ => {
            eprintln!("Unknown command: {}", cmd);
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    eprintln!(
        r#"xtask - osal-sysarch automation

USAGE:
    cargo xtask <command>

COMMANDS:
    test     Run host tests (lib alone, then with --features host)
    check    Type-check the library for {target}
    smoke    Run host-sim and validate scenario markers
    help     Show this help

ENVIRONMENT:
    SMOKE_TIMEOUT    Timeout in seconds (default: 30)
    SMOKE_VERBOSE    Show full host-sim output

SMOKE TEST MARKERS:
    Running host kernel → PRIMITIVES_OK → PIPE_OK → MTX_OK → SEM_OK → HEALTH_OK

EXAMPLES:
    cargo xtask test                    # Unit tests on the simulated kernel
    SMOKE_VERBOSE=1 cargo xtask smoke   # Show the health report
"#,
        target = CHECK_TARGET
    );
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo")
        .args(args)
        .status()
        .with_context(|| format!("Failed to run cargo {}", args.join(" ")))?;
    if !status.success() {
        bail!("{} failed with status: {}", what, status);
    }
    Ok(())
}

/// Run unit tests. The first pass builds the library as the tests see it;
/// the second adds the `host` feature so the host-sim binary compiles too.
fn host_test() -> Result<()> {
    eprintln!("[xtask] Running host tests...");
    cargo(&["test", "-p", "osal-sysarch"], "cargo test")?;
    cargo(
        &["test", "-p", "osal-sysarch", "--features", "host"],
        "cargo test --features host",
    )?;
    eprintln!("[xtask] Host tests PASSED");
    Ok(())
}

/// Check the library without std for an embedded target.
fn target_check() -> Result<()> {
    eprintln!("[xtask] Checking no_std build for {}...", CHECK_TARGET);
    cargo(
        &["check", "-p", "osal-sysarch", "--lib", "--target", CHECK_TARGET],
        "no_std check",
    )?;
    cargo(
        &[
            "check",
            "-p",
            "osal-sysarch",
            "--lib",
            "--target",
            CHECK_TARGET,
            "--features",
            "defmt",
        ],
        "no_std check with defmt",
    )?;
    eprintln!("[xtask] no_std check PASSED");
    Ok(())
}

/// Build the host simulation binary.
fn build_sim() -> Result<PathBuf> {
    eprintln!("[xtask] Building host-sim...");
    cargo(
        &["build", "--release", "--features", "host", "--bin", "host-sim"],
        "cargo build",
    )?;

    let bin = PathBuf::from(SIM_PATH);
    if !bin.exists() {
        bail!("host-sim binary not found at {}", SIM_PATH);
    }
    Ok(bin)
}

/// Forward every line of `stream` to `tx` until either side closes.
fn forward_lines(stream: impl Read + Send + 'static, tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(l) => {
                    if tx.send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Smoke test with marker-driven validation.
///
/// stdout and stderr are read on their own threads so a stalled simulation
/// still hits the timeout instead of blocking on `lines()`. Panic messages
/// land on stderr and count as faults.
fn sim_smoke() -> Result<()> {
    let bin = build_sim()?;

    let timeout_secs: u64 = std::env::var("SMOKE_TIMEOUT")
        .unwrap_or_else(|_| "30".to_string())
        .parse()
        .unwrap_or(30);
    let verbose = std::env::var("SMOKE_VERBOSE").is_ok();
    let success_marker = MARKERS[MARKERS.len() - 1];

    eprintln!("[xtask] Running smoke test (timeout: {}s)...", timeout_secs);

    let mut child = Command::new(&bin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn host-sim")?;

    let (tx, rx) = mpsc::channel::<String>();
    let stdout = child.stdout.take().context("host-sim stdout not captured")?;
    let stderr = child.stderr.take().context("host-sim stderr not captured")?;
    forward_lines(stdout, tx.clone());
    forward_lines(stderr, tx);

    let timeout = Duration::from_secs(timeout_secs);
    let start = Instant::now();
    let mut seen_markers: Vec<bool> = vec![false; MARKERS.len()];
    let mut saw_fault = false;
    let mut saw_success = false;
    let mut recent_lines: Vec<String> = Vec::with_capacity(TAIL_LINES);

    loop {
        let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
            eprintln!("[xtask] TIMEOUT after {}s", timeout_secs);
            let _ = child.kill();
            break;
        };

        let line = match rx.recv_timeout(remaining.min(Duration::from_secs(1))) {
            Ok(l) => l,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        if verbose {
            eprintln!("  {}", line);
        }

        if recent_lines.len() >= TAIL_LINES {
            recent_lines.remove(0);
        }
        recent_lines.push(line.clone());

        if let Some(pattern) = FAILURE_PATTERNS.iter().find(|p| line.contains(*p)) {
            eprintln!("[xtask] FAULT detected ({}): {}", pattern, line);
            saw_fault = true;
            let _ = child.kill();
            break;
        }

        // Markers must appear in order; a later one before an earlier one
        // does not count.
        if let Some(next) = seen_markers.iter().position(|seen| !seen) {
            if line.contains(MARKERS[next]) {
                seen_markers[next] = true;
                if !verbose {
                    eprintln!("[xtask] Marker: {}", MARKERS[next]);
                }
            }
        }

        if seen_markers.iter().all(|seen| *seen) && line.contains(success_marker) {
            saw_success = true;
            break;
        }
    }

    let status = child.wait().context("Failed to wait for host-sim")?;

    eprintln!("\n[xtask] === Smoke Test Results ===");
    for (i, marker) in MARKERS.iter().enumerate() {
        let mark = if seen_markers[i] { "✓" } else { "✗" };
        eprintln!("  {} {}", mark, marker);
    }

    if saw_fault {
        bail!("Smoke test FAILED: fault detected");
    }

    if !saw_success || !status.success() {
        let missing: Vec<&str> = MARKERS
            .iter()
            .zip(&seen_markers)
            .filter(|(_, seen)| !**seen)
            .map(|(m, _)| *m)
            .collect();
        if !missing.is_empty() {
            eprintln!("\nMissing markers: {:?}", missing);
        }
        if !recent_lines.is_empty() {
            eprintln!("\nLast {} lines:", recent_lines.len());
            for l in &recent_lines {
                eprintln!("  {}", l);
            }
        }
        bail!(
            "Smoke test FAILED: {} not reached within {}s (exit: {})",
            success_marker,
            timeout_secs,
            status
        );
    }

    eprintln!("\n[xtask] Smoke test PASSED");
    Ok(())
}
