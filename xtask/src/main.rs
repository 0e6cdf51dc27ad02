//! Development automation for the `ApiForge` workspace.
//!
//! Run with: `cargo xtask <command>`
//!
//! Output is for developers at a terminal, so `println!`/`eprintln!` are used
//! rather than structured logging.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::env;
use std::process::{Command, ExitCode};

use anyhow::{bail, Context, Result};

mod features;

fn main() -> ExitCode {
    let result = match env::args().nth(1).as_deref() {
        Some("ci") => run_ci(),
        Some("fmt") => cargo(&["fmt", "--all", "--", "--check"], "Run 'cargo fmt --all' to fix formatting"),
        Some("clippy") => cargo(&["clippy", "--all-targets", "--all-features"], "Clippy reported issues"),
        Some("test") => cargo(&["test", "--workspace", "--all-features"], "Tests failed"),
        Some("bench") => {
            cargo(&["bench", "-p", "apiforge-common", "--bench", "resilience_bench"], "Benchmarks failed")
        }
        Some("test-features") => features::test_feature_matrix(),
        Some("help") | None => {
            print_help();
            Ok(())
        }
        Some(unknown) => {
            eprintln!("Unknown task: {unknown}\n");
            print_help();
            Err(anyhow::anyhow!("Unknown task"))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Task failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    println!("ApiForge development tasks\n");
    println!("USAGE:\n    cargo xtask <TASK>\n");
    println!("TASKS:");
    println!("    ci             fmt, clippy, feature tiers and tests in sequence");
    println!("    fmt            Check formatting");
    println!("    clippy         Lint all targets with all features");
    println!("    test           Run the workspace tests");
    println!("    bench          Run the recovery engine benchmarks");
    println!("    test-features  Check each apiforge-common feature tier compiles alone");
    println!("    help           Show this message");
}

/// Everything CI gates on, stopping at the first failure
fn run_ci() -> Result<()> {
    println!("==> [1/4] Formatting");
    cargo(&["fmt", "--all", "--", "--check"], "Run 'cargo fmt --all' to fix formatting")?;

    println!("\n==> [2/4] Clippy");
    cargo(&["clippy", "--all-targets", "--all-features"], "Clippy reported issues")?;

    println!("\n==> [3/4] Feature tiers");
    features::test_feature_matrix()?;

    println!("\n==> [4/4] Tests");
    cargo(&["test", "--workspace", "--all-features"], "Tests failed")?;

    println!("\n✓ CI checks passed");
    Ok(())
}

/// Run `cargo <args>` and fail with `failure` on a non-zero exit
fn cargo(args: &[&str], failure: &str) -> Result<()> {
    let status = Command::new("cargo")
        .args(args)
        .status()
        .with_context(|| format!("Failed to spawn cargo {}", args.join(" ")))?;

    if !status.success() {
        bail!("{failure}");
    }

    Ok(())
}
