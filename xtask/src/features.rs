use std::process::Command;

use anyhow::{Context, Result};

/// Feature sets checked with `--no-default-features`
const FEATURE_COMBINATIONS: &[&[&str]] = &[
    &["foundation"],
    &["foundation", "observability"],
    &["runtime"],
    &["test-utils"],
];

/// Check that every feature tier of apiforge-common compiles on its own.
pub fn test_feature_matrix() -> Result<()> {
    println!("Testing {} apiforge-common feature combinations...", FEATURE_COMBINATIONS.len());

    for (index, features) in FEATURE_COMBINATIONS.iter().enumerate() {
        let joined = features.join(",");

        println!(
            "\n[{}/{}] cargo check -p apiforge-common --no-default-features --features {joined}",
            index + 1,
            FEATURE_COMBINATIONS.len(),
        );

        let status = Command::new("cargo")
            .args(["check", "-p", "apiforge-common", "--no-default-features", "--features"])
            .arg(&joined)
            .status()
            .with_context(|| format!("Failed to run cargo check for '{joined}'"))?;

        if !status.success() {
            anyhow::bail!("Feature combination '{joined}' failed to compile");
        }

        println!("✅ Features '{joined}' compiled successfully");
    }

    println!("\n✅ All {} feature combinations compile successfully!", FEATURE_COMBINATIONS.len());

    Ok(())
}
