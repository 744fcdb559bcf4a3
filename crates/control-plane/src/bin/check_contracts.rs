// Verify the published tool contracts against the built-in tools
//
// Usage: cargo run --bin check-contracts [-- path/to/tools.yaml]
//
// Exits non-zero when the manifest and the registered tools disagree, so CI
// and pre-commit hooks catch contract drift.

use anyhow::{Context, Result};
use runloop_core::{ContractManifest, ToolRegistry};
use std::process::ExitCode;

const DEFAULT_MANIFEST: &str = "contracts/tools.yaml";

fn run() -> Result<ExitCode> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_MANIFEST.to_string());
    let manifest = ContractManifest::load(&path)
        .with_context(|| format!("Failed to load manifest {path}"))?;
    let registry = ToolRegistry::with_defaults().context("Failed to register built-in tools")?;

    let mismatches = manifest.verify(&registry.contracts());
    if mismatches.is_empty() {
        println!(
            "{path}: {} contracts match the registered tools",
            manifest.contracts.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    for mismatch in &mismatches {
        eprintln!("{path}: {mismatch}");
    }
    eprintln!("{} contract mismatch(es)", mismatches.len());
    Ok(ExitCode::FAILURE)
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
