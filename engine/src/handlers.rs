//! Command handlers for CLI operations
//!
//! - validate: check a manifest and list every problem
//! - digest: print the canonical digest of a valid manifest
//! - permissions / presets: show the vocabulary
//! - config show / path: show the effective configuration

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;

use crate::config::Config;
use crate::validator::{ManifestValidator, ValidationReport};
use sdk::limits::ResourcePreset;
use sdk::permissions::Permission;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn read_report(file: &Path) -> Result<ValidationReport> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read manifest {}", file.display()))?;
    let validator = ManifestValidator::new()?;
    Ok(validator.validate_text(&text))
}

/// Validate a manifest file
///
/// Fails when the manifest has any problem so scripts can rely on the exit code.
pub fn handle_validate(file: &Path, format: OutputFormat) -> Result<()> {
    let report = read_report(file)?;

    match format {
        OutputFormat::Text => {
            if let Some(manifest) = report.normalized.as_ref().filter(|_| report.valid) {
                println!("✓ {} {} is valid", manifest.id, manifest.version);
                println!("  Type: {}", manifest.plugin_type.as_str());
                println!("  Permissions: {}", manifest.permissions.len());
                for permission in &manifest.permissions {
                    let marker = if permission.is_high_risk() { "!" } else { " " };
                    println!("   {} {}", marker, permission);
                }
            } else {
                println!("✗ {} problem(s) found:", report.errors.len());
                for error in &report.errors {
                    println!("  - {}", error);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    if !report.valid {
        bail!("manifest {} is invalid", file.display());
    }
    Ok(())
}

/// Print the digest a signature over this manifest must cover
pub fn handle_digest(file: &Path, format: OutputFormat) -> Result<()> {
    let manifest = read_report(file)?.into_result()?;
    let digest = manifest
        .canonical_digest()
        .context("Failed to canonicalize manifest")?;

    match format {
        OutputFormat::Text => println!("{}", digest),
        OutputFormat::Json => {
            let output = json!({
                "pluginId": manifest.id,
                "version": manifest.version,
                "digest": digest,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

pub fn handle_permissions(format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Permissions (! = high risk, * = requires escalation):");
            println!();
            for permission in Permission::ALL {
                let marker = match (permission.is_high_risk(), permission.requires_escalation()) {
                    (_, true) => "*",
                    (true, false) => "!",
                    _ => " ",
                };
                println!(
                    "  {} {:<22} {}",
                    marker,
                    permission.as_str(),
                    permission.description()
                );
            }
        }
        OutputFormat::Json => {
            let infos: Vec<_> = Permission::ALL.iter().map(|p| p.info()).collect();
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
    }
    Ok(())
}

pub fn handle_presets(format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!(
                "  {:<13} {:>9} {:>5} {:>14} {:>10} {:>6}",
                "PRESET", "MEMORY", "CPU", "NETWORK", "EXEC", "CALLS"
            );
            for preset in ResourcePreset::ALL {
                let limits = preset.limits();
                println!(
                    "  {:<13} {:>6} MB {:>4}% {:>14} {:>7} ms {:>6}",
                    preset.name(),
                    limits.max_memory_mb,
                    limits.max_cpu_percent,
                    limits.max_network_bytes,
                    limits.max_execution_ms,
                    limits.max_concurrent_calls
                );
            }
        }
        OutputFormat::Json => {
            let presets: Vec<_> = ResourcePreset::ALL
                .iter()
                .map(|p| json!({ "name": p.name(), "limits": p.limits() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&presets)?);
        }
    }
    Ok(())
}

pub fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", config.to_toml()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}

pub fn handle_config_path(path: &Path, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", path.display()),
        OutputFormat::Json => {
            println!("{}", json!({ "path": path.display().to_string() }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn manifest_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const VALID: &str = r#"{
        "manifestVersion": "1.1",
        "id": "log-sink",
        "name": "Log Sink",
        "version": "0.3.1",
        "author": {"name": "Ops"},
        "license": "MIT",
        "type": "sink",
        "main": "sink.wasm",
        "permissions": ["system:log"],
        "resourceLimits": "minimal"
    }"#;

    #[test]
    fn test_validate_reports_success_and_failure() {
        let good = manifest_file(VALID);
        assert!(handle_validate(good.path(), OutputFormat::Json).is_ok());

        let bad = manifest_file(&VALID.replace("system:log", "foo:bar"));
        assert!(handle_validate(bad.path(), OutputFormat::Text).is_err());
    }

    #[test]
    fn test_digest_requires_valid_manifest() {
        let good = manifest_file(VALID);
        assert!(handle_digest(good.path(), OutputFormat::Text).is_ok());

        let bad = manifest_file("{\"manifestVersion\": \"9\"}");
        assert!(handle_digest(bad.path(), OutputFormat::Text).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(handle_validate(Path::new("/nonexistent/plugin.json"), OutputFormat::Text).is_err());
    }
}
