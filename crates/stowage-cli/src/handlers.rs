//! Command handlers.

use crate::config::{Backend, CliConfig, OutputFormat};
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_cache::{Cacher, FilesystemStore, GcsStore, ObjectStore, expand_key, hash_glob};
use stowage_core::{RestoreRequest, SaveRequest};
use tracing::{debug, warn};

type HandlerResult = Result<(), Box<dyn std::error::Error>>;

/// Build a cacher over the configured backend.
pub fn cacher(config: &CliConfig) -> stowage_core::Result<Cacher> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        Backend::Gcs => {
            debug!(endpoint = %config.endpoint, "Using Cloud Storage backend");
            Arc::new(GcsStore::new(&config.endpoint, config.token.clone())?)
        }
        Backend::Filesystem => {
            let store = match &config.root {
                Some(root) => FilesystemStore::new(root),
                None => FilesystemStore::default(),
            };
            debug!(root = %store.root_dir().display(), "Using filesystem backend");
            Arc::new(store)
        }
    };
    Ok(Cacher::new(store))
}

/// Split restore keys on commas, dropping blanks.
pub fn split_keys(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> HandlerResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report a pipeline failure, swallowing it when failures are allowed.
fn tolerate(allow_failure: bool, operation: &str, err: stowage_core::Error) -> HandlerResult {
    if !allow_failure {
        return Err(err.into());
    }
    warn!(error = %err, "{} failed, continuing", operation);
    eprintln!("{} {} failed: {}", style("!").yellow(), operation, err);
    Ok(())
}

/// Save a directory to the cache.
pub fn save(
    config: &CliConfig,
    bucket: &str,
    dir: &Path,
    key: &str,
    allow_failure: bool,
) -> HandlerResult {
    let key = expand_key(key)?;
    let outcome = SaveRequest::new(bucket, dir, key)
        .and_then(|request| cacher(config)?.save(&request));

    match outcome {
        Ok(result) => match config.output_format {
            OutputFormat::Json => print_json(&result),
            OutputFormat::Table => {
                println!(
                    "{} Saved {} ({} files, {} bytes) in {}ms",
                    style("✓").green(),
                    style(&result.key).bold(),
                    result.entries,
                    result.bytes,
                    result.duration_ms
                );
                Ok(())
            }
        },
        Err(err) => tolerate(allow_failure, "Save", err),
    }
}

/// Restore the freshest matching cache into a directory.
pub fn restore(
    config: &CliConfig,
    bucket: &str,
    dir: &Path,
    keys: &[String],
    allow_failure: bool,
) -> HandlerResult {
    let keys = split_keys(keys)
        .iter()
        .map(|k| expand_key(k))
        .collect::<Result<Vec<_>, _>>()?;
    let outcome = RestoreRequest::new(bucket, dir, keys)
        .and_then(|request| cacher(config)?.restore(&request));

    match outcome {
        Ok(result) => match config.output_format {
            OutputFormat::Json => print_json(&result),
            OutputFormat::Table => {
                let label = if result.exact_match {
                    style("exact match").green()
                } else {
                    style("fallback").yellow()
                };
                println!(
                    "{} Restored {} ({}, {} files) in {}ms",
                    style("✓").green(),
                    style(&result.matched_key).bold(),
                    label,
                    result.entries,
                    result.duration_ms
                );
                Ok(())
            }
        },
        Err(err) => tolerate(allow_failure, "Restore", err),
    }
}

/// Print the hash of the files matching a glob.
pub fn hash(pattern: &str) -> HandlerResult {
    println!("{}", hash_glob(pattern)?);
    Ok(())
}

/// List cached objects.
pub fn list(config: &CliConfig, bucket: &str, prefix: &str) -> HandlerResult {
    let objects = cacher(config)?.list(bucket, prefix)?;

    if config.output_format == OutputFormat::Json {
        return print_json(&objects);
    }
    if objects.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(());
    }

    let width = objects.iter().map(|o| o.key.len()).max().unwrap_or(0);
    for object in &objects {
        println!(
            "{:<width$}  {:>12}  {}",
            object.key,
            object.size_bytes,
            style(object.last_modified.format("%Y-%m-%d %H:%M:%S UTC")).dim(),
            width = width
        );
    }
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig, path: &Path) -> HandlerResult {
    if config.output_format == OutputFormat::Json {
        let mut redacted = config.clone();
        redacted.token = redacted.token.map(|_| "***".to_string());
        return print_json(&redacted);
    }

    println!("Current configuration:");
    println!("  backend: {:?}", config.backend);
    println!("  endpoint: {}", config.endpoint);
    println!(
        "  root: {}",
        config
            .root
            .as_deref()
            .map_or_else(|| "(default)".to_string(), |r| r.display().to_string())
    );
    println!(
        "  token: {}",
        if config.token.is_some() {
            "***"
        } else {
            "(not set)"
        }
    );
    println!("  output_format: {:?}", config.output_format);
    println!("\nConfig file: {}", path.display());
    Ok(())
}

/// Set configuration.
pub fn set_config(path: &Path, key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load_from(path)?;
    config.set(key, value)?;
    config.save_to(path)?;

    let shown = if key == "token" { "***" } else { value };
    println!("{} Set {} = {}", style("✓").green(), key, shown);
    Ok(())
}

/// Resolve the config file path from the flag or the default location.
pub fn config_path(flag: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match flag {
        Some(path) => Ok(path),
        None => Ok(CliConfig::config_path()?),
    }
}
