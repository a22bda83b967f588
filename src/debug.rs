use crate::models::Candidate;
use crate::normalizer::Rejection;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the `--debug` flag.
pub fn init_logging(debug: bool) {
    let default = if debug { "hyresvakt=debug,info" } else { "hyresvakt=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Serialize)]
struct RejectedCandidate<'a> {
    source_id: &'a str,
    missing: &'a [&'static str],
    candidate: &'a Candidate,
}

/// Write a rejected candidate to `dir` for offline inspection.
pub fn dump_rejected(
    dir: &Path,
    source_id: &str,
    n: usize,
    candidate: &Candidate,
    rejection: &Rejection,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("incomplete_{source_id}_{n}.json"));
    let record = RejectedCandidate {
        source_id,
        missing: &rejection.missing,
        candidate,
    };
    let json = serde_json::to_string_pretty(&record)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
