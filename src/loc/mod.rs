mod clone;
pub use clone::{authenticated_clone_url, Cloner, GitCloner};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::{MetricsError, Result};
use crate::ignore::{source_extension, SourceFilter};
use crate::models::{ClonedTotals, RepositoryRef};
use crate::util;

pub const SCRATCH_PREFIX: &str = "repometrics-clone-";

pub struct LocOptions {
    pub scratch_root: PathBuf,
    pub clone_timeout: Duration,
    pub token: Option<String>,
    pub concurrency: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepoLoc {
    pub full_name: String,
    pub total_lines: u64,
    pub by_extension: BTreeMap<String, u64>,
}

pub async fn analyze(
    cloner: &dyn Cloner,
    repos: &[RepositoryRef],
    options: &LocOptions,
    now: DateTime<Utc>,
) -> ClonedTotals {
    let candidates = repos.iter().filter_map(|r| match (&r.url, &r.full_name) {
        (Some(url), Some(full_name)) => Some((url.as_str(), full_name.as_str())),
        _ => None,
    });
    let results: Vec<Result<RepoLoc>> = stream::iter(candidates)
        .map(|(url, full_name)| analyze_repo(cloner, url, full_name, options))
        .buffered(options.concurrency.max(1))
        .collect()
        .await;

    let mut partials = Vec::new();
    for result in results {
        match result {
            Ok(partial) => partials.push(partial),
            Err(err) => tracing::warn!(error = %err, "skipping repository for line count"),
        }
    }
    let mut totals = merge(partials);
    totals.timestamp = Some(now);
    totals
}

pub async fn analyze_repo(
    cloner: &dyn Cloner,
    url: &str,
    full_name: &str,
    options: &LocOptions,
) -> Result<RepoLoc> {
    util::ensure_dir(&options.scratch_root)
        .map_err(|err| MetricsError::Io(std::io::Error::other(format!("{err:#}"))))?;
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(&options.scratch_root)?;
    let checkout = scratch.path().join("checkout");
    let clone_url = authenticated_clone_url(url, options.token.as_deref());

    let outcome = run_clone(
        cloner,
        &clone_url,
        &checkout,
        full_name,
        options.clone_timeout,
    )
    .await;
    let counted = match outcome {
        Ok(()) => {
            let root = checkout.clone();
            tokio::task::spawn_blocking(move || count_tree(&root))
                .await
                .map_err(|err| MetricsError::Io(std::io::Error::other(err.to_string())))
                .and_then(|r| r)
        }
        Err(err) => Err(err),
    };

    remove_scratch(scratch).await;

    let by_extension = counted?;
    let total_lines = by_extension.values().sum();
    tracing::debug!(repo = %full_name, lines = total_lines, "counted cloned lines");
    Ok(RepoLoc {
        full_name: full_name.to_string(),
        total_lines,
        by_extension,
    })
}

const REMOVAL_ATTEMPTS: u32 = 3;
const REMOVAL_BACKOFF: Duration = Duration::from_millis(250);

// Helpers git spawned (remote-https, index-pack) can outlive a killed clone
// and keep writing for a moment, so removal is retried.
async fn remove_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    let mut last_err = match scratch.close() {
        Ok(()) => return,
        Err(err) => err,
    };
    for attempt in 1..REMOVAL_ATTEMPTS {
        tokio::time::sleep(REMOVAL_BACKOFF * attempt).await;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => return,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => last_err = err,
        }
    }
    tracing::warn!(path = %path.display(), error = %last_err, "failed to remove scratch directory");
}

async fn run_clone(
    cloner: &dyn Cloner,
    url: &str,
    dest: &Path,
    full_name: &str,
    timeout: Duration,
) -> Result<()> {
    tracing::debug!(repo = %full_name, url = %util::redact_url(url), "cloning");
    match tokio::time::timeout(timeout, cloner.shallow_clone(url, dest)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(MetricsError::Clone { reason, .. })) => Err(MetricsError::Clone {
            repo: full_name.to_string(),
            reason,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(MetricsError::CloneTimeout {
            repo: full_name.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

pub fn count_tree(root: &Path) -> Result<BTreeMap<String, u64>> {
    let filter = SourceFilter::new(root)
        .map_err(|err| MetricsError::Io(std::io::Error::other(format!("{err:#}"))))?;
    let mut by_extension = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !filter.is_ignored(entry.path(), entry.file_type().is_dir())
        });
    for entry in walker {
        let entry = entry.map_err(|err| {
            MetricsError::Io(
                err.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk loop detected")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(ext) = source_extension(entry.path()) else {
            continue;
        };
        let lines = count_non_blank(entry.path())?;
        *by_extension.entry(ext).or_insert(0) += lines;
    }
    Ok(by_extension)
}

fn count_non_blank(path: &Path) -> Result<u64> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.lines().filter(|line| !line.trim().is_empty()).count() as u64)
}

pub fn merge(partials: Vec<RepoLoc>) -> ClonedTotals {
    let mut totals = ClonedTotals::default();
    for partial in partials {
        totals.total_lines += partial.total_lines;
        for (ext, lines) in partial.by_extension {
            *totals.lines_by_extension.entry(ext).or_insert(0) += lines;
        }
        totals.processed_repositories.push(partial.full_name);
    }
    totals
}
