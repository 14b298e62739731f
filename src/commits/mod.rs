use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::error::{MetricsError, Result};
use crate::hosting::HostingClient;
use crate::models::{RepositoryRef, Window, WindowMetrics};
use crate::util;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepoWindowPartial {
    pub full_name: String,
    pub lines_added: u64,
    pub committers: BTreeSet<String>,
}

/// Additions per commit fetched from the detail endpoint, shared by every
/// window of one refresh. Failed lookups are not remembered.
#[derive(Debug, Default)]
pub struct DetailCache {
    additions: Mutex<HashMap<String, u64>>,
}

impl DetailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.additions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, full_name: &str, sha: &str) -> Option<u64> {
        self.additions
            .lock()
            .unwrap()
            .get(&cache_key(full_name, sha))
            .copied()
    }

    fn insert(&self, full_name: &str, sha: &str, additions: u64) {
        self.additions
            .lock()
            .unwrap()
            .insert(cache_key(full_name, sha), additions);
    }
}

fn cache_key(full_name: &str, sha: &str) -> String {
    format!("{full_name}@{sha}")
}

pub async fn aggregate_window(
    client: &HostingClient,
    repos: &[RepositoryRef],
    window: Window,
    now: DateTime<Utc>,
    concurrency: usize,
    details: &DetailCache,
) -> Result<WindowMetrics> {
    let (start, end) = window.bounds(now);
    let results: Vec<Result<RepoWindowPartial>> =
        stream::iter(repos.iter().filter_map(|r| r.full_name.as_deref()))
            .map(|full_name| collect_repo_window(client, full_name, start, end, details))
            .buffered(concurrency.max(1))
            .collect()
            .await;

    let mut partials = Vec::new();
    for result in results {
        match result {
            Ok(partial) => partials.push(partial),
            Err(err) if err.is_scoped() => {
                tracing::warn!(window = %window, error = %err, "skipping repository for window");
            }
            Err(err) => return Err(err),
        }
    }

    let mut metrics = merge(partials);
    metrics.start = Some(start);
    metrics.end = Some(end);
    metrics.refreshed_at = Some(now);
    Ok(metrics)
}

pub async fn collect_repo_window(
    client: &HostingClient,
    full_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    details: &DetailCache,
) -> Result<RepoWindowPartial> {
    let since = start.to_rfc3339_opts(SecondsFormat::Secs, true);
    let until = end.to_rfc3339_opts(SecondsFormat::Secs, true);
    let url = util::with_query(
        &client.repo_url(full_name, "commits"),
        &[
            ("since", since.as_str()),
            ("until", until.as_str()),
            ("per_page", "100"),
        ],
    )
    .map_err(|err| MetricsError::malformed(full_name, format!("{err:#}")))?;

    let listing = client.fetch_all(&url).await?;
    if let Some(notice) = listing.notice {
        if is_empty_repository(&notice) {
            tracing::debug!(repo = %full_name, "repository is empty");
            return Ok(RepoWindowPartial {
                full_name: full_name.to_string(),
                ..Default::default()
            });
        }
        return Err(MetricsError::Upstream {
            status: 200,
            url,
            body: notice,
        });
    }

    let mut partial = RepoWindowPartial {
        full_name: full_name.to_string(),
        ..Default::default()
    };
    for commit in &listing.items {
        if let Some(who) = committer_identity(commit) {
            partial.committers.insert(who);
        }
        partial.lines_added += match list_additions(commit) {
            Some(additions) => additions,
            None => detail_additions(client, full_name, commit, details).await,
        };
    }
    Ok(partial)
}

fn is_empty_repository(notice: &str) -> bool {
    notice.to_ascii_lowercase().contains("empty")
}

/// API author login, API committer login, raw author name, raw committer name.
pub fn committer_identity(commit: &Value) -> Option<String> {
    let candidates = [
        commit.pointer("/author/login"),
        commit.pointer("/committer/login"),
        commit.pointer("/commit/author/name"),
        commit.pointer("/commit/committer/name"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn list_additions(commit: &Value) -> Option<u64> {
    commit.pointer("/stats/additions").and_then(Value::as_u64)
}

async fn detail_additions(
    client: &HostingClient,
    full_name: &str,
    commit: &Value,
    details: &DetailCache,
) -> u64 {
    let Some(sha) = commit.get("sha").and_then(Value::as_str) else {
        return 0;
    };
    if let Some(additions) = details.get(full_name, sha) {
        return additions;
    }
    match client
        .get_json(&client.repo_url(full_name, &format!("commits/{sha}")))
        .await
    {
        Ok(detail) => {
            let additions = list_additions(&detail).unwrap_or(0);
            details.insert(full_name, sha, additions);
            additions
        }
        Err(err) => {
            tracing::warn!(repo = %full_name, sha = %sha, error = %err, "commit detail fetch failed");
            0
        }
    }
}

pub fn merge(partials: Vec<RepoWindowPartial>) -> WindowMetrics {
    let mut committers = BTreeSet::new();
    let mut metrics = WindowMetrics::default();
    for partial in partials {
        metrics.lines_added += partial.lines_added;
        committers.extend(partial.committers);
        metrics.processed_repositories.push(partial.full_name);
    }
    metrics.unique_committers = committers.len();
    metrics.committers = committers.into_iter().collect();
    metrics
}
