use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::error::Result;
use crate::hosting::HostingClient;
use crate::models::{
    estimate_lines, ApiSnapshot, LanguageHistogram, RepositoryRef, TagEntry, MAX_TAGS,
};

const TAGS_PER_REPO: usize = 5;

#[derive(Debug, Default)]
struct RepoSnapshot {
    full_name: String,
    languages: Option<LanguageHistogram>,
    tags: Vec<TagEntry>,
}

pub async fn collect_snapshot(
    client: &HostingClient,
    repos: &[RepositoryRef],
    concurrency: usize,
    now: DateTime<Utc>,
) -> ApiSnapshot {
    let partials: Vec<RepoSnapshot> = stream::iter(repos.iter().filter_map(|r| {
        r.full_name
            .as_deref()
            .map(|full_name| (r.name.as_str(), full_name))
    }))
    .map(|(name, full_name)| collect_repo(client, name, full_name, now))
    .buffered(concurrency.max(1))
    .collect()
    .await;

    merge(partials, now)
}

async fn collect_repo(
    client: &HostingClient,
    name: &str,
    full_name: &str,
    now: DateTime<Utc>,
) -> RepoSnapshot {
    let languages = match fetch_languages(client, full_name).await {
        Ok(histogram) => Some(histogram),
        Err(err) => {
            tracing::warn!(repo = %full_name, error = %err, "language fetch failed");
            None
        }
    };
    let tags = match fetch_tags(client, name, full_name, now).await {
        Ok(tags) => tags,
        Err(err) => {
            tracing::warn!(repo = %full_name, error = %err, "tag fetch failed");
            Vec::new()
        }
    };
    RepoSnapshot {
        full_name: full_name.to_string(),
        languages,
        tags,
    }
}

async fn fetch_languages(client: &HostingClient, full_name: &str) -> Result<LanguageHistogram> {
    let body = client
        .get_json(&client.repo_url(full_name, "languages"))
        .await?;
    let mut histogram = LanguageHistogram::new();
    if let Value::Object(map) = body {
        for (language, bytes) in map {
            if let Some(bytes) = bytes.as_u64() {
                histogram.insert(language, bytes);
            }
        }
    }
    Ok(histogram)
}

async fn fetch_tags(
    client: &HostingClient,
    name: &str,
    full_name: &str,
    now: DateTime<Utc>,
) -> Result<Vec<TagEntry>> {
    let url = client.repo_url(full_name, &format!("tags?per_page={TAGS_PER_REPO}"));
    let body = client.get_json(&url).await?;
    let items = match body {
        Value::Array(items) => items,
        _ => Vec::new(),
    };

    let mut tags = Vec::new();
    for tag in items.iter().take(TAGS_PER_REPO) {
        let Some(tag_name) = tag.get("name").and_then(Value::as_str) else {
            continue;
        };
        let date = match tag_commit_url(client, full_name, tag) {
            Some(commit_url) => match client.get_json(&commit_url).await {
                Ok(commit) => commit_date(&commit).unwrap_or(now),
                Err(err) => {
                    tracing::warn!(repo = %full_name, tag = %tag_name, error = %err, "tag commit lookup failed");
                    now
                }
            },
            None => now,
        };
        tags.push(TagEntry {
            name: format!("{name}/{tag_name}"),
            date,
        });
    }
    Ok(tags)
}

fn tag_commit_url(client: &HostingClient, full_name: &str, tag: &Value) -> Option<String> {
    let commit = tag.get("commit")?;
    if let Some(url) = commit.get("url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    let sha = commit.get("sha").and_then(Value::as_str)?;
    Some(client.repo_url(full_name, &format!("commits/{sha}")))
}

fn commit_date(commit: &Value) -> Option<DateTime<Utc>> {
    let inner = commit.get("commit")?;
    ["committer", "author"].iter().find_map(|who| {
        inner
            .get(who)?
            .get("date")?
            .as_str()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    })
}

fn merge(partials: Vec<RepoSnapshot>, now: DateTime<Utc>) -> ApiSnapshot {
    let mut snapshot = ApiSnapshot {
        timestamp: Some(now),
        ..Default::default()
    };
    for partial in partials {
        if let Some(languages) = partial.languages {
            for (language, bytes) in languages {
                snapshot.total_bytes += bytes;
                *snapshot.language_bytes.entry(language).or_default() += bytes;
            }
            snapshot.processed_repositories.push(partial.full_name);
        }
        snapshot.tags.extend(partial.tags);
    }
    snapshot.tags.sort_by(|a, b| b.date.cmp(&a.date));
    snapshot.tags.truncate(MAX_TAGS);
    snapshot.estimated_lines = estimate_lines(snapshot.total_bytes);
    snapshot.estimated_lines_by_language = snapshot
        .language_bytes
        .iter()
        .map(|(language, bytes)| (language.clone(), estimate_lines(*bytes)))
        .collect();
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn partial(name: &str, langs: &[(&str, u64)], tags: usize, base: DateTime<Utc>) -> RepoSnapshot {
        RepoSnapshot {
            full_name: format!("acme/{name}"),
            languages: Some(langs.iter().map(|(l, b)| (l.to_string(), *b)).collect()),
            tags: (0..tags)
                .map(|i| TagEntry {
                    name: format!("{name}/v{i}"),
                    date: base + Duration::hours(i as i64),
                })
                .collect(),
        }
    }

    #[test]
    fn merge_sums_histograms_and_estimates() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let snapshot = merge(
            vec![
                partial("a", &[("Go", 1000), ("TS", 500)], 0, now),
                partial("b", &[("Go", 500)], 0, now),
            ],
            now,
        );
        assert_eq!(snapshot.total_bytes, 2000);
        assert_eq!(snapshot.language_bytes["Go"], 1500);
        assert_eq!(snapshot.language_bytes["TS"], 500);
        assert_eq!(snapshot.estimated_lines, 40);
        assert_eq!(snapshot.language_bytes.values().sum::<u64>(), snapshot.total_bytes);
        assert_eq!(snapshot.estimated_lines_by_language.values().sum::<u64>(), 40);
    }

    #[test]
    fn merge_keeps_ten_newest_tags() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let snapshot = merge(
            vec![
                partial("a", &[], 5, base),
                partial("b", &[], 5, base + Duration::days(1)),
                partial("c", &[], 5, base + Duration::days(2)),
            ],
            base,
        );
        assert_eq!(snapshot.tags.len(), MAX_TAGS);
        assert!(snapshot.tags.windows(2).all(|w| w[0].date >= w[1].date));
        assert_eq!(snapshot.tags[0].name, "c/v4");
        assert!(snapshot.tags.iter().all(|t| !t.name.starts_with("a/")));
    }

    #[test]
    fn failed_language_fetch_is_not_processed() {
        let now = Utc::now();
        let mut failed = partial("x", &[], 1, now);
        failed.languages = None;
        let snapshot = merge(vec![failed], now);
        assert!(snapshot.processed_repositories.is_empty());
        assert_eq!(snapshot.tags.len(), 1);
    }

    #[test]
    fn commit_date_prefers_committer() {
        let commit = json!({"commit": {
            "author": {"date": "2024-01-01T00:00:00Z"},
            "committer": {"date": "2024-01-02T00:00:00Z"}
        }});
        assert_eq!(
            commit_date(&commit),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(commit_date(&json!({})), None);
    }
}
