use reqwest::Url;
use serde_json::Value;

use super::HostingClient;
use crate::error::{MetricsError, Result};
use crate::models::RepositoryRef;
use crate::util;

const LISTING_QUERY: &[(&str, &str)] = &[("type", "all"), ("per_page", "100")];
const API_MARKERS: &[&str] = &["repos", "user", "users", "orgs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingTarget {
    Direct(String),
    Owner { org_url: String, user_url: String },
    AuthenticatedUser(String),
}

pub fn resolve_listing(base_url: &str, reference: &str) -> Result<ListingTarget> {
    let base = base_url.trim_end_matches('/');
    let reference = reference.trim();
    let segments = path_segments(reference);

    if looks_like_listing(reference, &segments) {
        let url = util::with_query(reference, LISTING_QUERY)
            .map_err(|err| MetricsError::Configuration(format!("{err:#}")))?;
        return Ok(ListingTarget::Direct(url));
    }

    let Some(owner) = segments.last() else {
        return Ok(ListingTarget::AuthenticatedUser(listing(&format!(
            "{base}/user/repos"
        ))?));
    };
    Ok(ListingTarget::Owner {
        org_url: listing(&format!("{base}/orgs/{owner}/repos"))?,
        user_url: listing(&format!("{base}/users/{owner}/repos"))?,
    })
}

fn listing(url: &str) -> Result<String> {
    util::with_query(url, LISTING_QUERY).map_err(|err| MetricsError::Configuration(format!("{err:#}")))
}

fn looks_like_listing(reference: &str, segments: &[String]) -> bool {
    Url::parse(reference).is_ok()
        && segments
            .iter()
            .any(|s| API_MARKERS.contains(&s.as_str()))
}

fn path_segments(reference: &str) -> Vec<String> {
    let path = match Url::parse(reference) {
        Ok(url) if url.has_host() => url.path().to_string(),
        _ => reference.to_string(),
    };
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn discover(client: &HostingClient, reference: &str) -> Result<Vec<RepositoryRef>> {
    let url = match resolve_listing(client.base_url(), reference)? {
        ListingTarget::Direct(url) | ListingTarget::AuthenticatedUser(url) => url,
        ListingTarget::Owner { org_url, user_url } => {
            let probe = client.get(&org_url).await?;
            match probe.status {
                s if (200..300).contains(&s) => org_url,
                403 | 404 => {
                    tracing::debug!(status = probe.status, "not an organization, listing as user");
                    user_url
                }
                status => return Err(MetricsError::upstream(status, &org_url, &probe.body)),
            }
        }
    };

    let listing = client.fetch_all(&url).await?;
    if let Some(notice) = &listing.notice {
        tracing::warn!(url = %url, notice = %notice, "repository listing returned no list");
    }
    let repos: Vec<RepositoryRef> = listing.items.iter().filter_map(to_repository_ref).collect();
    tracing::info!(count = repos.len(), "discovered repositories");
    Ok(repos)
}

fn to_repository_ref(item: &Value) -> Option<RepositoryRef> {
    let name = item.get("name")?.as_str()?.to_string();
    let id = match item.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => name.clone(),
    };
    Some(RepositoryRef {
        id,
        name,
        url: item
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        full_name: item
            .get("full_name")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
