use std::collections::HashSet;

use serde_json::Value;

use super::{parse_body, Transport};
use crate::error::{MetricsError, Result};

pub const MAX_PAGES: usize = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub items: Vec<Value>,
    pub notice: Option<String>,
    pub total_count: Option<u64>,
}

pub fn parse_next_link(header: &str) -> Option<String> {
    for entry in header.split(',') {
        let mut parts = entry.split(';');
        let Some(target) = parts.next().map(str::trim) else {
            continue;
        };
        let is_next = parts.any(|param| {
            let param = param.trim();
            let Some((key, value)) = param.split_once('=') else {
                return false;
            };
            key.trim().eq_ignore_ascii_case("rel")
                && value
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("next"))
        });
        if is_next && target.starts_with('<') && target.ends_with('>') {
            let url = &target[1..target.len() - 1];
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    None
}

enum Page {
    Items(Vec<Value>),
    Envelope { items: Vec<Value>, total: u64 },
    Notice(String),
}

fn classify(body: Value) -> Page {
    match body {
        Value::Array(items) => Page::Items(items),
        Value::Object(mut map) => {
            let total = map.get("total_count").and_then(Value::as_u64);
            let array_key = map
                .iter()
                .find(|(_, v)| v.is_array())
                .map(|(k, _)| k.clone());
            match (total, array_key) {
                (Some(total), Some(key)) => {
                    let items = match map.remove(&key) {
                        Some(Value::Array(items)) => items,
                        _ => Vec::new(),
                    };
                    Page::Envelope { items, total }
                }
                _ => Page::Notice(
                    map.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("response was not a list")
                        .to_string(),
                ),
            }
        }
        Value::Null => Page::Items(Vec::new()),
        other => Page::Notice(format!("unexpected {} body", json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        _ => "structured",
    }
}

pub(super) async fn fetch_all(transport: &dyn Transport, start: &str) -> Result<Listing> {
    let mut listing = Listing::default();
    let mut visited: HashSet<String> = HashSet::new();
    let mut next = Some(start.to_string());
    let mut pages = 0usize;

    while let Some(url) = next.take() {
        if !visited.insert(url.clone()) {
            tracing::warn!(url = %url, "pagination revisited a page, stopping");
            break;
        }
        if pages >= MAX_PAGES {
            tracing::warn!(url = %start, pages, "pagination page cap reached, stopping");
            break;
        }
        pages += 1;

        let response = transport.get(&url).await?;
        if !response.is_success() {
            return Err(MetricsError::upstream(response.status, &url, &response.body));
        }
        let page = match parse_body(&url, &response.body) {
            Ok(body) => classify(body),
            Err(MetricsError::MalformedResponse { reason, .. }) => Page::Notice(reason),
            Err(err) => return Err(err),
        };
        match page {
            Page::Items(items) => {
                let empty = items.is_empty();
                listing.items.extend(items);
                if empty && listing.total_count.is_some() {
                    break;
                }
            }
            Page::Envelope { items, total } => {
                listing.total_count = Some(total);
                let empty = items.is_empty();
                listing.items.extend(items);
                if empty || listing.items.len() as u64 >= total {
                    break;
                }
            }
            Page::Notice(message) => {
                if let Some(total) = listing.total_count {
                    if (listing.items.len() as u64) < total {
                        return Err(MetricsError::malformed(
                            &url,
                            format!(
                                "expected {total} items but page had none ({message}); got {}",
                                listing.items.len()
                            ),
                        ));
                    }
                }
                listing.notice = Some(message);
                break;
            }
        }
        next = response.link.as_deref().and_then(parse_next_link);
    }

    Ok(listing)
}
