use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BYTES_PER_LINE: u64 = 50;
pub const MAX_TAGS: usize = 10;
pub const OVERALL_SNAPSHOT_KEY: &str = "overall_snapshot";

pub type LanguageHistogram = BTreeMap<String, u64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl RepositoryRef {
    pub fn from_full_name(full_name: &str) -> Self {
        let name = full_name
            .rsplit('/')
            .next()
            .unwrap_or(full_name)
            .to_string();
        Self {
            id: full_name.to_string(),
            name,
            url: None,
            full_name: Some(full_name.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagEntry {
    pub name: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiSnapshot {
    pub total_bytes: u64,
    pub language_bytes: LanguageHistogram,
    pub estimated_lines: u64,
    pub estimated_lines_by_language: BTreeMap<String, u64>,
    pub tags: Vec<TagEntry>,
    pub processed_repositories: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClonedTotals {
    pub total_lines: u64,
    pub lines_by_extension: BTreeMap<String, u64>,
    pub processed_repositories: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotMetrics {
    pub api: ApiSnapshot,
    pub cloned: ClonedTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "7days")]
    Days7,
    #[serde(rename = "30days")]
    Days30,
    #[serde(rename = "60days")]
    Days60,
    #[serde(rename = "90days")]
    Days90,
    #[serde(rename = "180days")]
    Days180,
    #[serde(rename = "365days")]
    Days365,
}

impl Window {
    pub const ALL: [Window; 6] = [
        Window::Days7,
        Window::Days30,
        Window::Days60,
        Window::Days90,
        Window::Days180,
        Window::Days365,
    ];

    pub fn days(self) -> i64 {
        match self {
            Window::Days7 => 7,
            Window::Days30 => 30,
            Window::Days60 => 60,
            Window::Days90 => 90,
            Window::Days180 => 180,
            Window::Days365 => 365,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Window::Days7 => "7days",
            Window::Days30 => "30days",
            Window::Days60 => "60days",
            Window::Days90 => "90days",
            Window::Days180 => "180days",
            Window::Days365 => "365days",
        }
    }

    pub fn bounds(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::days(self.days()), now)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Window {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Window::ALL
            .into_iter()
            .find(|w| w.key() == s)
            .ok_or_else(|| format!("unknown window key: {s}"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowMetrics {
    pub lines_added: u64,
    pub unique_committers: usize,
    pub committers: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub processed_repositories: Vec<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeriodKey {
    OverallSnapshot,
    Window(Window),
}

impl PeriodKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKey::OverallSnapshot => OVERALL_SNAPSHOT_KEY,
            PeriodKey::Window(window) => window.key(),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if key == OVERALL_SNAPSHOT_KEY {
            return Some(PeriodKey::OverallSnapshot);
        }
        key.parse::<Window>().ok().map(PeriodKey::Window)
    }
}

/// One persisted period: real metrics, or an explanation of why there are
/// none. `previous` carries the last good payload across a failed refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeriodRecord<T> {
    Available {
        data: T,
    },
    Unavailable {
        message: String,
        failed_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<T>,
    },
}

impl<T: Clone> PeriodRecord<T> {
    pub fn available(data: T) -> Self {
        PeriodRecord::Available { data }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        PeriodRecord::Unavailable {
            message: message.into(),
            failed_at: Utc::now(),
            previous: None,
        }
    }

    pub fn annotate(existing: Option<&PeriodRecord<T>>, message: impl Into<String>) -> Self {
        PeriodRecord::Unavailable {
            message: message.into(),
            failed_at: Utc::now(),
            previous: existing.and_then(|r| r.last_known_good().cloned()),
        }
    }

    pub fn last_known_good(&self) -> Option<&T> {
        match self {
            PeriodRecord::Available { data } => Some(data),
            PeriodRecord::Unavailable { previous, .. } => previous.as_ref(),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            PeriodRecord::Available { .. } => None,
            PeriodRecord::Unavailable { message, .. } => Some(message),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, PeriodRecord::Available { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeamMetrics {
    pub snapshot: Option<PeriodRecord<SnapshotMetrics>>,
    pub windows: BTreeMap<Window, PeriodRecord<WindowMetrics>>,
}

impl TeamMetrics {
    pub fn from_raw(raw: &BTreeMap<String, Value>) -> Self {
        let mut metrics = TeamMetrics::default();
        for (key, payload) in raw {
            match PeriodKey::parse(key) {
                Some(PeriodKey::OverallSnapshot) => {
                    metrics.snapshot = decode(key, payload);
                }
                Some(PeriodKey::Window(window)) => {
                    if let Some(record) = decode(key, payload) {
                        metrics.windows.insert(window, record);
                    }
                }
                None => tracing::warn!(period_key = %key, "ignoring unknown period key"),
            }
        }
        metrics
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.windows.is_empty()
    }
}

fn decode<T: DeserializeOwned>(key: &str, payload: &Value) -> Option<PeriodRecord<T>> {
    match serde_json::from_value(payload.clone()) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::warn!(period_key = %key, error = %err, "skipping undecodable metrics record");
            None
        }
    }
}

pub fn estimate_lines(bytes: u64) -> u64 {
    (bytes as f64 / BYTES_PER_LINE as f64).round() as u64
}
