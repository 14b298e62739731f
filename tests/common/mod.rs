#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use repometrics::config::{Settings, TeamConfig, TeamConfigSource};
use repometrics::hosting::{HttpResponse, Transport, TransportFactory};
use repometrics::loc::Cloner;
use repometrics::models::RepositoryRef;
use repometrics::storage::{MemoryStore, MetricsStore};
use repometrics::{MetricsError, Result};
use serde_json::Value;

pub const BASE: &str = "https://api.test";

pub fn ok(body: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        link: None,
        body: body.to_string(),
    }
}

pub fn ok_with_next(body: Value, next: &str) -> HttpResponse {
    HttpResponse {
        status: 200,
        link: Some(format!(r#"<{next}>; rel="next""#)),
        body: body.to_string(),
    }
}

pub fn raw(body: &str) -> HttpResponse {
    HttpResponse {
        status: 200,
        link: None,
        body: body.to_string(),
    }
}

pub fn status(code: u16) -> HttpResponse {
    HttpResponse {
        status: code,
        link: None,
        body: r#"{"message":"scripted failure"}"#.to_string(),
    }
}

/// Answers with the first route whose key prefixes the requested URL.
/// A route with several responses serves them in order and then keeps
/// repeating the last one.
#[derive(Default)]
pub struct FakeHost {
    routes: Mutex<Vec<(String, Vec<HttpResponse>)>>,
    calls: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, prefix: &str, response: HttpResponse) {
        self.route_sequence(prefix, vec![response]);
    }

    pub fn route_sequence(&self, prefix: &str, responses: Vec<HttpResponse>) {
        assert!(!responses.is_empty());
        self.routes
            .lock()
            .unwrap()
            .push((prefix.to_string(), responses));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl Transport for FakeHost {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut routes = self.routes.lock().unwrap();
        let found = routes
            .iter_mut()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, responses)| {
                if responses.len() > 1 {
                    responses.remove(0)
                } else {
                    responses[0].clone()
                }
            });
        Ok(found.unwrap_or_else(|| status(404)))
    }
}

pub struct FakeFactory(pub Arc<FakeHost>);

impl TransportFactory for FakeFactory {
    fn connect(&self, _token: &str) -> Result<Arc<dyn Transport>> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
pub enum CloneBehavior {
    Files(Vec<(String, String)>),
    Fail,
    Hang,
    /// Hangs while a detached writer keeps adding files for a while, the
    /// way git's helper processes outlive a killed clone.
    Straggle(Duration),
}

/// Writes scripted files into the destination, or fails, or never returns.
pub struct FakeCloner {
    behaviors: HashMap<String, CloneBehavior>,
    destinations: Mutex<Vec<PathBuf>>,
}

impl FakeCloner {
    pub fn new(behaviors: Vec<(&str, CloneBehavior)>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .into_iter()
                .map(|(url, b)| (url.to_string(), b))
                .collect(),
            destinations: Mutex::new(Vec::new()),
        })
    }

    pub fn destinations(&self) -> Vec<PathBuf> {
        self.destinations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cloner for FakeCloner {
    async fn shallow_clone(&self, url: &str, dest: &Path) -> Result<()> {
        self.destinations.lock().unwrap().push(dest.to_path_buf());
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("partial.rs"), "fn partial() {}\n")?;
        let key = url.split('@').last().unwrap_or(url);
        let behavior = self
            .behaviors
            .iter()
            .find(|(k, _)| key.ends_with(k.as_str()))
            .map(|(_, b)| b.clone())
            .unwrap_or(CloneBehavior::Fail);
        match behavior {
            CloneBehavior::Files(files) => {
                std::fs::remove_file(dest.join("partial.rs"))?;
                for (rel, content) in files {
                    let path = dest.join(rel);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, content)?;
                }
                Ok(())
            }
            CloneBehavior::Fail => Err(MetricsError::Clone {
                repo: url.to_string(),
                reason: "scripted clone failure".into(),
            }),
            CloneBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            CloneBehavior::Straggle(lasting) => {
                let dest = dest.to_path_buf();
                std::thread::spawn(move || {
                    let deadline = std::time::Instant::now() + lasting;
                    let mut n = 0u32;
                    while std::time::Instant::now() < deadline {
                        let _ = std::fs::write(dest.join(format!("pack-{n}.tmp")), "x");
                        n += 1;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct StaticTeams {
    teams: Mutex<HashMap<String, TeamConfig>>,
}

impl StaticTeams {
    pub fn with(team: TeamConfig) -> Arc<Self> {
        let teams = Self::default();
        teams
            .teams
            .lock()
            .unwrap()
            .insert(team.team_id.clone(), team);
        Arc::new(teams)
    }
}

impl TeamConfigSource for StaticTeams {
    fn team(&self, team_id: &str) -> anyhow::Result<Option<TeamConfig>> {
        Ok(self.teams.lock().unwrap().get(team_id).cloned())
    }
}

/// Memory store whose window writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_windows: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn break_windows(&self) {
        self.fail_windows.store(true, Ordering::SeqCst);
    }
}

impl MetricsStore for FlakyStore {
    fn put(&self, team_id: &str, period_key: &str, payload: &Value) -> anyhow::Result<()> {
        if period_key != "overall_snapshot" && self.fail_windows.load(Ordering::SeqCst) {
            anyhow::bail!("disk full while writing {period_key}");
        }
        self.inner.put(team_id, period_key, payload)
    }

    fn get_all(&self, team_id: &str) -> anyhow::Result<BTreeMap<String, Value>> {
        self.inner.get_all(team_id)
    }

    fn clear(&self, team_id: &str) -> anyhow::Result<()> {
        self.inner.clear(team_id)
    }
}

pub fn repo(owner: &str, name: &str) -> RepositoryRef {
    RepositoryRef {
        id: format!("{owner}-{name}"),
        name: name.to_string(),
        url: Some(format!("https://github.test/{owner}/{name}")),
        full_name: Some(format!("{owner}/{name}")),
    }
}

pub fn team(team_id: &str, repos: Vec<RepositoryRef>) -> TeamConfig {
    TeamConfig {
        team_id: team_id.to_string(),
        root_reference: Some("https://github.test/acme".to_string()),
        access_token: Some("test-token".to_string()),
        selected_repositories: repos,
    }
}

pub fn settings(scratch: &Path) -> Settings {
    Settings {
        api_base_url: BASE.to_string(),
        concurrency: 4,
        request_timeout_secs: 5,
        clone_timeout_secs: 5,
        scratch_dir: Some(scratch.to_path_buf()),
        database_path: None,
    }
}

/// Routes every per-repository endpoint to an empty answer.
pub fn quiet_repo(host: &FakeHost, full_name: &str) {
    host.route(
        &format!("{BASE}/repos/{full_name}/languages"),
        ok(serde_json::json!({})),
    );
    host.route(
        &format!("{BASE}/repos/{full_name}/tags"),
        ok(serde_json::json!([])),
    );
    host.route(
        &format!("{BASE}/repos/{full_name}/commits?"),
        ok(serde_json::json!([])),
    );
}

pub fn scratch_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}
