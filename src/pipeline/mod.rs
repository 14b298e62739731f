use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;

use crate::commits::{self, DetailCache};
use crate::config::{Settings, TeamConfig, TeamConfigSource};
use crate::error::{MetricsError, Result};
use crate::hosting::{self, HostingClient, ReqwestFactory, TransportFactory};
use crate::loc::{self, Cloner, GitCloner, LocOptions};
use crate::models::{
    PeriodKey, PeriodRecord, RepositoryRef, SnapshotMetrics, TeamMetrics, Window,
};
use crate::runtime;
use crate::snapshot;
use crate::storage::MetricsStore;

pub const NO_REPOSITORIES: &str = "No repositories selected for this team";

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub success: bool,
    pub message: String,
    pub metrics: TeamMetrics,
}

struct Completed {
    success: bool,
    message: String,
}

struct Credentials {
    root: String,
    token: String,
}

pub struct Pipeline {
    settings: Settings,
    teams: Arc<dyn TeamConfigSource>,
    store: Arc<dyn MetricsStore>,
    transports: Arc<dyn TransportFactory>,
    cloner: Arc<dyn Cloner>,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        teams: Arc<dyn TeamConfigSource>,
        store: Arc<dyn MetricsStore>,
    ) -> Self {
        let transports = Arc::new(ReqwestFactory::new(settings.request_timeout()));
        Self {
            settings,
            teams,
            store,
            transports,
            cloner: Arc::new(GitCloner),
        }
    }

    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_cloner(mut self, cloner: Arc<dyn Cloner>) -> Self {
        self.cloner = cloner;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Recomputes and persists every period for `team_id`. Never fails: the
    /// outcome always carries a message and whatever metrics can be read.
    pub async fn refresh(
        &self,
        team_id: &str,
        explicit: Option<Vec<RepositoryRef>>,
    ) -> RefreshOutcome {
        tracing::info!(team = %team_id, "refresh started");
        let run = AssertUnwindSafe(self.run(team_id, explicit))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(MetricsError::Internal(format!(
                    "refresh aborted: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let (success, message) = match run {
            Ok(done) => (done.success, done.message),
            Err(err) => {
                tracing::error!(team = %team_id, error = %err, "refresh failed");
                let message = format!("Refresh failed: {err}");
                self.annotate_snapshot(team_id, &message);
                (false, message)
            }
        };
        tracing::info!(team = %team_id, success, message = %message, "refresh finished");
        RefreshOutcome {
            success,
            message,
            metrics: self.read_back(team_id),
        }
    }

    pub fn metrics(&self, team_id: &str) -> Result<TeamMetrics> {
        let raw = self
            .store
            .get_all(team_id)
            .map_err(MetricsError::persistence)?;
        Ok(TeamMetrics::from_raw(&raw))
    }

    pub async fn discover(&self, team_id: &str) -> Result<Vec<RepositoryRef>> {
        let team = self.load_team(team_id)?;
        let creds = credentials(&team).map_err(MetricsError::Configuration)?;
        let client = self.client(&creds.token)?;
        hosting::discover(&client, &creds.root).await
    }

    async fn run(
        &self,
        team_id: &str,
        explicit: Option<Vec<RepositoryRef>>,
    ) -> Result<Completed> {
        let team = self.load_team(team_id)?;
        let creds = match credentials(&team) {
            Ok(creds) => creds,
            Err(message) => {
                tracing::warn!(team = %team_id, reason = %message, "refresh skipped");
                self.annotate_snapshot(team_id, &message);
                return Ok(Completed {
                    success: false,
                    message,
                });
            }
        };

        let repos = match explicit.filter(|r| !r.is_empty()) {
            Some(repos) => repos,
            None => team.selected_repositories.clone(),
        };
        if repos.is_empty() {
            self.store.clear(team_id).map_err(MetricsError::persistence)?;
            self.put(
                team_id,
                PeriodKey::OverallSnapshot,
                &PeriodRecord::<SnapshotMetrics>::unavailable(NO_REPOSITORIES),
            )?;
            return Ok(Completed {
                success: true,
                message: NO_REPOSITORIES.to_string(),
            });
        }

        let now = Utc::now();
        let concurrency = runtime::clamp_concurrency(self.settings.concurrency);
        let client = self.client(&creds.token)?;
        let previous = self.read_back(team_id);

        let api = snapshot::collect_snapshot(&client, &repos, concurrency, now).await;

        let details = DetailCache::new();
        let mut failed_windows = Vec::new();
        for window in Window::ALL {
            let aggregated =
                commits::aggregate_window(&client, &repos, window, now, concurrency, &details)
                    .await;
            let record = match aggregated {
                Ok(metrics) => PeriodRecord::available(metrics),
                Err(err) => {
                    tracing::error!(window = %window, error = %err, "window aggregation failed");
                    failed_windows.push(window);
                    PeriodRecord::annotate(
                        previous.windows.get(&window),
                        format!("Commit aggregation failed: {err}"),
                    )
                }
            };
            self.put(team_id, PeriodKey::Window(window), &record)?;
        }

        let cloned = loc::analyze(
            self.cloner.as_ref(),
            &repos,
            &self.loc_options(&creds.token, concurrency),
            now,
        )
        .await;

        let snapshot = SnapshotMetrics { api, cloned };
        self.put(
            team_id,
            PeriodKey::OverallSnapshot,
            &PeriodRecord::available(snapshot),
        )?;

        Ok(summarize(repos.len(), &failed_windows, now))
    }

    fn load_team(&self, team_id: &str) -> Result<TeamConfig> {
        let team = self
            .teams
            .team(team_id)
            .map_err(|err| MetricsError::Configuration(format!("{err:#}")))?;
        Ok(team.unwrap_or_else(|| TeamConfig::new(team_id)))
    }

    fn client(&self, token: &str) -> Result<HostingClient> {
        let transport = self.transports.connect(token)?;
        Ok(HostingClient::new(transport, &self.settings.api_base_url))
    }

    fn loc_options(&self, token: &str, concurrency: usize) -> LocOptions {
        LocOptions {
            scratch_root: self.settings.scratch_root(),
            clone_timeout: self.settings.clone_timeout(),
            token: Some(token.to_string()),
            concurrency,
        }
    }

    fn put<T: Serialize>(&self, team_id: &str, key: PeriodKey, record: &T) -> Result<()> {
        let payload = serde_json::to_value(record)?;
        self.store
            .put(team_id, key.as_str(), &payload)
            .map_err(MetricsError::persistence)
    }

    fn annotate_snapshot(&self, team_id: &str, message: &str) {
        let existing = self.read_back(team_id);
        let record = PeriodRecord::annotate(existing.snapshot.as_ref(), message);
        if let Err(err) = self.put(team_id, PeriodKey::OverallSnapshot, &record) {
            tracing::error!(team = %team_id, error = %err, "failed to record refresh failure");
        }
    }

    fn read_back(&self, team_id: &str) -> TeamMetrics {
        match self.metrics(team_id) {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::error!(team = %team_id, error = %err, "failed to read metrics");
                TeamMetrics::default()
            }
        }
    }
}

fn credentials(team: &TeamConfig) -> std::result::Result<Credentials, String> {
    let root = team.root().map(str::to_string);
    let token = team.credential();
    match (root, token) {
        (Some(root), Some(token)) => Ok(Credentials { root, token }),
        (None, Some(_)) => Err("Repository root reference is not configured".to_string()),
        (Some(_), None) => Err("Access token is not configured".to_string()),
        (None, None) => Err("Repository root reference and access token are not configured".to_string()),
    }
}

fn summarize(repo_count: usize, failed: &[Window], now: DateTime<Utc>) -> Completed {
    if failed.is_empty() {
        return Completed {
            success: true,
            message: format!("Refreshed metrics for {repo_count} repositories at {now}"),
        };
    }
    let keys: Vec<&str> = failed.iter().map(|w| w.key()).collect();
    Completed {
        success: false,
        message: format!(
            "Refreshed metrics for {repo_count} repositories; windows failed: {}",
            keys.join(", ")
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
