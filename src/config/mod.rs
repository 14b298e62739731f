use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::RepositoryRef;
use crate::util;

pub const TOKEN_ENV: &str = "REPOMETRICS_TOKEN";
const SETTINGS_FILE: &str = "settings.json";
const TEAMS_FILE: &str = "teams.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub scratch_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            concurrency: 4,
            request_timeout_secs: 30,
            clone_timeout_secs: 300,
            scratch_dir: None,
            database_path: None,
        }
    }
}

impl Settings {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let settings: Settings = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn database_path(&self, root: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| root.join("metrics.db"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TeamConfig {
    pub team_id: String,
    #[serde(default)]
    pub root_reference: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub selected_repositories: Vec<RepositoryRef>,
}

impl TeamConfig {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            ..Default::default()
        }
    }

    pub fn credential(&self) -> Option<String> {
        self.access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty()))
    }

    pub fn root(&self) -> Option<&str> {
        self.root_reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

pub trait TeamConfigSource: Send + Sync {
    fn team(&self, team_id: &str) -> Result<Option<TeamConfig>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TeamsFile {
    teams: Vec<TeamConfig>,
}

pub struct TeamRegistry {
    path: PathBuf,
    guard: Mutex<()>,
}

impl TeamRegistry {
    pub fn open(root: &Path) -> Result<Self> {
        util::ensure_dir(root)?;
        Ok(Self {
            path: root.join(TEAMS_FILE),
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Result<Vec<TeamConfig>> {
        Ok(self.read()?.teams)
    }

    pub fn upsert(&self, team: TeamConfig) -> Result<()> {
        let _guard = self.guard.lock().unwrap();
        let mut file = self.read()?;
        file.teams.retain(|t| t.team_id != team.team_id);
        file.teams.push(team);
        file.teams.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        self.write(&file)
    }

    pub fn set_selection(&self, team_id: &str, repos: Vec<RepositoryRef>) -> Result<TeamConfig> {
        let _guard = self.guard.lock().unwrap();
        let mut file = self.read()?;
        let index = match file.teams.iter().position(|t| t.team_id == team_id) {
            Some(index) => index,
            None => {
                file.teams.push(TeamConfig::new(team_id));
                file.teams.len() - 1
            }
        };
        file.teams[index].selected_repositories = repos;
        let updated = file.teams[index].clone();
        self.write(&file)?;
        Ok(updated)
    }

    fn read(&self) -> Result<TeamsFile> {
        if !self.path.exists() {
            return Ok(TeamsFile::default());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let teams: TeamsFile = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(teams)
    }

    fn write(&self, teams: &TeamsFile) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            serde_json::to_writer_pretty(&mut file, teams)?;
        }
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

impl TeamConfigSource for TeamRegistry {
    fn team(&self, team_id: &str) -> Result<Option<TeamConfig>> {
        Ok(self
            .read()?
            .teams
            .into_iter()
            .find(|t| t.team_id == team_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load(dir.path()).unwrap(), Settings::default());
        let registry = TeamRegistry::open(dir.path()).unwrap();
        assert!(registry.list().unwrap().is_empty());
        assert!(registry.team("platform").unwrap().is_none());
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"concurrency": 6, "clone_timeout_secs": 60}"#,
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.concurrency, 6);
        assert_eq!(settings.clone_timeout(), Duration::from_secs(60));
        assert_eq!(settings.api_base_url, "https://api.github.com");
    }

    #[test]
    fn upsert_and_select_persist() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TeamRegistry::open(dir.path()).unwrap();
        let mut team = TeamConfig::new("platform");
        team.root_reference = Some("https://github.com/acme".into());
        team.access_token = Some("tkn".into());
        registry.upsert(team).unwrap();

        let updated = registry
            .set_selection("platform", vec![RepositoryRef::from_full_name("acme/api")])
            .unwrap();
        assert_eq!(updated.root(), Some("https://github.com/acme"));

        let reloaded = registry.team("platform").unwrap().unwrap();
        assert_eq!(reloaded.selected_repositories.len(), 1);
        assert_eq!(reloaded.credential().as_deref(), Some("tkn"));
    }

    #[test]
    fn blank_root_is_treated_as_missing() {
        let mut team = TeamConfig::new("t");
        team.root_reference = Some("   ".into());
        assert_eq!(team.root(), None);
    }
}
