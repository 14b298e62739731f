use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use reqwest::Url;
use tokio::process::Command;

use crate::error::{truncate, MetricsError, Result};
use crate::util;

/// Shallow-clones `url` into `dest`. Timeouts are the caller's concern;
/// dropping the returned future must stop the clone.
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn shallow_clone(&self, url: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GitCloner;

#[async_trait]
impl Cloner for GitCloner {
    async fn shallow_clone(&self, url: &str, dest: &Path) -> Result<()> {
        let output = Command::new("git")
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--single-branch")
            .arg("--quiet")
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| MetricsError::Clone {
                repo: util::redact_url(url),
                reason: format!("failed to spawn git: {err}"),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let password = Url::parse(url)
            .ok()
            .and_then(|u| u.password().map(str::to_string));
        Err(MetricsError::Clone {
            repo: util::redact_url(url),
            reason: truncate(&util::scrub(stderr.trim(), password.as_deref()), 512),
        })
    }
}

pub fn authenticated_clone_url(url: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return url.to_string();
    };
    match Url::parse(url) {
        Ok(mut parsed) if parsed.scheme() == "https" => {
            if parsed.set_username("x-access-token").is_err()
                || parsed.set_password(Some(token)).is_err()
            {
                return url.to_string();
            }
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}
