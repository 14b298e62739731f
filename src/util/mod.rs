use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use reqwest::Url;

pub const HOME_ENV: &str = "REPOMETRICS_HOME";

pub fn data_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let dir = match (explicit, std::env::var_os(HOME_ENV)) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(dir)) => PathBuf::from(dir),
        (None, None) => {
            let base = BaseDirs::new().context("failed to locate home directory")?;
            base.home_dir().join(".repometrics")
        }
    };
    ensure_dir(&dir)?;
    Ok(dir)
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory {}", path.display()))?;
    }
    Ok(())
}

pub fn tool_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Ok(_) => url.to_string(),
        Err(_) => "<unparseable url>".to_string(),
    }
}

pub fn scrub(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => text.replace(secret, "***"),
        _ => text.to_string(),
    }
}

pub fn with_query(url: &str, pairs: &[(&str, &str)]) -> Result<String> {
    let mut parsed = Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
    {
        let existing: Vec<String> = parsed.query_pairs().map(|(k, _)| k.into_owned()).collect();
        let mut query = parsed.query_pairs_mut();
        for (key, value) in pairs {
            if !existing.iter().any(|k| k == key) {
                query.append_pair(key, value);
            }
        }
    }
    Ok(parsed.to_string())
}
