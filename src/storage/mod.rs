use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::util;

pub trait MetricsStore: Send + Sync {
    fn put(&self, team_id: &str, period_key: &str, payload: &Value) -> Result<()>;
    fn get_all(&self, team_id: &str) -> Result<BTreeMap<String, Value>>;
    fn clear(&self, team_id: &str) -> Result<()>;
}

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            util::ensure_dir(parent)?;
        }
        let mut conn =
            Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        init_db(&mut conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn teams(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT team_id FROM team_metrics ORDER BY team_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut teams = Vec::new();
        for team in rows {
            teams.push(team?);
        }
        Ok(teams)
    }
}

impl MetricsStore for SqliteStore {
    fn put(&self, team_id: &str, period_key: &str, payload: &Value) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO team_metrics (team_id, period_key, payload, updated_at) VALUES (?1, ?2, ?3, ?4) ON CONFLICT(team_id, period_key) DO UPDATE SET payload=excluded.payload, updated_at=excluded.updated_at",
            params![team_id, period_key, json, Utc::now().timestamp_millis()],
        )
        .with_context(|| format!("failed to store {period_key} for team {team_id}"))?;
        Ok(())
    }

    fn get_all(&self, team_id: &str) -> Result<BTreeMap<String, Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT period_key, payload FROM team_metrics WHERE team_id = ?1")?;
        let mut rows = stmt.query([team_id])?;
        let mut records = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let payload: String = row.get(1)?;
            let value: Value = serde_json::from_str(&payload)
                .with_context(|| format!("corrupt payload for {team_id}/{key}"))?;
            records.insert(key, value);
        }
        Ok(records)
    }

    fn clear(&self, team_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM team_metrics WHERE team_id = ?1", [team_id])
            .with_context(|| format!("failed to clear metrics for team {team_id}"))?;
        Ok(())
    }
}

fn init_db(conn: &mut Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", &"WAL")?;
    conn.pragma_update(None, "synchronous", &"NORMAL")?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS team_metrics (
            team_id TEXT NOT NULL,
            period_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (team_id, period_key)
        );
        "#,
    )?;
    Ok(())
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsStore for MemoryStore {
    fn put(&self, team_id: &str, period_key: &str, payload: &Value) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records
            .entry(team_id.to_string())
            .or_default()
            .insert(period_key.to_string(), payload.clone());
        Ok(())
    }

    fn get_all(&self, team_id: &str) -> Result<BTreeMap<String, Value>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(team_id).cloned().unwrap_or_default())
    }

    fn clear(&self, team_id: &str) -> Result<()> {
        self.records.lock().unwrap().remove(team_id);
        Ok(())
    }
}
