//! Durable storage for run manifests, keyed by run id.

use super::Database;
use crate::bias::RunManifest;
use crate::error::{Error, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

impl Database {
    /// Store a finished manifest. Re-inserting a run id replaces it.
    pub fn insert_run(&self, manifest: &RunManifest) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO scrape_runs (run_id, started_at, ended_at, backend, manifest_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(run_id) DO UPDATE SET
                ended_at = excluded.ended_at,
                manifest_json = excluded.manifest_json
            "#,
            params![
                manifest.run_id,
                manifest.start_time.to_rfc3339(),
                manifest.end_time.map(|t| t.to_rfc3339()),
                manifest.backend.as_str(),
                serde_json::to_string(manifest)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get one manifest by run id
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunManifest>> {
        let conn = self.conn();
        let json: Option<String> = conn
            .query_row(
                "SELECT manifest_json FROM scrape_runs WHERE run_id = ?",
                [run_id],
                |r| r.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(Error::from))
            .transpose()
    }

    /// Most recent manifests, newest first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunManifest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT manifest_json FROM scrape_runs ORDER BY started_at DESC, created_at DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map([limit as i64], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(Error::from))
            .collect()
    }

    /// Most recent manifests that included a channel, newest first
    pub fn recent_runs_for_channel(&self, channel: &str, limit: usize) -> Result<Vec<RunManifest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT manifest_json FROM scrape_runs
            WHERE EXISTS (
                SELECT 1 FROM json_each(scrape_runs.manifest_json, '$.channels')
                WHERE json_each.value = ?1
            )
            ORDER BY started_at DESC, created_at DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![channel, limit as i64], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(Error::from))
            .collect()
    }
}
