use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use arkctrl::schema::{ErrorBody, Job, JobStatus, JobType};

use crate::error::{Error, Result};
use crate::model::ServerConfig;

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedMod {
    pub mod_id: String,
    pub mod_name: Option<String>,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMod {
    pub server_name: String,
    pub mod_id: String,
    pub mod_name: Option<String>,
    pub enabled: bool,
    pub exclude_shared_mods: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ServerSettingsRow {
    pub exclude_shared_mods: bool,
}

/// Patch applied by `update_job`. Absent fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorBody>,
}

/// Single-writer embedded store. Every public call is one transaction; no
/// transaction spans component boundaries.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let conn = Connection::open(path)?;

        // journal_mode returns the resulting mode, so it must go through a
        // query rather than execute()
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute_batch(include_str!("schema.sql"))?;
        Store::run_migrations(&conn)?;
        Store::compact(&conn)?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(server_mods)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();

        if !columns.contains(&"exclude_shared_mods".to_owned()) {
            info!("migration: adding exclude_shared_mods column to server_mods");
            conn.execute(
                "ALTER TABLE server_mods ADD COLUMN exclude_shared_mods INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }

        Ok(())
    }

    /// One-shot startup compaction: legacy deployments could persist rows
    /// with NULL keys. Insert paths validate these away now, so after this
    /// pass the condition cannot recur.
    fn compact(conn: &Connection) -> Result<()> {
        let mods = conn.execute("DELETE FROM server_mods WHERE mod_id IS NULL", [])?;
        let configs = conn.execute("DELETE FROM server_configs WHERE server_name IS NULL", [])?;
        if mods > 0 || configs > 0 {
            info!(
                "startup compaction removed {} null server_mods rows and {} null server_configs rows",
                mods, configs
            );
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a panic occurred mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ***********************
    // Server configurations
    // ***********************

    pub fn upsert_server_config(&self, config: &ServerConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(Error::Validation(
                "serverConfig.name: may not be empty".to_owned(),
            ));
        }
        let json = serde_json::to_string(config)?;
        self.lock().execute(
            "INSERT INTO server_configs (server_name, cluster_name, config, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(server_name) DO UPDATE SET
                cluster_name = ?2, config = ?3, updated_at = ?4",
            params![
                config.name,
                config.cluster_name,
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_server_config(&self, name: &str) -> Result<Option<ServerConfig>> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT config FROM server_configs WHERE server_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn list_server_configs(&self) -> Result<Vec<ServerConfig>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT config FROM server_configs ORDER BY server_name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut configs = Vec::new();
        for row in rows {
            match serde_json::from_str::<ServerConfig>(&row?) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("skipping unparseable server config row: {:?}", e),
            }
        }
        Ok(configs)
    }

    pub fn delete_server_config(&self, name: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM server_configs WHERE server_name = ?1",
            params![name],
        )?;
        conn.execute(
            "DELETE FROM server_mods WHERE server_name = ?1",
            params![name],
        )?;
        conn.execute(
            "DELETE FROM server_settings WHERE server_name = ?1",
            params![name],
        )?;
        Ok(())
    }

    // ***********************
    // Shared mods
    // ***********************

    pub fn upsert_shared_mod(
        &self,
        mod_id: Option<&str>,
        mod_name: Option<&str>,
        enabled: bool,
    ) -> Result<()> {
        let mod_id = match mod_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(Error::Validation(
                    "sharedMod.modId: may not be null or empty".to_owned(),
                ))
            }
        };
        self.lock().execute(
            "INSERT INTO shared_mods (mod_id, mod_name, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(mod_id) DO UPDATE SET mod_name = ?2, enabled = ?3",
            params![mod_id, mod_name, enabled, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_shared_mods(&self) -> Result<Vec<SharedMod>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT mod_id, mod_name, enabled FROM shared_mods ORDER BY created_at, mod_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SharedMod {
                mod_id: row.get(0)?,
                mod_name: row.get(1)?,
                enabled: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_shared_mod(&self, mod_id: &str) -> Result<()> {
        let removed = self.lock().execute(
            "DELETE FROM shared_mods WHERE mod_id = ?1",
            params![mod_id],
        )?;
        if removed == 0 {
            Err(Error::NotFound(format!("shared mod '{}'", mod_id)))
        } else {
            Ok(())
        }
    }

    // ***********************
    // Per-server mods
    // ***********************

    pub fn upsert_server_mod(
        &self,
        server_name: &str,
        mod_id: Option<&str>,
        mod_name: Option<&str>,
        enabled: bool,
        exclude_shared_mods: bool,
    ) -> Result<()> {
        if server_name.trim().is_empty() {
            return Err(Error::Validation(
                "serverMod.serverName: may not be empty".to_owned(),
            ));
        }
        let mod_id = match mod_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(Error::Validation(
                    "serverMod.modId: may not be null or empty".to_owned(),
                ))
            }
        };
        self.lock().execute(
            "INSERT INTO server_mods (server_name, mod_id, mod_name, enabled, exclude_shared_mods)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(server_name, mod_id) DO UPDATE SET
                mod_name = ?3, enabled = ?4, exclude_shared_mods = ?5",
            params![server_name, mod_id, mod_name, enabled, exclude_shared_mods],
        )?;
        Ok(())
    }

    pub fn list_server_mods(&self, server_name: &str) -> Result<Vec<ServerMod>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT server_name, mod_id, mod_name, enabled, exclude_shared_mods
             FROM server_mods WHERE server_name = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![server_name], |row| {
            Ok(ServerMod {
                server_name: row.get(0)?,
                mod_id: row.get(1)?,
                mod_name: row.get(2)?,
                enabled: row.get(3)?,
                exclude_shared_mods: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ***********************
    // Per-server settings
    // ***********************

    pub fn get_server_settings(&self, server_name: &str) -> Result<Option<ServerSettingsRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT exclude_shared_mods FROM server_settings WHERE server_name = ?1",
                params![server_name],
                |row| {
                    Ok(ServerSettingsRow {
                        exclude_shared_mods: row.get(0)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_server_settings(
        &self,
        server_name: &str,
        exclude_shared_mods: bool,
    ) -> Result<()> {
        if server_name.trim().is_empty() {
            return Err(Error::Validation(
                "serverSettings.serverName: may not be empty".to_owned(),
            ));
        }
        self.lock().execute(
            "INSERT INTO server_settings (server_name, exclude_shared_mods)
             VALUES (?1, ?2)
             ON CONFLICT(server_name) DO UPDATE SET exclude_shared_mods = ?2",
            params![server_name, exclude_shared_mods],
        )?;
        Ok(())
    }

    // ***********************
    // Jobs
    // ***********************

    pub fn create_job(&self, job: &Job) -> Result<()> {
        self.lock().execute(
            "INSERT INTO jobs (id, job_type, status, progress, message, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.job_type.to_string(),
                job.status.to_string(),
                job.progress,
                job.message,
                serde_json::to_string(&job.data)?,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Applies a patch to a job row. Terminal jobs are immutable: a patch
    /// against one is dropped with a warning.
    pub fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<()> {
        let current = self
            .get_job(id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        if current.status.is_terminal() {
            warn!("dropping update to terminal job {}", id);
            return Ok(());
        }

        let status = patch.status.unwrap_or(current.status);
        let progress = patch.progress.unwrap_or(current.progress);
        let message = patch.message.unwrap_or(current.message);
        let result = match patch.result {
            Some(v) => Some(serde_json::to_string(&v)?),
            None => current.result.map(|v| v.to_string()),
        };
        let error = match patch.error {
            Some(e) => Some(serde_json::to_string(&e)?),
            None => None,
        };

        self.lock().execute(
            "UPDATE jobs SET status = ?2, progress = ?3, message = ?4, result = ?5,
                error = COALESCE(?6, error), updated_at = ?7
             WHERE id = ?1",
            params![
                id.to_string(),
                status.to_string(),
                progress,
                message,
                result,
                error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_type, status, progress, message, data, result, error, created_at, updated_at
             FROM jobs WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_type, status, progress, message, data, result, error, created_at, updated_at
             FROM jobs ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            match job_from_row(row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("skipping unparseable job row: {:?}", e),
            }
        }
        Ok(jobs)
    }

    pub fn purge_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let purged = self.lock().execute(
            "DELETE FROM jobs
             WHERE status IN ('succeeded', 'failed', 'cancelled') AND updated_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }

    // ***********************
    // Maps
    // ***********************

    pub fn list_maps(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT map_id FROM maps ORDER BY map_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> Result<Job> {
    let id: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let progress: u8 = row.get(3)?;
    let message: String = row.get(4)?;
    let data: Option<String> = row.get(5)?;
    let result: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Job {
        id: Uuid::from_str(&id).map_err(|e| Error::Internal(format!("bad job id: {}", e)))?,
        job_type: JobType::from_str(&job_type)
            .map_err(|_| Error::Internal(format!("bad job type '{}'", job_type)))?,
        status: JobStatus::from_str(&status)
            .map_err(|_| Error::Internal(format!("bad job status '{}'", status)))?,
        progress,
        message,
        data: match data {
            Some(json) => serde_json::from_str(&json)?,
            None => serde_json::Value::Null,
        },
        result: match result {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        },
        error: match error {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Internal(format!("bad created_at: {}", e)))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::Internal(format!("bad updated_at: {}", e)))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("arkctrl-test-{}.db", Uuid::new_v4()))
    }

    fn test_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_owned(),
            cluster_name: Some("C1".to_owned()),
            map: "TheIsland".to_owned(),
            port: 7777,
            query_port: 27015,
            rcon_port: 32330,
            max_players: 70,
            admin_password: "secret".to_owned(),
            server_password: None,
            rcon_password: "rcon".to_owned(),
            disable_battle_eye: false,
            game_user_settings: Default::default(),
            game_ini: Default::default(),
            launch_parameters: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn server_config_round_trips() {
        arkctrl::util::testing::logger_init();
        let path = temp_db_path();
        let store = Store::open(&path).unwrap();

        store.upsert_server_config(&test_config("C1-Isle")).unwrap();
        let read = store.get_server_config("C1-Isle").unwrap().unwrap();
        assert_eq!(read.name, "C1-Isle");
        assert_eq!(read.cluster_name.as_deref(), Some("C1"));

        store.delete_server_config("C1-Isle").unwrap();
        assert!(store.get_server_config("C1-Isle").unwrap().is_none());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn null_and_empty_mod_ids_are_rejected_without_side_effects() {
        arkctrl::util::testing::logger_init();
        let path = temp_db_path();
        let store = Store::open(&path).unwrap();

        assert!(matches!(
            store.upsert_shared_mod(None, None, true),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.upsert_shared_mod(Some("  "), None, true),
            Err(Error::Validation(_))
        ));
        assert!(store.list_shared_mods().unwrap().is_empty());

        assert!(matches!(
            store.upsert_server_mod("C1-Isle", None, None, true, false),
            Err(Error::Validation(_))
        ));
        assert!(store.list_server_mods("C1-Isle").unwrap().is_empty());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn startup_compaction_removes_legacy_null_rows() {
        arkctrl::util::testing::logger_init();
        let path = temp_db_path();
        drop(Store::open(&path).unwrap());

        // Simulate a legacy deployment that persisted NULL keys (a TEXT
        // primary key does not imply NOT NULL in sqlite).
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO server_mods (server_name, mod_id, enabled, exclude_shared_mods)
                 VALUES ('Ghost', NULL, 1, 0)",
                [],
            )
            .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.list_server_mods("Ghost").unwrap().is_empty());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn shared_mods_keep_insertion_order() {
        arkctrl::util::testing::logger_init();
        let path = temp_db_path();
        let store = Store::open(&path).unwrap();

        store.upsert_shared_mod(Some("333"), None, true).unwrap();
        store.upsert_shared_mod(Some("111"), None, true).unwrap();
        store
            .upsert_shared_mod(Some("222"), Some("named"), false)
            .unwrap();

        let ids: Vec<String> = store
            .list_shared_mods()
            .unwrap()
            .into_iter()
            .map(|m| m.mod_id)
            .collect();
        assert_eq!(ids, vec!["333", "111", "222"]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        arkctrl::util::testing::logger_init();
        let path = temp_db_path();
        let store = Store::open(&path).unwrap();

        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::CreateCluster,
            status: JobStatus::Pending,
            progress: 0,
            message: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            data: serde_json::json!({"name": "C1"}),
            result: None,
            error: None,
        };
        store.create_job(&job).unwrap();

        store
            .update_job(
                job.id,
                JobPatch {
                    status: Some(JobStatus::Succeeded),
                    progress: Some(100),
                    ..Default::default()
                },
            )
            .unwrap();

        store
            .update_job(
                job.id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    message: Some("too late".to_owned()),
                    ..Default::default()
                },
            )
            .unwrap();

        let read = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(read.status, JobStatus::Succeeded);
        assert_eq!(read.progress, 100);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn maps_are_seeded() {
        arkctrl::util::testing::logger_init();
        let path = temp_db_path();
        let store = Store::open(&path).unwrap();
        let maps = store.list_maps().unwrap();
        assert!(maps.iter().any(|m| m == "TheIsland"));
        assert!(maps.iter().any(|m| m == "Ragnarok"));
        let _ = std::fs::remove_file(path);
    }
}
