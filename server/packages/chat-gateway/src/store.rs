use std::collections::HashSet;
use std::path::Path;

use chat_gateway_error::GatewayError;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub title: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub permission_mode: String,
    pub system_prompt: Option<Value>,
}

/// Durable session metadata, keyed by session id. Upserts merge: title and
/// cwd take the latest write, created_at keeps the minimum, updated_at the
/// maximum.
#[derive(Debug)]
pub struct SessionStore {
    conn: Mutex<Connection>,
}

fn storage(err: rusqlite::Error) -> GatewayError {
    GatewayError::storage(err.to_string())
}

// Fixed-width UTC so the SQL min/max comparisons stay chronological.
fn dt_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn str_to_dt(value: &str) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| GatewayError::storage(format!("bad timestamp {value:?}: {err}")))
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, GatewayError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS sessions (
                 session_id TEXT PRIMARY KEY,
                 title TEXT NOT NULL,
                 cwd TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS agent_sessions (
                 agent_id TEXT PRIMARY KEY,
                 parent_session_id TEXT,
                 title TEXT NOT NULL,
                 cwd TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 FOREIGN KEY(parent_session_id) REFERENCES sessions(session_id) ON DELETE SET NULL
             );
             CREATE TABLE IF NOT EXISTS user_settings (
                 user_id TEXT PRIMARY KEY,
                 permission_mode TEXT NOT NULL,
                 system_prompt TEXT
             );",
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, GatewayError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT session_id, title, cwd, created_at, updated_at
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(|(session_id, title, cwd, created_at, updated_at)| {
            Ok(SessionRow {
                session_id,
                title,
                cwd,
                created_at: str_to_dt(&created_at)?,
                updated_at: str_to_dt(&updated_at)?,
            })
        })
        .transpose()
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>, GatewayError> {
        let conn = self.conn.lock();
        let mut statement = conn
            .prepare(
                "SELECT session_id, title, cwd, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC",
            )
            .map_err(storage)?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(storage)?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, title, cwd, created_at, updated_at) = row.map_err(storage)?;
            sessions.push(SessionRow {
                session_id,
                title,
                cwd,
                created_at: str_to_dt(&created_at)?,
                updated_at: str_to_dt(&updated_at)?,
            });
        }
        Ok(sessions)
    }

    pub fn session_ids(&self) -> Result<HashSet<String>, GatewayError> {
        let conn = self.conn.lock();
        let mut statement = conn
            .prepare("SELECT session_id FROM sessions")
            .map_err(storage)?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage)?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row.map_err(storage)?);
        }
        Ok(ids)
    }

    pub fn upsert_session(
        &self,
        session_id: &str,
        title: &str,
        cwd: &str,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, title, cwd, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                 title = excluded.title,
                 cwd = excluded.cwd,
                 created_at = CASE
                     WHEN excluded.created_at < sessions.created_at THEN excluded.created_at
                     ELSE sessions.created_at
                 END,
                 updated_at = CASE
                     WHEN excluded.updated_at > sessions.updated_at THEN excluded.updated_at
                     ELSE sessions.updated_at
                 END",
            params![
                session_id,
                title,
                cwd,
                dt_to_str(created_at),
                dt_to_str(updated_at)
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn upsert_agent_session(
        &self,
        agent_id: &str,
        parent_session_id: Option<&str>,
        title: &str,
        cwd: &str,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_sessions (agent_id, parent_session_id, title, cwd, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id) DO UPDATE SET
                 parent_session_id = COALESCE(excluded.parent_session_id, agent_sessions.parent_session_id),
                 title = excluded.title,
                 cwd = excluded.cwd,
                 created_at = CASE
                     WHEN excluded.created_at < agent_sessions.created_at THEN excluded.created_at
                     ELSE agent_sessions.created_at
                 END,
                 updated_at = CASE
                     WHEN excluded.updated_at > agent_sessions.updated_at THEN excluded.updated_at
                     ELSE agent_sessions.updated_at
                 END",
            params![
                agent_id,
                parent_session_id,
                title,
                cwd,
                dt_to_str(created_at),
                dt_to_str(updated_at)
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettings>, GatewayError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT user_id, permission_mode, system_prompt
                 FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(|(user_id, permission_mode, system_prompt)| {
            let system_prompt = system_prompt
                .map(|text| {
                    serde_json::from_str(&text).map_err(|err| {
                        GatewayError::storage(format!("bad system_prompt for {user_id}: {err}"))
                    })
                })
                .transpose()?;
            Ok(UserSettings {
                user_id,
                permission_mode,
                system_prompt,
            })
        })
        .transpose()
    }

    pub fn upsert_user_settings(
        &self,
        user_id: &str,
        permission_mode: &str,
        system_prompt: Option<&Value>,
    ) -> Result<UserSettings, GatewayError> {
        let serialized = system_prompt.map(Value::to_string);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_settings (user_id, permission_mode, system_prompt)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 permission_mode = excluded.permission_mode,
                 system_prompt = excluded.system_prompt",
            params![user_id, permission_mode, serialized],
        )
        .map_err(storage)?;
        Ok(UserSettings {
            user_id: user_id.to_string(),
            permission_mode: permission_mode.to_string(),
            system_prompt: system_prompt.cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    #[test]
    fn upsert_merges_timestamps() {
        let store = SessionStore::in_memory().expect("store");
        store
            .upsert_session("s1", "first", "/tmp/a", ts(100), ts(100))
            .expect("insert");
        store
            .upsert_session("s1", "second", "/tmp/b", ts(50), ts(200))
            .expect("update");

        let row = store.get_session("s1").expect("get").expect("row");
        assert_eq!(row.title, "second");
        assert_eq!(row.cwd, "/tmp/b");
        assert_eq!(row.created_at, ts(50));
        assert_eq!(row.updated_at, ts(200));

        // an older write never regresses updated_at
        store
            .upsert_session("s1", "third", "/tmp/c", ts(150), ts(150))
            .expect("update");
        let row = store.get_session("s1").expect("get").expect("row");
        assert_eq!(row.created_at, ts(50));
        assert_eq!(row.updated_at, ts(200));
        assert_eq!(row.title, "third");
    }

    #[test]
    fn lists_sessions_most_recent_first() {
        let store = SessionStore::in_memory().expect("store");
        store
            .upsert_session("old", "old", "/tmp", ts(10), ts(10))
            .expect("insert");
        store
            .upsert_session("new", "new", "/tmp", ts(20), ts(20))
            .expect("insert");

        let sessions = store.list_sessions().expect("list");
        let ids = sessions
            .iter()
            .map(|row| row.session_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn user_settings_round_trip() {
        let store = SessionStore::in_memory().expect("store");
        assert!(store.get_user_settings("alice").expect("get").is_none());

        let prompt = serde_json::json!({"type": "preset", "preset": "claude_code"});
        store
            .upsert_user_settings("alice", "plan", Some(&prompt))
            .expect("upsert");
        let settings = store
            .get_user_settings("alice")
            .expect("get")
            .expect("settings");
        assert_eq!(settings.permission_mode, "plan");
        assert_eq!(settings.system_prompt, Some(prompt));

        store
            .upsert_user_settings("alice", "default", None)
            .expect("upsert");
        let settings = store
            .get_user_settings("alice")
            .expect("get")
            .expect("settings");
        assert_eq!(settings.permission_mode, "default");
        assert!(settings.system_prompt.is_none());
    }

    #[test]
    fn agent_sessions_keep_earliest_created_at() {
        let store = SessionStore::in_memory().expect("store");
        store
            .upsert_session("parent", "p", "/tmp", ts(5), ts(5))
            .expect("insert");
        store
            .upsert_agent_session("agent-1", Some("parent"), "run", "/tmp", ts(30), ts(30))
            .expect("insert");
        store
            .upsert_agent_session("agent-1", None, "run2", "/tmp", ts(20), ts(40))
            .expect("update");
        // parent linkage survives a later write without one
        let ids = store.session_ids().expect("ids");
        assert!(ids.contains("parent"));
    }
}
