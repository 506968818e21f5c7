use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::logging::types::RequestLog;

// 北京时间时区 (UTC+8)；与历史数据保持一致的落库格式
const BEIJING_OFFSET_SECS: i32 = 8 * 3600;
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn to_db_time(dt: &DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(BEIJING_OFFSET_SECS).expect("fixed UTC+8 offset");
    dt.with_timezone(&offset).format(DATETIME_FORMAT).to_string()
}

fn from_db_time(s: &str) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(BEIJING_OFFSET_SECS).expect("fixed UTC+8 offset");
    chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .ok()
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// SQLite store for groups, key identities, and per-attempt request logs.
#[derive(Clone)]
pub struct DatabaseLogger {
    connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("Failed to create directory: {}", e)),
                    ));
                }
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);

        Self::setup_schema(&conn)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::setup_schema(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn setup_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                display_name TEXT,
                group_type TEXT NOT NULL DEFAULT 'standard',
                channel_type TEXT NOT NULL DEFAULT 'openai'
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                key_hash TEXT NOT NULL,
                key_value TEXT NOT NULL,
                is_organization_key INTEGER NOT NULL DEFAULT 0,
                organization_id TEXT,
                UNIQUE (group_id, key_hash)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                group_id INTEGER NOT NULL,
                group_name TEXT NOT NULL,
                parent_group_id INTEGER,
                parent_group_name TEXT,
                is_success INTEGER NOT NULL,
                source_ip TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                request_path TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                user_agent TEXT NOT NULL DEFAULT '',
                request_type TEXT NOT NULL,
                is_stream INTEGER NOT NULL,
                upstream_addr TEXT NOT NULL DEFAULT '',
                request_body TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                key_value TEXT NOT NULL DEFAULT '',
                key_hash TEXT NOT NULL DEFAULT '',
                error_message TEXT
            )",
            [],
        )?;

        // 旧库迁移：organization 字段与 token 统计列（已存在则忽略）
        let _ = conn.execute(
            "ALTER TABLE api_keys ADD COLUMN is_organization_key INTEGER NOT NULL DEFAULT 0",
            [],
        );
        let _ = conn.execute("ALTER TABLE api_keys ADD COLUMN organization_id TEXT", []);
        let _ = conn.execute("ALTER TABLE request_logs ADD COLUMN prompt_tokens INTEGER", []);
        let _ = conn.execute(
            "ALTER TABLE request_logs ADD COLUMN completion_tokens INTEGER",
            [],
        );
        let _ = conn.execute("ALTER TABLE request_logs ADD COLUMN total_tokens INTEGER", []);

        Ok(())
    }

    /// Registers a group by name, returning its stable id.
    pub async fn upsert_group(
        &self,
        name: &str,
        display_name: &str,
        group_type: &str,
        channel_type: &str,
    ) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO groups (name, display_name, group_type, channel_type)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                display_name = excluded.display_name,
                group_type = excluded.group_type,
                channel_type = excluded.channel_type",
            rusqlite::params![name, display_name, group_type, channel_type],
        )?;
        conn.query_row(
            "SELECT id FROM groups WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
    }

    /// Registers a key by its deterministic hash. Returns the key id plus the
    /// persisted organization state so a restart keeps earlier promotions.
    pub async fn upsert_api_key(
        &self,
        group_id: i64,
        key_hash: &str,
        encrypted_value: &str,
    ) -> Result<(i64, bool, Option<String>)> {
        let conn = self.connection.lock().await;

        let existing: Option<(i64, bool, Option<String>)> = conn
            .query_row(
                "SELECT id, is_organization_key, organization_id
                 FROM api_keys WHERE group_id = ?1 AND key_hash = ?2",
                rusqlite::params![group_id, key_hash],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?)),
            )
            .optional()?;

        if let Some(found) = existing {
            return Ok(found);
        }

        conn.execute(
            "INSERT INTO api_keys (group_id, key_hash, key_value) VALUES (?1, ?2, ?3)",
            rusqlite::params![group_id, key_hash, encrypted_value],
        )?;
        Ok((conn.last_insert_rowid(), false, None))
    }

    /// Persists the monotonic organization promotion (I2: only ever true).
    pub async fn update_organization_status(&self, key_id: i64, is_organization: bool) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE api_keys SET is_organization_key = ?1 WHERE id = ?2",
            rusqlite::params![is_organization as i64, key_id],
        )?;
        Ok(())
    }

    pub async fn insert_request_log(&self, log: &RequestLog) -> Result<i64> {
        let conn = self.connection.lock().await;

        conn.execute(
            "INSERT INTO request_logs (
                timestamp, group_id, group_name, parent_group_id, parent_group_name,
                is_success, source_ip, status_code, request_path, duration_ms,
                user_agent, request_type, is_stream, upstream_addr, request_body,
                model, key_value, key_hash, error_message,
                prompt_tokens, completion_tokens, total_tokens
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            rusqlite::params![
                to_db_time(&log.timestamp),
                log.group_id,
                &log.group_name,
                log.parent_group_id,
                &log.parent_group_name,
                log.is_success as i64,
                &log.source_ip,
                log.status_code,
                &log.request_path,
                log.duration_ms,
                &log.user_agent,
                &log.request_type,
                log.is_stream as i64,
                &log.upstream_addr,
                &log.request_body,
                &log.model,
                &log.key_value,
                &log.key_hash,
                &log.error_message,
                log.prompt_tokens,
                log.completion_tokens,
                log.total_tokens,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    #[allow(dead_code)]
    pub async fn recent_request_logs(&self, limit: i64) -> Result<Vec<RequestLog>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, group_id, group_name, parent_group_id, parent_group_name,
                    is_success, source_ip, status_code, request_path, duration_ms,
                    user_agent, request_type, is_stream, upstream_addr, request_body,
                    model, key_value, key_hash, error_message,
                    prompt_tokens, completion_tokens, total_tokens
             FROM request_logs ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            Ok(RequestLog {
                id: Some(row.get(0)?),
                timestamp: from_db_time(&row.get::<_, String>(1)?),
                group_id: row.get(2)?,
                group_name: row.get(3)?,
                parent_group_id: row.get(4)?,
                parent_group_name: row.get(5)?,
                is_success: row.get::<_, i64>(6)? != 0,
                source_ip: row.get(7)?,
                status_code: row.get(8)?,
                request_path: row.get(9)?,
                duration_ms: row.get(10)?,
                user_agent: row.get(11)?,
                request_type: row.get(12)?,
                is_stream: row.get::<_, i64>(13)? != 0,
                upstream_addr: row.get(14)?,
                request_body: row.get(15)?,
                model: row.get(16)?,
                key_value: row.get(17)?,
                key_hash: row.get(18)?,
                error_message: row.get(19)?,
                prompt_tokens: row.get(20)?,
                completion_tokens: row.get(21)?,
                total_tokens: row.get(22)?,
            })
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
