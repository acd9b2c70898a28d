//! SQLite sink

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use tracing::{debug, info};

use super::{ResultSink, SinkError};
use crate::result::ProbeResult;

/// Columns every results table must carry
pub const REQUIRED_COLUMNS: [&str; 6] = ["id", "date", "time", "ping", "download", "upload"];

/// Appends one row per iteration to a table
pub struct SqliteSink {
    conn: Connection,
    path: PathBuf,
    table: String,
}

impl std::fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSink")
            .field("path", &self.path)
            .field("table", &self.table)
            .finish()
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
pub fn validate_table_name(table: &str) -> Result<(), SinkError> {
    let mut chars = table.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SinkError::InvalidTable(table.to_string()))
    }
}

impl SqliteSink {
    /// Open (creating if needed) the database and results table
    pub fn open(path: &Path, table: &str) -> Result<Self, SinkError> {
        debug!(?path, table, "SqliteSink::open: called");
        validate_table_name(table)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| SinkError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let sink = Self {
            conn,
            path: path.to_path_buf(),
            table: table.to_string(),
        };
        sink.ensure_schema()?;
        info!(?path, table, "Result database ready");
        Ok(sink)
    }

    /// In-memory database, for tests
    pub fn open_in_memory(table: &str) -> Result<Self, SinkError> {
        validate_table_name(table)?;
        let conn = Connection::open_in_memory().map_err(|source| SinkError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let sink = Self {
            conn,
            path: PathBuf::from(":memory:"),
            table: table.to_string(),
        };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&self) -> Result<(), SinkError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                ping REAL NOT NULL,
                download REAL NOT NULL,
                upload REAL NOT NULL
            )",
            self.table
        );
        self.conn.execute_batch(&create).map_err(|source| SinkError::Sql {
            context: "create table",
            source,
        })?;

        let columns = self.columns()?;
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !columns.iter().any(|have| have == *c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SinkError::Schema {
                table: self.table.clone(),
                missing,
            });
        }
        Ok(())
    }

    fn columns(&self) -> Result<Vec<String>, SinkError> {
        let sql = format!("PRAGMA table_info({})", self.table);
        let sql_err = |source| SinkError::Sql {
            context: "table info",
            source,
        };
        let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(names)
    }

    /// Number of stored rows
    pub fn count(&self) -> Result<u64, SinkError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        self.conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|source| SinkError::Sql {
                context: "count",
                source,
            })
    }

    /// Most recent rows as (date, time, ping, download, upload), newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<(String, String, f64, f64, f64)>, SinkError> {
        let sql = format!(
            "SELECT date, time, ping, download, upload FROM {} ORDER BY id DESC LIMIT ?1",
            self.table
        );
        let sql_err = |source| SinkError::Sql {
            context: "recent",
            source,
        };
        let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }
}

impl ResultSink for SqliteSink {
    fn store(&mut self, result: &ProbeResult) -> Result<(), SinkError> {
        let sql = format!(
            "INSERT INTO {} (date, time, ping, download, upload) VALUES (?1, ?2, ?3, ?4, ?5)",
            self.table
        );
        self.conn
            .execute(
                &sql,
                params![
                    result.date_string(),
                    result.time_string(),
                    result.latency,
                    result.download_mbps,
                    result.upload_mbps
                ],
            )
            .map_err(|source| SinkError::Sql {
                context: "insert result",
                source,
            })?;
        debug!(table = %self.table, %result, "SqliteSink::store: stored");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.path.display(), self.table)
    }
}
