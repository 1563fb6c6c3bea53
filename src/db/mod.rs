mod hr;
mod widgets;

use crate::errors::{AppError, AppResult};
use crate::transport::{ChangeKind, LocalChangeFeed};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub mod tables {
    pub const EMPLOYEES: &str = "employees";
    pub const LEAVE_BALANCES: &str = "leave_balances";
    pub const LEAVE_REQUESTS: &str = "leave_requests";
    pub const ATTENDANCE: &str = "attendance";
    pub const ANNOUNCEMENTS: &str = "announcements";
    pub const PINNED_WIDGETS: &str = "pinned_widgets";
}

pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    changes: LocalChangeFeed,
}

impl Database {
    pub fn new(path: &Path, changes: LocalChangeFeed) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn change_feed(&self) -> &LocalChangeFeed {
        &self.changes
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // Must be called after the write committed and the connection lock was released.
    fn publish(&self, tables: &[&str], kind: ChangeKind, row_id: Option<&str>) {
        self.changes.publish_all(tables.iter().copied(), kind, row_id);
    }
}

fn invalid_data(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_data(error.to_string()))
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| invalid_data(format!("{}: {}", raw, error)))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
pub(crate) fn test_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("test.db"), LocalChangeFeed::new()).expect("db");
    (dir, db)
}
