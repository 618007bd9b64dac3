// Settings store -- key/value records shared by every process.
// Holds the schema version counter and the import lock record.

use std::collections::HashMap;
use std::sync::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{DocrateError, Result};

pub trait SettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Upsert.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns true if a record was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Atomic conditional write: store `value` only if the current record
    /// equals `expected` (`None` = key absent). Returns `None` when the
    /// backend has no such primitive.
    fn compare_and_swap(&self, _key: &str, _expected: Option<&str>, _value: &str) -> Result<Option<bool>> {
        Ok(None)
    }

    /// Atomic conditional delete: remove the record only if it still equals
    /// `expected`. Returns `None` when the backend has no such primitive.
    fn compare_and_delete(&self, _key: &str, _expected: &str) -> Result<Option<bool>> {
        Ok(None)
    }
}

/// Settings table inside the SQLite database.
pub struct SqliteSettings<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettings<'a> {
    /// Wrap a connection, creating the settings table if missing.
    pub fn open(conn: &'a Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }
}

impl SettingsStore for SqliteSettings<'_> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        ).optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let rows = self.conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(rows > 0)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<Option<bool>> {
        let rows = match expected {
            None => self.conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO NOTHING",
                params![key, value],
            )?,
            Some(old) => self.conn.execute(
                "UPDATE settings SET value = ?1 WHERE key = ?2 AND value = ?3",
                params![value, key, old],
            )?,
        };
        Ok(Some(rows == 1))
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<Option<bool>> {
        let rows = self.conn.execute(
            "DELETE FROM settings WHERE key = ?1 AND value = ?2",
            params![key, expected],
        )?;
        Ok(Some(rows > 0))
    }
}

/// Process-local store with plain get/set/delete and no conditional write.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.remove(key).is_some())
    }
}

/// Read an integer setting. A missing key is 0; a value that is not a
/// number is an error so counters are never silently reset.
pub fn get_u32(store: &dyn SettingsStore, key: &str) -> Result<u32> {
    match store.get(key)? {
        None => Ok(0),
        Some(value) => value.trim().parse::<u32>().map_err(|_| {
            DocrateError::Config(format!("Setting {} holds a non-numeric value '{}'", key, value))
        }),
    }
}
