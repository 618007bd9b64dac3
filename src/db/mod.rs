// Database module

pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;

use crate::error::Result;

/// Open or create the Docrate database at the given path.
/// Does not migrate; run `migrations::MigrationRunner` explicitly.
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    configure(&conn)?;

    // WAL lets readers continue while one importer writes
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    Ok(conn)
}

/// In-memory database with the same connection settings (tests, dry runs).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    // Wait for competing processes instead of failing with SQLITE_BUSY
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    Ok(())
}
