// Database migrations
// Migrations are forward-only in normal operation. Never edit or delete a
// migration after it ships. Every `up` must be safe to re-run against a
// partially created schema (IF NOT EXISTS everywhere).

use rusqlite::Connection;
use serde::Serialize;

use crate::constants::SCHEMA_VERSION_KEY;
use crate::error::{DocrateError, Result};
use crate::settings::{self, SettingsStore};

/// One registered schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// All migrations in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema - doctors, arrangements, specialties, imports, mappings",
        up: r#"
        -- Doctors (SSOT for doctor identity)
        CREATE TABLE IF NOT EXISTS doctors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            license_number TEXT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            city TEXT,
            address TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_doctors_license ON doctors(license_number);
        CREATE INDEX IF NOT EXISTS idx_doctors_name ON doctors(last_name, first_name);
        CREATE INDEX IF NOT EXISTS idx_doctors_city ON doctors(city);
        CREATE INDEX IF NOT EXISTS idx_doctors_deleted ON doctors(deleted_at);

        -- Specialties (source value + normalized value per company)
        CREATE TABLE IF NOT EXISTS specialties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doctor_id INTEGER NOT NULL REFERENCES doctors(id),
            source_specialty TEXT NOT NULL,
            normalized_specialty TEXT,
            source_company TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_specialties_doctor ON specialties(doctor_id);
        CREATE INDEX IF NOT EXISTS idx_specialties_normalized ON specialties(normalized_specialty);
        CREATE INDEX IF NOT EXISTS idx_specialties_source ON specialties(source_company);

        -- Arrangements (which insurer has an agreement with which doctor)
        CREATE TABLE IF NOT EXISTS arrangements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doctor_id INTEGER NOT NULL REFERENCES doctors(id),
            insurance_company TEXT NOT NULL,
            arrangement_type TEXT,
            source_file TEXT,
            import_id INTEGER REFERENCES import_logs(id),
            valid_from TEXT,
            valid_until TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_arrangements_doctor ON arrangements(doctor_id);
        CREATE INDEX IF NOT EXISTS idx_arrangements_company ON arrangements(insurance_company);
        CREATE INDEX IF NOT EXISTS idx_arrangements_import ON arrangements(import_id);
        CREATE INDEX IF NOT EXISTS idx_arrangements_deleted ON arrangements(deleted_at);

        -- Import runs
        CREATE TABLE IF NOT EXISTS import_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            filename TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'running', 'completed', 'failed')),
            total_rows INTEGER NOT NULL DEFAULT 0,
            processed_rows INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            updated_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_import_logs_source ON import_logs(source);
        CREATE INDEX IF NOT EXISTS idx_import_logs_status ON import_logs(status);
        CREATE INDEX IF NOT EXISTS idx_import_logs_created ON import_logs(created_at);

        -- Per-row import results (append-only audit trail)
        CREATE TABLE IF NOT EXISTS import_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            import_id INTEGER NOT NULL REFERENCES import_logs(id),
            source_row INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('success', 'error', 'skipped')),
            doctor_id INTEGER REFERENCES doctors(id),
            error_message TEXT,
            raw_data TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_import_rows_import ON import_rows(import_id);
        CREATE INDEX IF NOT EXISTS idx_import_rows_status ON import_rows(status);

        -- Normalization mappings (SSOT for specialty/city/company names)
        CREATE TABLE IF NOT EXISTS ai_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mapping_type TEXT NOT NULL DEFAULT 'specialty'
                CHECK (mapping_type IN ('specialty', 'city', 'company')),
            source_value TEXT NOT NULL,
            normalized_value TEXT NOT NULL,
            confidence REAL,
            is_manual_override INTEGER NOT NULL DEFAULT 0,
            approved_by INTEGER,
            approved_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (mapping_type, source_value)
        );
        CREATE INDEX IF NOT EXISTS idx_ai_mappings_normalized ON ai_mappings(normalized_value);
        CREATE INDEX IF NOT EXISTS idx_ai_mappings_manual ON ai_mappings(is_manual_override);

        -- Entry logs (visit counting, minimal PII)
        CREATE TABLE IF NOT EXISTS entry_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            entry_source TEXT,
            referrer TEXT,
            user_agent TEXT,
            ip_hash TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_entry_logs_session ON entry_logs(session_id);
        CREATE INDEX IF NOT EXISTS idx_entry_logs_created ON entry_logs(created_at);

        -- Ratings placeholder (internal only)
        CREATE TABLE IF NOT EXISTS ratings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doctor_id INTEGER NOT NULL REFERENCES doctors(id),
            rating_type TEXT NOT NULL DEFAULT 'internal'
                CHECK (rating_type IN ('internal', 'user')),
            score REAL NOT NULL,
            source TEXT,
            import_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_ratings_doctor ON ratings(doctor_id);
        CREATE INDEX IF NOT EXISTS idx_ratings_deleted ON ratings(deleted_at);
        "#,
        down: r#"
        DROP TABLE IF EXISTS ratings;
        DROP TABLE IF EXISTS entry_logs;
        DROP TABLE IF EXISTS ai_mappings;
        DROP TABLE IF EXISTS import_rows;
        DROP TABLE IF EXISTS arrangements;
        DROP TABLE IF EXISTS specialties;
        DROP TABLE IF EXISTS import_logs;
        DROP TABLE IF EXISTS doctors;
        "#,
    },
    Migration {
        version: 2,
        description: "Import dedupe indexes - specialties, arrangements, row results",
        up: r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_specialties_unique
            ON specialties(doctor_id, source_specialty, source_company);
        CREATE INDEX IF NOT EXISTS idx_arrangements_doctor_company
            ON arrangements(doctor_id, insurance_company);
        CREATE INDEX IF NOT EXISTS idx_import_rows_source_row
            ON import_rows(import_id, source_row);
        "#,
        down: r#"
        DROP INDEX IF EXISTS idx_import_rows_source_row;
        DROP INDEX IF EXISTS idx_arrangements_doctor_company;
        DROP INDEX IF EXISTS idx_specialties_unique;
        "#,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    UpToDate,
    Migrated,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStep {
    pub version: u32,
    pub status: StepStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub from_version: u32,
    pub to_version: u32,
    pub steps: Vec<MigrationStep>,
}

impl MigrationReport {
    fn up_to_date(version: u32) -> Self {
        Self {
            status: MigrationStatus::UpToDate,
            from_version: version,
            to_version: version,
            steps: Vec::new(),
        }
    }

    /// Versions applied by this call.
    pub fn applied(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .map(|s| s.version)
            .collect()
    }

    /// The failing step, if the chain halted.
    pub fn failure(&self) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Error)
    }
}

/// Applies registered migrations in order and tracks the version counter in
/// the settings store. Performs no locking of its own; migrations are an
/// operator-triggered step.
pub struct MigrationRunner<'a> {
    conn: &'a Connection,
    settings: &'a dyn SettingsStore,
    registry: &'a [Migration],
}

impl<'a> MigrationRunner<'a> {
    pub fn new(conn: &'a Connection, settings: &'a dyn SettingsStore) -> Self {
        Self::with_registry(conn, settings, MIGRATIONS)
    }

    pub fn with_registry(
        conn: &'a Connection,
        settings: &'a dyn SettingsStore,
        registry: &'a [Migration],
    ) -> Self {
        Self { conn, settings, registry }
    }

    /// Highest registered version.
    pub fn latest_version(&self) -> u32 {
        self.registry.iter().map(|m| m.version).max().unwrap_or(0)
    }

    pub fn current_version(&self) -> Result<u32> {
        settings::get_u32(self.settings, SCHEMA_VERSION_KEY)
    }

    pub fn pending(&self) -> Result<bool> {
        Ok(self.current_version()? < self.latest_version())
    }

    fn find(&self, version: u32) -> Option<&Migration> {
        self.registry.iter().find(|m| m.version == version)
    }

    /// Run pending migrations. Halts at the first missing or failing step;
    /// the counter always reflects the last fully applied version.
    pub fn migrate(&self) -> Result<MigrationReport> {
        let current_version = self.current_version()?;
        let target_version = self.latest_version();

        // Refuse to run against a schema written by a newer build
        if current_version > target_version {
            return Err(DocrateError::SchemaAhead {
                current: current_version,
                supported: target_version,
            });
        }

        if current_version == target_version {
            return Ok(MigrationReport::up_to_date(current_version));
        }

        let mut report = MigrationReport {
            status: MigrationStatus::Migrated,
            from_version: current_version,
            to_version: current_version,
            steps: Vec::new(),
        };

        for version in (current_version + 1)..=target_version {
            match self.apply(version) {
                Ok(description) => {
                    self.settings.set(SCHEMA_VERSION_KEY, &version.to_string())?;
                    report.to_version = version;
                    report.steps.push(MigrationStep {
                        version,
                        status: StepStatus::Success,
                        message: description.to_string(),
                    });
                    log::info!("Applied migration {}", version);
                }
                Err(e) => {
                    log::error!("Migration chain halted at version {}: {}", version, e);
                    report.status = MigrationStatus::Halted;
                    report.steps.push(MigrationStep {
                        version,
                        status: StepStatus::Error,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        Ok(report)
    }

    fn apply(&self, version: u32) -> Result<&'static str> {
        let migration = self
            .find(version)
            .ok_or(DocrateError::MigrationMissing(version))?;

        if migration.up.trim().is_empty() {
            return Err(DocrateError::MigrationDefinitionMissing(version));
        }

        self.conn
            .execute_batch(migration.up)
            .map_err(|e| DocrateError::MigrationFailed {
                version,
                message: e.to_string(),
            })?;

        Ok(migration.description)
    }

    /// Manually roll back the most recently applied migration. Never called
    /// automatically.
    pub fn rollback_last(&self) -> Result<MigrationReport> {
        let current_version = self.current_version()?;
        if current_version == 0 {
            return Ok(MigrationReport::up_to_date(0));
        }

        let migration = self
            .find(current_version)
            .ok_or(DocrateError::MigrationMissing(current_version))?;

        let mut report = MigrationReport {
            status: MigrationStatus::Migrated,
            from_version: current_version,
            to_version: current_version,
            steps: Vec::new(),
        };

        match self.conn.execute_batch(migration.down) {
            Ok(()) => {
                let previous = current_version - 1;
                self.settings.set(SCHEMA_VERSION_KEY, &previous.to_string())?;
                report.to_version = previous;
                report.steps.push(MigrationStep {
                    version: current_version,
                    status: StepStatus::Success,
                    message: format!("Rolled back: {}", migration.description),
                });
                log::warn!("Rolled back migration {}", current_version);
            }
            Err(e) => {
                report.status = MigrationStatus::Halted;
                report.steps.push(MigrationStep {
                    version: current_version,
                    status: StepStatus::Error,
                    message: e.to_string(),
                });
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MemorySettings, SqliteSettings};

    const CREATE_A: &str = "CREATE TABLE IF NOT EXISTS a (id INTEGER PRIMARY KEY);";
    const CREATE_B: &str = "CREATE TABLE IF NOT EXISTS b (id INTEGER PRIMARY KEY);";
    const CREATE_C: &str = "CREATE TABLE IF NOT EXISTS c (id INTEGER PRIMARY KEY);";
    const BROKEN: &str = "CREATE TABLE broken (";

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    fn step(version: u32, up: &'static str) -> Migration {
        Migration {
            version,
            description: "test step",
            up,
            down: "",
        }
    }

    #[test]
    fn test_default_registry_applies_all() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = SqliteSettings::open(&conn).unwrap();
        let runner = MigrationRunner::new(&conn, &settings);

        assert!(runner.pending().unwrap());
        let report = runner.migrate().unwrap();

        assert_eq!(report.status, MigrationStatus::Migrated);
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, MIGRATIONS.len() as u32);
        assert_eq!(runner.current_version().unwrap(), MIGRATIONS.len() as u32);
        assert!(!runner.pending().unwrap());

        for table in ["doctors", "specialties", "arrangements", "import_logs", "import_rows", "ai_mappings"] {
            assert!(table_exists(&conn, table), "{} should exist", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = SqliteSettings::open(&conn).unwrap();
        let runner = MigrationRunner::new(&conn, &settings);

        runner.migrate().unwrap();
        let second = runner.migrate().unwrap();
        assert_eq!(second.status, MigrationStatus::UpToDate);
        assert!(second.steps.is_empty());
    }

    #[test]
    fn test_up_steps_reapply_over_partial_schema() {
        let conn = Connection::open_in_memory().unwrap();
        // Simulate a crash after DDL but before the counter bump
        for migration in MIGRATIONS {
            conn.execute_batch(migration.up).unwrap();
        }
        let settings = SqliteSettings::open(&conn).unwrap();
        let report = MigrationRunner::new(&conn, &settings).migrate().unwrap();
        assert_eq!(report.status, MigrationStatus::Migrated);
        assert_eq!(report.applied(), vec![1, 2]);
    }

    #[test]
    fn test_failure_halts_at_previous_version() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = MemorySettings::new();
        let registry = [step(1, CREATE_A), step(2, BROKEN), step(3, CREATE_C)];
        let runner = MigrationRunner::with_registry(&conn, &settings, &registry);

        let report = runner.migrate().unwrap();

        assert_eq!(report.status, MigrationStatus::Halted);
        assert_eq!(report.applied(), vec![1]);
        let failure = report.failure().unwrap();
        assert_eq!(failure.version, 2);
        assert!(failure.message.contains("Migration 2 failed"));
        assert_eq!(runner.current_version().unwrap(), 1);
        assert!(runner.pending().unwrap());
        assert!(!table_exists(&conn, "c"), "steps after the failure must not run");
    }

    #[test]
    fn test_resumes_after_fix() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = MemorySettings::new();

        let broken = [step(1, CREATE_A), step(2, BROKEN)];
        MigrationRunner::with_registry(&conn, &settings, &broken).migrate().unwrap();

        let fixed = [step(1, CREATE_A), step(2, CREATE_B)];
        let runner = MigrationRunner::with_registry(&conn, &settings, &fixed);
        let report = runner.migrate().unwrap();

        assert_eq!(report.from_version, 1);
        assert_eq!(report.applied(), vec![2]);
        assert_eq!(runner.current_version().unwrap(), 2);
    }

    #[test]
    fn test_gap_in_registry_stops_without_skipping() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = MemorySettings::new();
        let registry = [step(1, CREATE_A), step(3, CREATE_C)];
        let runner = MigrationRunner::with_registry(&conn, &settings, &registry);

        let report = runner.migrate().unwrap();

        assert_eq!(report.status, MigrationStatus::Halted);
        let failure = report.failure().unwrap();
        assert_eq!(failure.version, 2);
        assert_eq!(failure.message, "Migration 2 is not registered");
        assert_eq!(runner.current_version().unwrap(), 1);
        assert!(!table_exists(&conn, "c"));
    }

    #[test]
    fn test_empty_up_reports_definition_missing() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = MemorySettings::new();
        let registry = [step(1, "   ")];
        let report = MigrationRunner::with_registry(&conn, &settings, &registry)
            .migrate()
            .unwrap();
        assert_eq!(report.status, MigrationStatus::Halted);
        assert_eq!(report.failure().unwrap().message, "Migration 1 is registered without an up step");
    }

    #[test]
    fn test_refuses_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = MemorySettings::new();
        settings.set(SCHEMA_VERSION_KEY, "99").unwrap();
        let err = MigrationRunner::new(&conn, &settings).migrate().unwrap_err();
        assert!(matches!(err, DocrateError::SchemaAhead { current: 99, .. }));
    }

    #[test]
    fn test_unreadable_version_is_not_treated_as_zero() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = MemorySettings::new();
        settings.set(SCHEMA_VERSION_KEY, "two").unwrap();
        let runner = MigrationRunner::new(&conn, &settings);

        let err = runner.migrate().unwrap_err();
        assert_eq!(err.code(), "config_error");
        // Nothing ran from v1
        assert!(!table_exists(&conn, "doctors"));
        assert_eq!(settings.get(SCHEMA_VERSION_KEY).unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_rollback_last() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = SqliteSettings::open(&conn).unwrap();
        let runner = MigrationRunner::new(&conn, &settings);
        runner.migrate().unwrap();

        let report = runner.rollback_last().unwrap();
        assert_eq!(report.to_version, 1);
        assert_eq!(runner.current_version().unwrap(), 1);
        assert!(runner.pending().unwrap());

        // Rolling forward again re-applies only version 2
        let report = runner.migrate().unwrap();
        assert_eq!(report.applied(), vec![2]);
    }
}
