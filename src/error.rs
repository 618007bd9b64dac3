// Docrate Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocrateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ----- File intake -----

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    LibraryMissing(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ----- Concurrency -----

    #[error("{message}")]
    AlreadyLocked { message: String },

    #[error("Failed to acquire import lock: {0}")]
    LockFailed(String),

    // ----- Schema -----

    #[error("Migration {0} is not registered")]
    MigrationMissing(u32),

    #[error("Migration {0} is registered without an up step")]
    MigrationDefinitionMissing(u32),

    #[error("Migration {version} failed: {message}")]
    MigrationFailed { version: u32, message: String },

    #[error("Database schema version {current} is newer than this build supports (max {supported})")]
    SchemaAhead { current: u32, supported: u32 },

    // ----- Import runs -----

    #[error("Row error: {0}")]
    Row(String),

    #[error("Import run {run_id} aborted: {message}")]
    RunAborted { run_id: i64, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl DocrateError {
    /// Stable machine-readable code, used for per-file batch reports.
    pub fn code(&self) -> &'static str {
        match self {
            DocrateError::Database(_) => "database_error",
            DocrateError::Io(_) => "io_error",
            DocrateError::Json(_) => "json_error",
            DocrateError::FileNotFound(_) => "file_not_found",
            DocrateError::UnsupportedFormat(_) => "unsupported_format",
            DocrateError::LibraryMissing(_) => "library_missing",
            DocrateError::ParseError(_) => "parse_error",
            DocrateError::AlreadyLocked { .. } => "import_locked",
            DocrateError::LockFailed(_) => "lock_failed",
            DocrateError::MigrationMissing(_) => "migration_missing",
            DocrateError::MigrationDefinitionMissing(_) => "migration_definition_missing",
            DocrateError::MigrationFailed { .. } => "migration_failed",
            DocrateError::SchemaAhead { .. } => "schema_ahead",
            DocrateError::Row(_) => "row_error",
            DocrateError::RunAborted { .. } => "run_aborted",
            DocrateError::Config(_) => "config_error",
            DocrateError::NotFound(_) => "not_found",
            DocrateError::Other(_) => "error",
        }
    }

    /// Intake failures are reported per file and never abort a batch.
    pub fn is_intake(&self) -> bool {
        matches!(
            self,
            DocrateError::FileNotFound(_)
                | DocrateError::UnsupportedFormat(_)
                | DocrateError::LibraryMissing(_)
                | DocrateError::ParseError(_)
        )
    }
}

impl From<anyhow::Error> for DocrateError {
    fn from(err: anyhow::Error) -> Self {
        DocrateError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DocrateError>;

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
