// Docrate Constants
// Settings keys and table names are part of the stored contract. Do not rename.

// Settings store keys
pub const SCHEMA_VERSION_KEY: &str = "docrate_db_version";
pub const IMPORT_LOCK_KEY: &str = "docrate_import_lock";

// Import lock
pub const DEFAULT_LOCK_TTL_SECONDS: i64 = 1800; // 30 minutes
pub const LOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const UNKNOWN_LOCK_SOURCE: &str = "unknown";

// Paths
pub const DOCRATE_FOLDER: &str = ".docrate";
pub const DB_FILENAME: &str = "docrate.db";
pub const SECRETS_SUBFOLDER: &str = "private";
pub const SECRETS_FILENAME: &str = "docrate-secrets.json";
pub const SECRETS_FILE_ENV: &str = "DOCRATE_SECRETS_FILE";

// Config keys
pub const CONFIG_ENVIRONMENT: &str = "environment";
pub const CONFIG_DATABASE_PATH: &str = "database_path";
pub const CONFIG_LOCK_TTL: &str = "import_lock_ttl_seconds";
pub const DEFAULT_ENVIRONMENT: &str = "production";

// Parsing defaults
pub const DEFAULT_HEADER_ROW: usize = 1;
pub const DEFAULT_QUOTE: u8 = b'"';

// Delimited text extensions and their default delimiters
pub const DELIMITED_EXTENSIONS: [(&str, u8); 3] = [("csv", b','), ("tsv", b'\t'), ("txt", b',')];

// Workbook extensions (xlsx/xls and friends)
pub const WORKBOOK_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xlsb", "xls", "ods"];

// Phone masking
pub const PHONE_MASK: &str = "***";
pub const PHONE_MASK_MIN_DIGITS: usize = 7;

// Import runs
pub const RUN_STATUS_PENDING: &str = "pending";
pub const RUN_STATUS_RUNNING: &str = "running";
pub const RUN_STATUS_COMPLETED: &str = "completed";
pub const RUN_STATUS_FAILED: &str = "failed";

// Import rows
pub const ROW_STATUS_SUCCESS: &str = "success";
pub const ROW_STATUS_ERROR: &str = "error";
pub const ROW_STATUS_SKIPPED: &str = "skipped";
pub const ROW_ERROR_MAX_LEN: usize = 500;

// Mapping types stored in ai_mappings
pub const MAPPING_TYPE_SPECIALTY: &str = "specialty";
pub const MAPPING_TYPES: [&str; 3] = [MAPPING_TYPE_SPECIALTY, "city", "company"];
