// Docrate - import pipeline library
//
// Insurer doctor directories (csv/tsv/xlsx/...) are parsed, sanitized and
// upserted into a versioned SQLite store, one locked run at a time.

pub mod clock;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod import;
pub mod parser;
pub mod sanitize;
pub mod settings;

pub use error::{DocrateError, Result};
