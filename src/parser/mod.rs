// Import file parsing
// Turns one insurer file into header-tagged rows. Readers only produce a grid
// of cells with their true file row numbers; header handling and blank-row
// filtering are shared here.

pub mod delimited;
pub mod mapping;
pub mod workbook;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use serde::Serialize;

use crate::constants::{DEFAULT_HEADER_ROW, DEFAULT_QUOTE, DELIMITED_EXTENSIONS, WORKBOOK_EXTENSIONS};
use crate::error::{DocrateError, Result};

pub use mapping::{detect_column_mapping, CanonicalField, ColumnMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    DelimitedText,
    Workbook,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Field delimiter. `None` uses the reader's default for the extension.
    pub delimiter: Option<u8>,
    pub quote: u8,
    /// 1-based row holding the column headers.
    pub header_row: usize,
    /// 0-based sheet, workbooks only.
    pub sheet_index: usize,
    pub skip_empty: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            quote: DEFAULT_QUOTE,
            header_row: DEFAULT_HEADER_ROW,
            sheet_index: 0,
            skip_empty: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedRow {
    /// 1-based row number in the source file.
    pub row_number: usize,
    /// Header -> raw cell value.
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedFile {
    pub headers: Vec<String>,
    pub rows: Vec<ParsedRow>,
    pub file: PathBuf,
    pub kind: SourceKind,
}

impl ParsedFile {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    /// File name without directories, as stored on import runs.
    pub fn file_name(&self) -> String {
        file_name(&self.file)
    }
}

/// One physical row read by a format reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridRow {
    pub number: usize,
    pub cells: Vec<String>,
}

pub trait FormatReader: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Lower-case extensions this reader claims.
    fn extensions(&self) -> Vec<&'static str>;

    /// Read every non-skipped physical row of the file.
    fn read_grid(&self, path: &Path, options: &ParseOptions) -> Result<Vec<GridRow>>;
}

/// Extension-dispatched set of readers.
pub struct FormatRegistry {
    readers: Vec<Box<dyn FormatReader>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (ext, delimiter) in DELIMITED_EXTENSIONS {
            registry.register(Box::new(delimited::DelimitedReader::new(ext, delimiter)));
        }
        registry.register(Box::new(workbook::WorkbookReader::new(&WORKBOOK_EXTENSIONS)));
        registry
    }
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self { readers: Vec::new() }
    }

    /// Later registrations win for an extension already claimed.
    pub fn register(&mut self, reader: Box<dyn FormatReader>) {
        self.readers.insert(0, reader);
    }

    pub fn reader_for(&self, extension: &str) -> Option<&dyn FormatReader> {
        let extension = extension.to_lowercase();
        self.readers
            .iter()
            .find(|r| r.extensions().contains(&extension.as_str()))
            .map(|r| r.as_ref())
    }

    pub fn supports(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.reader_for(&ext).is_some())
            .unwrap_or(false)
    }

    /// All claimed extensions, sorted.
    pub fn extensions(&self) -> Vec<&'static str> {
        let mut all: Vec<&'static str> = self.readers.iter().flat_map(|r| r.extensions()).collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    pub fn parse(&self, path: &Path, options: &ParseOptions) -> Result<ParsedFile> {
        if !path.is_file() {
            return Err(DocrateError::FileNotFound(path.display().to_string()));
        }

        let extension = extension_of(path).unwrap_or_default();
        let reader = self
            .reader_for(&extension)
            .ok_or_else(|| DocrateError::UnsupportedFormat(extension.clone()))?;

        let grid = reader.read_grid(path, options)?;
        let (headers, rows) = extract_rows(grid, options, reader.kind());

        log::debug!(
            "Parsed {} ({:?}): {} headers, {} rows",
            path.display(),
            reader.kind(),
            headers.len(),
            rows.len()
        );

        Ok(ParsedFile {
            headers,
            rows,
            file: path.to_path_buf(),
            kind: reader.kind(),
        })
    }
}

/// Parse with the default registry.
pub fn parse(path: &Path, options: &ParseOptions) -> Result<ParsedFile> {
    FormatRegistry::default().parse(path, options)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn is_blank_row(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

/// Split a grid into headers and data rows.
///
/// The header is the first non-empty row at or after `header_row`; anything before it
/// is dropped. Workbook columns with a blank header produce no field, while
/// delimited text keeps them positionally (keyed by the empty header).
fn extract_rows(grid: Vec<GridRow>, options: &ParseOptions, kind: SourceKind) -> (Vec<String>, Vec<ParsedRow>) {
    let header_row = options.header_row.max(1);
    // Empty lines never serve as the header
    let mut grid = grid
        .into_iter()
        .skip_while(|r| r.number < header_row || r.cells.is_empty());

    let Some(header) = grid.next() else {
        return (Vec::new(), Vec::new());
    };
    let headers: Vec<String> = header.cells.iter().map(|h| h.trim().to_string()).collect();

    let rows = grid
        .filter(|row| !(options.skip_empty && is_blank_row(&row.cells)))
        .map(|row| {
            let fields = headers
                .iter()
                .enumerate()
                .filter(|(_, h)| kind == SourceKind::DelimitedText || !h.is_empty())
                .map(|(idx, h)| (h.clone(), row.cells.get(idx).cloned().unwrap_or_default()))
                .collect();
            ParsedRow {
                row_number: row.number,
                fields,
            }
        })
        .collect();

    (headers, rows)
}
