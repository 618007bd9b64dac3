// Workbook reader (xlsx, xlsm, xlsb, xls, ods)
// Decoding needs the `workbook` feature. Without it the extensions are still
// claimed so callers get LibraryMissing instead of UnsupportedFormat.

use std::path::Path;

use super::{FormatReader, GridRow, ParseOptions, SourceKind};
use crate::error::Result;

pub struct WorkbookReader {
    extensions: Vec<&'static str>,
}

impl WorkbookReader {
    pub fn new(extensions: &[&'static str]) -> Self {
        Self { extensions: extensions.to_vec() }
    }
}

impl FormatReader for WorkbookReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Workbook
    }

    fn extensions(&self) -> Vec<&'static str> {
        self.extensions.clone()
    }

    fn read_grid(&self, path: &Path, options: &ParseOptions) -> Result<Vec<GridRow>> {
        read_sheet(path, options.sheet_index)
    }
}

#[cfg(feature = "workbook")]
fn read_sheet(path: &Path, sheet_index: usize) -> Result<Vec<GridRow>> {
    use crate::error::{panic_message, DocrateError};

    // Malformed archives can panic inside the decoder; surface them as parse errors
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        decode_sheet(path, sheet_index)
    }));

    match result {
        Ok(Ok(grid)) => Ok(grid),
        Ok(Err(message)) => Err(DocrateError::ParseError(format!(
            "Failed to parse workbook {}: {}",
            path.display(),
            message
        ))),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::error!("Workbook decoder panicked on {}: {}", path.display(), message);
            Err(DocrateError::ParseError(format!(
                "Failed to parse workbook {}: {}",
                path.display(),
                message
            )))
        }
    }
}

#[cfg(feature = "workbook")]
fn decode_sheet(path: &Path, sheet_index: usize) -> std::result::Result<Vec<GridRow>, String> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook = open_workbook_auto(path).map_err(|e| e.to_string())?;
    let sheet_count = workbook.sheet_names().len();

    let range = workbook
        .worksheet_range_at(sheet_index)
        .ok_or_else(|| format!("sheet index {} out of range ({} sheets)", sheet_index, sheet_count))?
        .map_err(|e| e.to_string())?;

    // Ranges start at the first used cell, not at A1
    let (first_row, first_col) = match range.start() {
        Some((row, col)) => (row as usize, col as usize),
        None => return Ok(Vec::new()),
    };

    let grid = range
        .rows()
        .enumerate()
        .map(|(idx, cells)| {
            let mut row = vec![String::new(); first_col];
            row.extend(cells.iter().map(|cell| cell.to_string()));
            GridRow {
                number: first_row + idx + 1,
                cells: row,
            }
        })
        .collect();

    Ok(grid)
}

#[cfg(not(feature = "workbook"))]
fn read_sheet(path: &Path, _sheet_index: usize) -> Result<Vec<GridRow>> {
    Err(crate::error::DocrateError::LibraryMissing(format!(
        "Workbook support is not compiled in; rebuild with the `workbook` feature to read {}",
        path.display()
    )))
}
