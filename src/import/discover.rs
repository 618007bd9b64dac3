// Import file discovery

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{DocrateError, Result};
use crate::parser::FormatRegistry;

/// Files to import for a path. A single file is returned as-is so the
/// parser can report on it; a directory yields every supported file inside.
pub fn discover_import_files(source_path: &Path, registry: &FormatRegistry) -> Result<Vec<PathBuf>> {
    if source_path.is_file() {
        return Ok(vec![source_path.to_path_buf()]);
    }

    if !source_path.is_dir() {
        return Err(DocrateError::FileNotFound(source_path.display().to_string()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source_path)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.is_file() && !is_scratch_file(path) && registry.supports(path) {
            files.push(path.to_path_buf());
        }
    }

    // Sort by path for consistent ordering
    files.sort();

    Ok(files)
}

/// Hidden files and office lock files ("~$doctors.xlsx").
fn is_scratch_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') || n.starts_with("~$"))
        .unwrap_or(false)
}
