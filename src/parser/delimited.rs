// Delimited text reader (csv, tsv, txt)

use std::borrow::Cow;
use std::path::Path;
use chardetng::EncodingDetector;

use super::{FormatReader, GridRow, ParseOptions, SourceKind};
use crate::error::{DocrateError, Result};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub struct DelimitedReader {
    extension: &'static str,
    default_delimiter: u8,
}

impl DelimitedReader {
    pub fn new(extension: &'static str, default_delimiter: u8) -> Self {
        Self { extension, default_delimiter }
    }
}

impl FormatReader for DelimitedReader {
    fn kind(&self) -> SourceKind {
        SourceKind::DelimitedText
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec![self.extension]
    }

    fn read_grid(&self, path: &Path, options: &ParseOptions) -> Result<Vec<GridRow>> {
        let bytes = std::fs::read(path)?;
        let content = decode(&bytes, path);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(options.delimiter.unwrap_or(self.default_delimiter))
            .quote(options.quote)
            .has_headers(false)
            .flexible(true)
            .from_reader(content.as_bytes());

        // The csv reader drops empty lines without counting them, so line
        // numbers come from byte offsets into the decoded text.
        let lines = LineIndex::new(&content);
        let mut grid = Vec::new();
        let mut record = csv::StringRecord::new();
        let mut last_line = 0;

        loop {
            let before = reader.position().byte() as usize;
            let more = reader.read_record(&mut record).map_err(|e| {
                DocrateError::ParseError(format!("{}: {}", path.display(), e))
            })?;
            if !more {
                break;
            }

            // Record positions point at the end of the previous record, ahead
            // of any line terminators the reader skipped.
            let skipped_from = record.position().map(|p| p.byte() as usize).unwrap_or(before);
            let start = skipped_from
                + content.as_bytes()[skipped_from.min(content.len())..]
                    .iter()
                    .take_while(|b| matches!(b, b'\r' | b'\n'))
                    .count();
            // Multi-line quoted cells keep the line the record starts on
            let number = lines.line_at(start);
            push_empty_lines(&mut grid, last_line + 1, number);
            grid.push(GridRow {
                number,
                cells: record.iter().map(|c| c.to_string()).collect(),
            });

            let end = reader.position().byte() as usize;
            last_line = lines.line_at(end.saturating_sub(1)).max(number);
        }
        push_empty_lines(&mut grid, last_line + 1, lines.count() + 1);

        Ok(grid)
    }
}

/// Offsets of every `\n`, for mapping byte positions to 1-based lines.
struct LineIndex {
    newlines: Vec<usize>,
    len: usize,
}

impl LineIndex {
    fn new(content: &str) -> Self {
        Self {
            newlines: content.bytes().enumerate().filter(|(_, b)| *b == b'\n').map(|(i, _)| i).collect(),
            len: content.len(),
        }
    }

    fn line_at(&self, byte: usize) -> usize {
        self.newlines.partition_point(|&n| n < byte) + 1
    }

    /// Physical lines; a final terminator does not open a new line.
    fn count(&self) -> usize {
        match self.newlines.last() {
            _ if self.len == 0 => 0,
            Some(&last) if last + 1 == self.len => self.newlines.len(),
            _ => self.newlines.len() + 1,
        }
    }
}

/// Lines the csv reader skipped between records are empty; keep them as
/// cell-less rows so `skip_empty` decides.
fn push_empty_lines(grid: &mut Vec<GridRow>, from: usize, until: usize) {
    grid.extend((from..until).map(|number| GridRow { number, cells: Vec::new() }));
}

/// UTF-8 (BOM stripped) when valid, otherwise the detected legacy encoding.
fn decode<'a>(bytes: &'a [u8], path: &Path) -> Cow<'a, str> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    // Insurer files come from Israeli systems; hint the Hebrew code pages
    let encoding = detector.guess(Some(b"il"), true);

    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        log::warn!(
            "Decoding errors occurred while reading {} with encoding {}",
            path.display(),
            encoding.name()
        );
    } else {
        log::debug!("Decoded {} as {}", path.display(), encoding.name());
    }

    decoded
}
