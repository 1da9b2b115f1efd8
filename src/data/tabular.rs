//! In-memory tables loaded from the cached reference datasets
//!
//! A [`Table`] is a header row plus string cells, immutable once loaded.
//! Searches run through a [`Selection`], a list of row indices narrowed by
//! chained filters and finally paginated into JSON records.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;

use super::timestamp::parse_date_string;

/// Errors that can occur when loading or filtering a table
#[derive(Debug, Error)]
pub enum TableError {
    /// Filter names a column the table does not have
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// Date filter value is not `dd/mm/yyyy`
    #[error("Invalid date '{0}', expected dd/mm/yyyy")]
    InvalidDate(String),

    /// CSV could not be read
    #[error("Failed to read CSV: {0}")]
    Csv(#[from] csv::Error),

    /// Spreadsheet could not be read
    #[error("Failed to read spreadsheet: {0}")]
    Spreadsheet(String),
}

/// A header row plus string rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Reads a CSV file with a header row
    ///
    /// Rows may have fewer or more fields than the header; bytes that are not
    /// valid UTF-8 are replaced.
    pub fn load_csv(path: &Path) -> Result<Self, TableError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        Self::from_csv_reader(reader)
    }

    /// Reads CSV from memory, same rules as [`Table::load_csv`]
    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self, TableError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);
        Self::from_csv_reader(reader)
    }

    fn from_csv_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, TableError> {
        let headers = reader
            .byte_headers()?
            .iter()
            .map(|field| lossy(field).trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.byte_records() {
            let record = record?;
            rows.push(record.iter().map(|field| lossy(field).trim().to_string()).collect());
        }
        Ok(Self { headers, rows })
    }

    /// Reads the first sheet of a spreadsheet (xls, xlsx, ods)
    ///
    /// The first row is the header. Whole-number floats are written without
    /// a fractional part so codes keep their textual form.
    pub fn load_spreadsheet(path: &Path) -> Result<Self, TableError> {
        let mut workbook =
            open_workbook_auto(path).map_err(|e| TableError::Spreadsheet(e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| TableError::Spreadsheet("workbook has no sheets".to_string()))?
            .map_err(|e| TableError::Spreadsheet(e.to_string()))?;

        let mut rows = range.rows();
        let headers = rows
            .next()
            .map(|row| row.iter().map(cell_text).collect())
            .unwrap_or_default();
        let rows = rows.map(|row| row.iter().map(cell_text).collect()).collect();
        Ok(Self { headers, rows })
    }

    /// Index of a column by exact header name
    pub fn column(&self, name: &str) -> Result<usize, TableError> {
        self.headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Starts a selection over every row
    pub fn select(&self) -> Selection<'_> {
        Selection {
            table: self,
            rows: (0..self.rows.len()).collect(),
        }
    }

    fn cell(&self, row: usize, column: usize) -> &str {
        self.rows[row].get(column).map(String::as_str).unwrap_or("")
    }

    /// A row as a JSON object keyed by header; blank cells become `null`
    fn record(&self, row: usize) -> Map<String, Value> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let cell = self.cell(row, i);
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (header.clone(), value)
            })
            .collect()
    }
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Rows of a table that survived the filters applied so far
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    table: &'a Table,
    rows: Vec<usize>,
}

impl<'a> Selection<'a> {
    fn retain_by<F>(mut self, column: &str, mut keep: F) -> Result<Self, TableError>
    where
        F: FnMut(&str) -> bool,
    {
        let column = self.table.column(column)?;
        let table = self.table;
        self.rows.retain(|&row| keep(table.cell(row, column)));
        Ok(self)
    }

    /// Keeps rows whose cell equals `value`
    pub fn exact(self, column: &str, value: &str) -> Result<Self, TableError> {
        let value = value.trim();
        self.retain_by(column, |cell| cell == value)
    }

    /// Keeps rows whose cell contains `value`, ignoring case
    pub fn contains(self, column: &str, value: &str) -> Result<Self, TableError> {
        let needle = value.trim().to_lowercase();
        self.retain_by(column, |cell| cell.to_lowercase().contains(&needle))
    }

    /// Keeps rows whose cell is `"SI"` (for `true`) or `"NO"` (for `false`)
    pub fn flag(self, column: &str, flag: bool) -> Result<Self, TableError> {
        let wanted = if flag { "SI" } else { "NO" };
        self.retain_by(column, |cell| cell == wanted)
    }

    /// Keeps rows whose numeric cell lies within the inclusive bounds
    ///
    /// Cells accept a decimal comma. With any bound set, cells that do not
    /// parse as numbers are dropped.
    pub fn numeric_range(
        self,
        column: &str,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<Self, TableError> {
        if min.is_none() && max.is_none() {
            self.table.column(column)?;
            return Ok(self);
        }
        self.retain_by(column, |cell| match parse_number(cell) {
            Some(n) => min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m),
            None => false,
        })
    }

    /// Keeps rows whose date cell lies within the inclusive bounds
    ///
    /// Bounds are `dd/mm/yyyy`; cells are read day-first. With any bound set,
    /// cells that do not parse as dates are dropped.
    pub fn date_range(
        self,
        column: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Self, TableError> {
        let from = from.map(parse_query_date).transpose()?;
        let to = to.map(parse_query_date).transpose()?;
        if from.is_none() && to.is_none() {
            self.table.column(column)?;
            return Ok(self);
        }
        self.retain_by(column, |cell| match parse_cell_date(cell) {
            Some(date) => from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t),
            None => false,
        })
    }

    /// Keeps rows whose cell contains `query` ignoring case and accents,
    /// followed by rows whose cell is close to it
    ///
    /// Closeness is the normalized Levenshtein similarity of the folded texts,
    /// at least [`SIMILARITY_CUTOFF`]. Only the `close_matches` most similar
    /// names are added; substring hits keep table order and come first.
    pub fn name_matches(
        mut self,
        column: &str,
        query: &str,
        close_matches: usize,
    ) -> Result<Self, TableError> {
        let col = self.table.column(column)?;
        let needle = fold(query.trim());
        let folded: Vec<(usize, String)> = self
            .rows
            .iter()
            .map(|&row| (row, fold(self.table.cell(row, col))))
            .collect();

        let mut kept: Vec<usize> = folded
            .iter()
            .filter(|(_, name)| name.contains(&needle))
            .map(|(row, _)| *row)
            .collect();

        let mut scored: Vec<(f64, &str)> = folded
            .iter()
            .map(|(_, name)| (strsim::normalized_levenshtein(&needle, name), name.as_str()))
            .filter(|(score, _)| *score >= SIMILARITY_CUTOFF)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        let close: Vec<&str> = scored
            .into_iter()
            .take(close_matches)
            .map(|(_, name)| name)
            .collect();
        let extra: Vec<usize> = folded
            .iter()
            .filter(|(row, name)| close.contains(&name.as_str()) && !kept.contains(row))
            .map(|(row, _)| *row)
            .collect();

        kept.extend(extra);
        self.rows = kept;
        Ok(self)
    }

    /// Number of rows selected
    pub fn total(&self) -> usize {
        self.rows.len()
    }

    /// Returns page `page` (1-based) of `page_size` rows as JSON records
    ///
    /// Pages past the end are empty; page 0 is treated as page 1.
    pub fn page(&self, page: usize, page_size: usize) -> Vec<Map<String, Value>> {
        let start = page.saturating_sub(1).saturating_mul(page_size);
        self.rows
            .iter()
            .skip(start)
            .take(page_size)
            .map(|&row| self.table.record(row))
            .collect()
    }
}

fn parse_number(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    cell.replace(',', ".").parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_query_date(text: &str) -> Result<NaiveDate, TableError> {
    NaiveDate::parse_from_str(text.trim(), "%d/%m/%Y")
        .map_err(|_| TableError::InvalidDate(text.to_string()))
}

fn parse_cell_date(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    parse_date_string(cell).map(|dt| dt.date_naive())
}

/// Lowest similarity, from 0 to 1, for a name to count as a near match
pub const SIMILARITY_CUTOFF: f64 = 0.7;

/// Lowercases and removes diacritics from Latin letters
pub fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            'ý' | 'ÿ' => 'y',
            other => other,
        })
        .collect()
}
