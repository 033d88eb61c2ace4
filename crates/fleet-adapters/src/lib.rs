//! Spreadsheet access and row extraction for listing snapshots.

use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use fleet_core::{FieldMap, SchemaVariant, SnapshotRow};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "fleet-adapters";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to open workbook: {0}")]
    Workbook(String),
    #[error("failed to read csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported snapshot format: {0}")]
    UnsupportedFormat(String),
    #[error("no sheets found")]
    NoSheets,
    #[error("sheet not found: {0}")]
    MissingSheet(String),
    #[error("file must have at least header and one data row")]
    TooFewRows { rows: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    Excel,
    Csv,
}

impl SnapshotFormat {
    pub fn from_file_name(file_name: &str) -> Result<Self, SnapshotError> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(Self::Excel),
            "csv" => Ok(Self::Csv),
            _ => Err(SnapshotError::UnsupportedFormat(file_name.to_string())),
        }
    }
}

/// Read-only view of a parsed spreadsheet. Rows are ragged: trailing empty
/// cells may be absent.
pub trait SpreadsheetSource: Send + Sync {
    fn sheet_names(&self) -> Vec<String>;

    fn rows(&self, sheet: &str) -> Option<&[Vec<String>]>;

    /// 0-based `column` and `row`. Missing cells read as `None`.
    fn cell(&self, sheet: &str, column: usize, row: usize) -> Option<&str> {
        self.rows(sheet)?
            .get(row)?
            .get(column)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

/// A whole workbook materialized as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        self.sheets.push(Sheet {
            name: name.into(),
            rows,
        });
        self
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn from_bytes(bytes: &[u8], format: SnapshotFormat) -> Result<Self, SnapshotError> {
        match format {
            SnapshotFormat::Excel => Self::from_excel_bytes(bytes),
            SnapshotFormat::Csv => Self::from_csv_bytes(bytes),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let name = path.to_string_lossy();
        let format = SnapshotFormat::from_file_name(&name)?;
        let bytes = std::fs::read(path).map_err(|source| SnapshotError::Io {
            path: name.to_string(),
            source,
        })?;
        Self::from_bytes(&bytes, format)
    }

    pub fn from_excel_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| SnapshotError::Workbook(e.to_string()))?;

        let mut out = Workbook::new();
        for name in workbook.sheet_names().to_owned() {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| SnapshotError::Workbook(format!("{name}: {e}")))?;

            // The range begins at the first used cell; pad back to A1 so
            // positions match column letters.
            let (row_offset, col_offset) = range
                .start()
                .map(|(r, c)| (r as usize, c as usize))
                .unwrap_or((0, 0));
            let mut rows = vec![Vec::new(); row_offset];
            for raw in range.rows() {
                let mut row = vec![String::new(); col_offset];
                row.extend(raw.iter().map(cell_text));
                while row.last().is_some_and(|c| c.is_empty()) {
                    row.pop();
                }
                rows.push(row);
            }
            debug!(sheet = %name, rows = rows.len(), "loaded worksheet");
            out.sheets.push(Sheet { name, rows });
        }
        Ok(out)
    }

    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Workbook::new().with_sheet("Sheet1", rows))
    }
}

impl SpreadsheetSource for Workbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn rows(&self, sheet: &str) -> Option<&[Vec<String>]> {
        self.sheets
            .iter()
            .find(|s| s.name == sheet)
            .map(|s| s.rows.as_slice())
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds a snapshot row from one raw data row. Cells past the end of a
/// ragged row read as empty strings; key and status are taken byte-exact.
pub fn extract_row(variant: &SchemaVariant, row_number: usize, cells: &[String]) -> SnapshotRow {
    let at = |idx: usize| cells.get(idx).map(String::as_str).unwrap_or("");

    let fields: FieldMap = variant
        .columns()
        .iter()
        .map(|(name, idx)| (name.to_string(), at(idx).to_string()))
        .collect();

    let rule = variant.status_rule();
    let raw_status = rule.column.map(|idx| at(idx)).unwrap_or("");
    let status = match (&rule.default, raw_status.is_empty()) {
        (Some(default), true) => default.clone(),
        _ => raw_status.to_string(),
    };

    let photos = variant
        .photo_columns()
        .iter()
        .map(|&idx| at(idx).trim())
        .filter(|link| !link.is_empty())
        .map(str::to_string)
        .collect();

    SnapshotRow {
        row_number,
        key: at(variant.key_column()).to_string(),
        status,
        fields,
        photos,
    }
}

/// Extracts every data row (header skipped) of the first sheet.
pub fn parse_snapshot(
    source: &dyn SpreadsheetSource,
    variant: &SchemaVariant,
) -> Result<Vec<SnapshotRow>, SnapshotError> {
    let sheet = source
        .sheet_names()
        .into_iter()
        .next()
        .ok_or(SnapshotError::NoSheets)?;
    let rows = source
        .rows(&sheet)
        .ok_or_else(|| SnapshotError::MissingSheet(sheet.clone()))?;
    if rows.len() < 2 {
        return Err(SnapshotError::TooFewRows { rows: rows.len() });
    }
    Ok(rows
        .iter()
        .enumerate()
        .skip(1)
        .map(|(idx, cells)| extract_row(variant, idx + 1, cells))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::VariantRegistry;

    fn cells(values: &[(usize, &str)]) -> Vec<String> {
        let width = values.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
        let mut row = vec![String::new(); width];
        for (i, v) in values {
            row[*i] = v.to_string();
        }
        row
    }

    #[test]
    fn extract_row_reads_mapped_columns() {
        let registry = VariantRegistry::builtin().unwrap();
        let v1 = registry.get("v1").unwrap();
        let row = cells(&[
            (1, "Toyota Camry"),
            (6, "VIN1"),
            (16, "1 000 000"),
            (39, "В продаже"),
        ]);

        let extracted = extract_row(&v1, 2, &row);
        assert_eq!(extracted.key, "VIN1");
        assert_eq!(extracted.status, "В продаже");
        assert_eq!(extracted.fields["subject"], "Toyota Camry");
        assert_eq!(extracted.fields["approved_price"], "1 000 000");
        // Column AD lies beyond this ragged row.
        assert_eq!(extracted.fields["location"], "");
    }

    #[test]
    fn key_and_status_cells_are_not_trimmed() {
        let registry = VariantRegistry::builtin().unwrap();
        let v1 = registry.get("v1").unwrap();

        let padded = extract_row(&v1, 2, &cells(&[(6, " VIN1"), (39, " В продаже ")]));
        assert_eq!(padded.key, " VIN1");
        assert_eq!(padded.status, " В продаже ");
        assert!(!v1.is_accepted(&padded.status));

        let blank = extract_row(&v1, 3, &cells(&[(6, "   ")]));
        assert!(blank.has_key());
    }

    #[test]
    fn status_default_and_photo_columns_apply_for_v2() {
        let registry = VariantRegistry::builtin().unwrap();
        let v2 = registry.get("v2").unwrap();
        let row = cells(&[(3, "VIN2"), (10, "2500000"), (46, " https://a/1.jpg "), (44, "https://a/3.jpg")]);

        let extracted = extract_row(&v2, 5, &row);
        assert_eq!(extracted.row_number, 5);
        assert_eq!(extracted.status, "В продаже");
        // Declared order is AU, AT, AS, AR, AQ.
        assert_eq!(extracted.photos, vec!["https://a/1.jpg", "https://a/3.jpg"]);
    }

    #[test]
    fn parse_snapshot_requires_header_and_data_row() {
        let registry = VariantRegistry::builtin().unwrap();
        let v3 = registry.get("v3").unwrap();

        let empty = Workbook::new();
        assert!(matches!(parse_snapshot(&empty, &v3), Err(SnapshotError::NoSheets)));

        let header_only = Workbook::new().with_sheet("S", vec![vec!["h".into()]]);
        let err = parse_snapshot(&header_only, &v3).unwrap_err();
        assert_eq!(err.to_string(), "file must have at least header and one data row");

        let book = Workbook::new()
            .with_sheet("S", vec![vec!["h".into()], vec![], cells(&[(5, "VIN3")])])
            .with_sheet("ignored", vec![]);
        let rows = parse_snapshot(&book, &v3).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].has_key());
        assert_eq!(rows[1].key, "VIN3");
        assert_eq!(rows[1].row_number, 3);
    }

    #[test]
    fn csv_snapshots_load_as_a_single_ragged_sheet() {
        let book = Workbook::from_csv_bytes(b"a,b,c\n1,2\n\"x,y\",z,w,extra\n").unwrap();
        assert_eq!(book.sheet_names(), vec!["Sheet1"]);
        assert_eq!(book.cell("Sheet1", 0, 2), Some("x,y"));
        assert_eq!(book.cell("Sheet1", 2, 1), None);
        assert_eq!(book.cell("Sheet1", 3, 2), Some("extra"));
    }

    #[test]
    fn format_is_chosen_by_extension() {
        assert_eq!(SnapshotFormat::from_file_name("stock.XLSX").unwrap(), SnapshotFormat::Excel);
        assert_eq!(SnapshotFormat::from_file_name("stock.csv").unwrap(), SnapshotFormat::Csv);
        assert!(matches!(
            SnapshotFormat::from_file_name("stock.pdf"),
            Err(SnapshotError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn garbage_bytes_are_a_workbook_error() {
        let err = Workbook::from_excel_bytes(b"definitely not a spreadsheet").unwrap_err();
        assert!(matches!(err, SnapshotError::Workbook(_)));
    }

    #[test]
    fn open_reads_csv_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.csv");
        std::fs::write(&path, "h\nv\n").unwrap();
        let book = Workbook::open(&path).unwrap();
        assert_eq!(book.cell("Sheet1", 0, 1), Some("v"));
    }
}
