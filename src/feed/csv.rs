use crate::normalize::RawRecord;
use ::csv::{ReaderBuilder, StringRecord};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsvError {
    #[error("missing header row")]
    MissingHeader,
    #[error("malformed csv near line {line}: {message}")]
    Malformed { line: u64, message: String },
}

impl From<::csv::Error> for CsvError {
    fn from(err: ::csv::Error) -> Self {
        CsvError::Malformed {
            line: err.position().map_or(0, |p| p.line()),
            message: err.to_string(),
        }
    }
}

/// Parses a header-led delimited document into records keyed by lowercased column name.
///
/// Quoted fields may contain commas, doubled quotes and line breaks. Blank lines are
/// skipped; a short row simply lacks the trailing columns.
pub fn parse_records(body: &str) -> Result<Vec<RawRecord>, CsvError> {
    let body = body.strip_prefix('\u{feff}').unwrap_or(body);
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());
    let mut rows = reader
        .records()
        .filter(|row| !matches!(row, Ok(r) if is_blank(r)));

    let header: Vec<String> = match rows.next() {
        Some(row) => row?
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect(),
        None => return Err(CsvError::MissingHeader),
    };

    rows.map(|row| {
        let row = row?;
        Ok(header
            .iter()
            .zip(row.iter())
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect::<RawRecord>())
    })
    .collect()
}

fn is_blank(row: &StringRecord) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}
