//! Delimited telemetry file parsing.
//!
//! A file is accepted only if every data row validates; the first bad row
//! rejects the whole object and no rows are returned.

use crate::config::CsvFormat;
use crate::record::{RecordError, TelemetryRecord};
use csv::{ReaderBuilder, Trim};
use thiserror::Error;

/// Why a file was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("file is not valid UTF-8 text: {0}")]
    Encoding(String),

    #[error("malformed delimited data at line {line}: {message}")]
    Malformed { line: u64, message: String },

    #[error("line {line}: {source}")]
    Record {
        line: u64,
        #[source]
        source: RecordError,
    },

    #[error("file contains no data rows")]
    EmptyFile,

    #[error("unsupported format: {0}")]
    Format(String),
}

impl ParseError {
    /// True for row-level validation failures, false for structural ones
    pub fn is_validation(&self) -> bool {
        matches!(self, ParseError::Record { .. } | ParseError::EmptyFile)
    }
}

/// Parse a whole telemetry file into validated records
pub fn parse_telemetry(bytes: &[u8], format: &CsvFormat) -> Result<Vec<TelemetryRecord>, ParseError> {
    let delimiter = format
        .delimiter_byte()
        .map_err(|e| ParseError::Format(e.to_string()))?;

    let text = std::str::from_utf8(bytes).map_err(|e| ParseError::Encoding(e.to_string()))?;

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(format.has_header)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();

    for row in reader.records() {
        let row = row.map_err(|e| ParseError::Malformed {
            line: e.position().map(|p| p.line()).unwrap_or_default(),
            message: e.to_string(),
        })?;

        let line = row.position().map(|p| p.line()).unwrap_or_default();

        // Whitespace-only line; a row of bare delimiters still validates
        if row.len() == 1 && row[0].is_empty() {
            continue;
        }

        let record = TelemetryRecord::from_row(&row, line, &format.timestamp_format)
            .map_err(|source| ParseError::Record { line, source })?;
        records.push(record);
    }

    if records.is_empty() {
        return Err(ParseError::EmptyFile);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Date;Serial number;GPS longitude;GPS latitude;Total working hours counter;\
Engine speed;Engine load;Fuel consumption;Ground speed gearbox;Ground speed radar;\
Coolant temperature;Speed front PTO;Speed rear PTO;Current gear shift;Ambient temperature;\
Parking brake status;Transverse differential lock status;All-wheel drive status;Actual status of creeper";

    fn row(serial: &str) -> String {
        format!(
            "Jun 12, 2017 10:30:00 AM;{};-93.265;44.9778;1532.5;1800;65;12.4;8.5;8.1;87;540;1000;F4;21.5;OFF;OFF;ON;OFF",
            serial
        )
    }

    fn file(rows: &[String]) -> Vec<u8> {
        let mut text = String::from(HEADER);
        for r in rows {
            text.push('\n');
            text.push_str(r);
        }
        text.push('\n');
        text.into_bytes()
    }

    #[test]
    fn test_parses_all_rows_with_line_numbers() {
        let bytes = file(&[row("SN-1"), row("SN-2"), row("SN-3")]);
        let records = parse_telemetry(&bytes, &CsvFormat::default()).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].serial_number, "SN-1");
        assert_eq!(records[0].line, 2);
        assert_eq!(records[2].line, 4);
    }

    #[test]
    fn test_one_bad_row_rejects_file() {
        let bad = row("SN-2").replace(";F4;", ";;");
        let bytes = file(&[row("SN-1"), bad, row("SN-3")]);

        match parse_telemetry(&bytes, &CsvFormat::default()) {
            Err(ParseError::Record { line, source }) => {
                assert_eq!(line, 3);
                assert!(matches!(source, RecordError::MissingField { column: "gear_shift" }));
            }
            other => panic!("expected record error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_only_is_empty_file() {
        let bytes = file(&[]);
        assert_eq!(
            parse_telemetry(&bytes, &CsvFormat::default()),
            Err(ParseError::EmptyFile)
        );
        assert_eq!(parse_telemetry(b"", &CsvFormat::default()), Err(ParseError::EmptyFile));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = parse_telemetry(&[0xff, 0xfe, b';'], &CsvFormat::default()).unwrap_err();
        assert!(matches!(err, ParseError::Encoding(_)));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_custom_delimiter_without_header() {
        let format = CsvFormat {
            delimiter: ",".to_string(),
            has_header: false,
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
        };
        let line = row("SN-9")
            .replace("Jun 12, 2017 10:30:00 AM", "2017-06-12 10:30:00")
            .replace(';', ",");

        let records = parse_telemetry(line.as_bytes(), &format).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, 1);
        assert_eq!(records[0].serial_number, "SN-9");
    }

    #[test]
    fn test_delimiter_only_row_rejects_file() {
        let empty = ";".repeat(crate::record::COLUMNS.len() - 1);
        let bytes = file(&[row("SN-1"), row("SN-2"), empty]);

        match parse_telemetry(&bytes, &CsvFormat::default()) {
            Err(ParseError::Record { line, source }) => {
                assert_eq!(line, 4);
                assert!(matches!(source, RecordError::MissingField { .. }));
            }
            other => panic!("expected record error, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        let mut bytes = file(&[row("SN-1")]);
        bytes.extend_from_slice(b"   \n\n");

        let records = parse_telemetry(&bytes, &CsvFormat::default()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_short_row_reports_column_count() {
        let bytes = file(&[row("SN-1"), "Jun 12, 2017 10:30:00 AM;SN-2".to_string()]);
        let err = parse_telemetry(&bytes, &CsvFormat::default()).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Record {
                line: 3,
                source: RecordError::ColumnCount { found: 2, .. }
            }
        ));
        assert!(err.is_validation());
    }
}
