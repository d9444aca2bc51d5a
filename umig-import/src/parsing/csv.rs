//! Streaming CSV reader
//!
//! Wraps `csv::Reader` and pulls one `ByteRecord` at a time, so only one
//! logical record is held in memory. Quoted fields may contain the delimiter,
//! doubled quotes (`""`) and line breaks.
//!
//! Header problems abort the import (`ParseFraming`). Problems inside a data
//! row are reported for that row only (`RawRecord::Unparseable`).

use std::io::Read;

use ::csv::{ByteRecord, ReaderBuilder};

use super::RecordSource;
use crate::error::{ImportError, ImportResult};
use crate::models::{CsvSchema, RawRecord};

/// Longest logical record accepted; an unterminated quote would otherwise
/// pull the rest of the input into one field
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

pub struct CsvRecordReader<R> {
    reader: ::csv::Reader<R>,
    record: ByteRecord,
    columns: Vec<String>,
    unknown_columns: Vec<String>,
}

fn read_failure(err: ::csv::Error) -> ImportError {
    ImportError::ParseFraming(format!("failed to read CSV input: {}", err))
}

fn is_blank(record: &ByteRecord) -> bool {
    record.len() == 1 && record[0].iter().all(u8::is_ascii_whitespace)
}

fn record_line(record: &ByteRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

/// Decode every field, naming the first one that is not UTF-8
fn decode_fields(record: &ByteRecord) -> Result<Vec<String>, String> {
    record
        .iter()
        .enumerate()
        .map(|(i, field)| {
            std::str::from_utf8(field)
                .map(str::to_string)
                .map_err(|e| format!("field {} is not valid UTF-8 ({})", i + 1, e))
        })
        .collect()
}

impl<R: Read> CsvRecordReader<R> {
    /// Read and check the header row against `schema`
    pub fn new(reader: R, schema: &CsvSchema) -> ImportResult<Self> {
        Self::with_delimiter(reader, b',', schema)
    }

    pub fn with_delimiter(reader: R, delimiter: u8, schema: &CsvSchema) -> ImportResult<Self> {
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(reader);
        let mut csv = Self {
            reader,
            record: ByteRecord::new(),
            columns: Vec::new(),
            unknown_columns: Vec::new(),
        };

        if !csv.read_record()? {
            return Err(ImportError::ParseFraming("CSV input is empty (no header row)".into()));
        }
        let header = decode_fields(&csv.record)
            .map_err(|reason| ImportError::ParseFraming(format!("malformed CSV header: {}", reason)))?;

        let mut columns: Vec<String> = Vec::with_capacity(header.len());
        for (i, raw) in header.iter().enumerate() {
            let name = if i == 0 {
                raw.trim_start_matches('\u{feff}').trim()
            } else {
                raw.trim()
            };
            if name.is_empty() {
                return Err(ImportError::ParseFraming(format!(
                    "CSV header column {} is empty",
                    i + 1
                )));
            }
            if columns.iter().any(|c| c == name) {
                return Err(ImportError::ParseFraming(format!(
                    "duplicate CSV header column '{}'",
                    name
                )));
            }
            columns.push(name.to_string());
        }

        let missing: Vec<&str> = schema
            .required
            .iter()
            .copied()
            .filter(|required| !columns.iter().any(|c| c == required))
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::ParseFraming(format!(
                "CSV header is missing required column(s): {}",
                missing.join(", ")
            )));
        }

        csv.unknown_columns = columns.iter().filter(|c| !schema.knows(c)).cloned().collect();
        csv.columns = columns;
        Ok(csv)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Header columns the entity does not use (ignored on import)
    pub fn unknown_columns(&self) -> &[String] {
        &self.unknown_columns
    }

    /// Read the next non-blank record into `self.record`; `false` at end of input
    fn read_record(&mut self) -> ImportResult<bool> {
        loop {
            if !self.reader.read_byte_record(&mut self.record).map_err(read_failure)? {
                return Ok(false);
            }
            if self.record.as_slice().len() > MAX_RECORD_BYTES {
                return Err(ImportError::ParseFraming(format!(
                    "CSV record starting at line {} exceeds {} bytes (unterminated quote?)",
                    record_line(&self.record),
                    MAX_RECORD_BYTES
                )));
            }
            if !is_blank(&self.record) {
                return Ok(true);
            }
        }
    }
}

impl<R: Read> RecordSource for CsvRecordReader<R> {
    fn next_record(&mut self) -> ImportResult<Option<RawRecord>> {
        if !self.read_record()? {
            return Ok(None);
        }

        let line = record_line(&self.record);
        let record = match decode_fields(&self.record) {
            Ok(values) => RawRecord::Csv {
                line,
                columns: self.columns.clone(),
                values,
            },
            Err(reason) => RawRecord::Unparseable {
                position: line,
                reason: format!("line {}: {}", line, reason),
            },
        };
        Ok(Some(record))
    }

    fn warnings(&self) -> Vec<String> {
        self.unknown_columns
            .iter()
            .map(|c| format!("column '{}' is not used and was ignored", c))
            .collect()
    }
}
