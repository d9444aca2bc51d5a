//! Streaming input parsers
//!
//! Both parsers are blocking and pull from a `BufRead`; the chunk processor
//! runs them on the blocking thread pool.

pub mod csv;
pub mod json;

pub use self::csv::CsvRecordReader;
pub use self::json::JsonElementReader;

use crate::error::{ImportError, ImportResult};
use crate::models::{InputReader, RawRecord, SourceFormat};

/// Pull-based source of raw records
pub trait RecordSource {
    /// Next record, `Ok(None)` at end of input, `Err` on framing failure
    fn next_record(&mut self) -> ImportResult<Option<RawRecord>>;

    /// Non-fatal notes about the input as a whole
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

pub type BoxedRecordSource = Box<dyn RecordSource + Send>;

/// Build the parser for one input (reads the CSV header / JSON opening byte)
pub fn open_source(format: SourceFormat, reader: InputReader) -> ImportResult<BoxedRecordSource> {
    match format {
        SourceFormat::Csv(entity) => {
            let schema = entity.csv_schema().ok_or_else(|| {
                ImportError::Unsupported(format!("CSV import of {} is not supported", entity.plural()))
            })?;
            Ok(Box::new(CsvRecordReader::new(reader, schema)?))
        }
        SourceFormat::JsonSteps | SourceFormat::JsonPlans => Ok(Box::new(JsonElementReader::new(reader)?)),
    }
}

/// Read up to `max` records; an empty vector means the input is exhausted
pub fn read_chunk(source: &mut dyn RecordSource, max: usize) -> ImportResult<Vec<RawRecord>> {
    let mut records = Vec::with_capacity(max.min(4096));
    while records.len() < max {
        match source.next_record()? {
            Some(record) => records.push(record),
            None => break,
        }
    }
    Ok(records)
}
