//! Streaming JSON element splitter
//!
//! Accepts a single top-level object (one record) or a top-level array (one
//! record per element). Elements are cut out of the byte stream by tracking
//! bracket nesting and string state, then parsed individually with serde_json,
//! so only one element is held in memory at a time.
//!
//! Truncated or unbalanced input aborts the import (`ParseFraming`). A balanced
//! element that is not valid JSON is reported for that element only.

use std::io::BufRead;

use super::RecordSource;
use crate::error::{ImportError, ImportResult};
use crate::models::RawRecord;

/// Largest single element accepted
pub const MAX_ELEMENT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Top-level object, not yet emitted
    SingleObject,
    /// Inside the top-level array
    Array,
    Finished,
}

pub struct JsonElementReader<R> {
    reader: R,
    layout: Layout,
    index: u64,
    /// Bytes consumed so far (for error messages)
    offset: u64,
    element: Vec<u8>,
}

fn framing(message: String) -> ImportError {
    ImportError::ParseFraming(message)
}

impl<R: BufRead> JsonElementReader<R> {
    /// Inspect the first significant byte to pick object or array layout
    pub fn new(reader: R) -> ImportResult<Self> {
        let mut json = Self {
            reader,
            layout: Layout::Finished,
            index: 0,
            offset: 0,
            element: Vec::new(),
        };

        json.skip_bom()?;
        match json.peek_significant()? {
            Some(b'{') => json.layout = Layout::SingleObject,
            Some(b'[') => {
                json.next_byte()?;
                json.layout = Layout::Array;
            }
            Some(other) => {
                return Err(framing(format!(
                    "top-level JSON must be an object or array, found '{}'",
                    other as char
                )))
            }
            None => return Err(framing("JSON input is empty".into())),
        }
        Ok(json)
    }

    fn skip_bom(&mut self) -> ImportResult<()> {
        let has_bom = self.fill()?.starts_with(&[0xEF, 0xBB, 0xBF]);
        if has_bom {
            self.reader.consume(3);
            self.offset += 3;
        }
        Ok(())
    }

    fn fill(&mut self) -> ImportResult<&[u8]> {
        self.reader
            .fill_buf()
            .map_err(|e| framing(format!("failed to read JSON input: {}", e)))
    }

    fn peek_byte(&mut self) -> ImportResult<Option<u8>> {
        Ok(self.fill()?.first().copied())
    }

    fn next_byte(&mut self) -> ImportResult<Option<u8>> {
        let byte = self.peek_byte()?;
        if byte.is_some() {
            self.reader.consume(1);
            self.offset += 1;
        }
        Ok(byte)
    }

    /// Skip whitespace and return the next byte without consuming it
    fn peek_significant(&mut self) -> ImportResult<Option<u8>> {
        loop {
            let byte = self.peek_byte()?;
            match byte {
                Some(b) if b.is_ascii_whitespace() => {
                    self.reader.consume(1);
                    self.offset += 1;
                }
                other => return Ok(other),
            }
        }
    }

    fn truncated(&self) -> ImportError {
        framing(format!(
            "JSON input is truncated at byte {} (element {} not closed)",
            self.offset, self.index
        ))
    }

    /// Copy one balanced value into `self.element`
    ///
    /// Stops before the `,` or `]` that ends an array element, or after the
    /// closing `}` of a single object. Returns the byte that ended it.
    /// Whitespace is kept so `[1 2]` stays invalid instead of reading as `12`.
    fn scan_element(&mut self, in_array: bool) -> ImportResult<Option<u8>> {
        self.element.clear();
        let mut stack: Vec<u8> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;

        loop {
            if stack.is_empty() && !in_string && in_array {
                if let Some(b) = self.peek_byte()? {
                    if b == b',' || b == b']' {
                        return Ok(Some(b));
                    }
                }
            }

            let Some(b) = self.next_byte()? else {
                return Err(self.truncated());
            };

            if self.element.len() >= MAX_ELEMENT_BYTES {
                return Err(framing(format!(
                    "JSON element {} exceeds {} bytes",
                    self.index, MAX_ELEMENT_BYTES
                )));
            }
            self.element.push(b);

            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }

            match b {
                b'"' => in_string = true,
                b'{' | b'[' => stack.push(b),
                b'}' | b']' => {
                    let expected = if b == b'}' { b'{' } else { b'[' };
                    if stack.pop() != Some(expected) {
                        return Err(framing(format!(
                            "unbalanced '{}' at byte {} in element {}",
                            b as char, self.offset, self.index
                        )));
                    }
                    if stack.is_empty() && !in_array {
                        return Ok(Some(b));
                    }
                }
                _ => {}
            }
        }
    }

    fn emit(&mut self) -> RawRecord {
        let index = self.index;
        self.index += 1;

        let text = match std::str::from_utf8(&self.element) {
            Ok(text) => text,
            Err(e) => {
                return RawRecord::Unparseable {
                    position: index,
                    reason: format!("record {}: not valid UTF-8 ({})", index, e),
                }
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return RawRecord::Unparseable {
                position: index,
                reason: format!("record {}: empty array element", index),
            };
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => RawRecord::Json { index, value },
            Err(e) => RawRecord::Unparseable {
                position: index,
                reason: format!("record {}: invalid JSON: {}", index, e),
            },
        }
    }

    fn expect_end_of_input(&mut self) -> ImportResult<()> {
        match self.peek_significant()? {
            None => Ok(()),
            Some(b) => Err(framing(format!(
                "unexpected '{}' after the end of the JSON document at byte {}",
                b as char, self.offset
            ))),
        }
    }
}

impl<R: BufRead> RecordSource for JsonElementReader<R> {
    fn next_record(&mut self) -> ImportResult<Option<RawRecord>> {
        match self.layout {
            Layout::Finished => Ok(None),
            Layout::SingleObject => {
                self.scan_element(false)?;
                self.layout = Layout::Finished;
                self.expect_end_of_input()?;
                Ok(Some(self.emit()))
            }
            Layout::Array => {
                // Empty array
                if self.index == 0 && self.peek_significant()? == Some(b']') {
                    self.next_byte()?;
                    self.layout = Layout::Finished;
                    self.expect_end_of_input()?;
                    return Ok(None);
                }

                let terminator = self.scan_element(true)?;
                match terminator {
                    Some(b',') => {
                        self.next_byte()?;
                    }
                    Some(b']') => {
                        self.next_byte()?;
                        self.layout = Layout::Finished;
                        self.expect_end_of_input()?;
                    }
                    _ => return Err(self.truncated()),
                }
                Ok(Some(self.emit()))
            }
        }
    }
}
