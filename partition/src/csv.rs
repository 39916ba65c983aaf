//! A small row editor for delimiter-separated text.
//!
//! Parses one raw line into field spans without copying, exposes typed
//! getters, and re-serializes with any appended or overridden output
//! fields. Output fields that are not part of the input (chunk ID,
//! sub-chunk ID, partitioning flags) are declared up front and appended
//! in declaration order.

use thiserror::Error;

/// The SQL-style NULL token.
const NULL_TOKEN: &str = "\\N";

#[derive(Debug, Error)]
pub enum CsvError {
    #[error("unknown field '{0}'; declare it with --in-fields")]
    UnknownField(String),
    #[error("record has {got} fields, expected {expected}: {line}")]
    FieldCount { expected: usize, got: usize, line: String },
    #[error("field '{field}' is not a valid number: '{value}'")]
    BadNumber { field: String, value: String },
    #[error("field '{field}' is NULL")]
    NullField { field: String },
    #[error("option {option} must name two fields separated by a comma, got '{value}'")]
    BadFieldPair { option: String, value: String },
}

/// A named output field appended after the input fields.
#[derive(Debug, Clone)]
struct AppendedField {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RowEditor {
    delimiter: u8,
    in_fields: Vec<String>,
    appended: Vec<AppendedField>,
    /// Current line bytes, exclusive of the newline.
    line: Vec<u8>,
    /// (start, end) spans of the input fields within `line`.
    spans: Vec<(usize, usize)>,
    /// Per-input-field overrides set since the last `read_line`.
    overrides: Vec<Option<String>>,
}

impl RowEditor {
    pub fn new(in_fields: Vec<String>, delimiter: u8) -> Self {
        let n = in_fields.len();
        RowEditor {
            delimiter,
            in_fields,
            appended: Vec::new(),
            line: Vec::new(),
            spans: Vec::with_capacity(n),
            overrides: vec![None; n],
        }
    }

    /// The index of a named input field.
    pub fn field(&self, name: &str) -> Result<usize, CsvError> {
        self.in_fields
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| CsvError::UnknownField(name.to_string()))
    }

    /// The index of a named output field, appending a new one when the
    /// name is not among the input fields.
    pub fn output_field(&mut self, name: &str) -> usize {
        if let Ok(i) = self.field(name) {
            return i;
        }
        if let Some(i) = self.appended.iter().position(|f| f.name == name) {
            return self.in_fields.len() + i;
        }
        self.appended.push(AppendedField { name: name.to_string(), value: None });
        self.in_fields.len() + self.appended.len() - 1
    }

    /// Parse one raw line (no trailing newline). Clears all overrides
    /// and appended values.
    pub fn read_line(&mut self, line: &[u8]) -> Result<(), CsvError> {
        self.line.clear();
        self.line.extend_from_slice(line);
        self.spans.clear();
        let mut start = 0usize;
        for (i, &b) in self.line.iter().enumerate() {
            if b == self.delimiter {
                self.spans.push((start, i));
                start = i + 1;
            }
        }
        self.spans.push((start, self.line.len()));
        if self.spans.len() != self.in_fields.len() {
            return Err(CsvError::FieldCount {
                expected: self.in_fields.len(),
                got: self.spans.len(),
                line: String::from_utf8_lossy(&self.line).into_owned(),
            });
        }
        for v in &mut self.overrides {
            *v = None;
        }
        for f in &mut self.appended {
            f.value = None;
        }
        Ok(())
    }

    fn raw(&self, index: usize) -> &str {
        let (start, end) = self.spans[index];
        // Input is required to be UTF-8; fields of interest are numeric.
        std::str::from_utf8(&self.line[start..end]).unwrap_or("").trim()
    }

    fn name_of(&self, index: usize) -> &str {
        if index < self.in_fields.len() {
            &self.in_fields[index]
        } else {
            &self.appended[index - self.in_fields.len()].name
        }
    }

    /// Whether an input field holds the NULL token or is empty.
    pub fn is_null(&self, index: usize) -> bool {
        let s = self.raw(index);
        s.is_empty() || s == NULL_TOKEN
    }

    /// The trimmed text of an input field; `None` when NULL.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        if self.is_null(index) {
            None
        } else {
            Some(self.raw(index))
        }
    }

    /// A required floating-point input field.
    pub fn get_f64(&self, index: usize) -> Result<f64, CsvError> {
        let s = self.get_str(index).ok_or_else(|| CsvError::NullField {
            field: self.name_of(index).to_string(),
        })?;
        s.parse().map_err(|_| CsvError::BadNumber {
            field: self.name_of(index).to_string(),
            value: s.to_string(),
        })
    }

    /// Override the value of an output field for the current row.
    pub fn set_i32(&mut self, index: usize, value: i32) {
        self.set(index, value.to_string());
    }

    /// Override the value of an output field for the current row.
    pub fn set_char(&mut self, index: usize, value: char) {
        self.set(index, value.to_string());
    }

    fn set(&mut self, index: usize, value: String) {
        if index < self.in_fields.len() {
            self.overrides[index] = Some(value);
        } else {
            self.appended[index - self.in_fields.len()].value = Some(value);
        }
    }

    /// Serialize the current row, with overrides and appended fields,
    /// into `out`, terminated by a newline.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.clear();
        for i in 0..self.in_fields.len() {
            if i > 0 {
                out.push(self.delimiter);
            }
            match &self.overrides[i] {
                Some(v) => out.extend_from_slice(v.as_bytes()),
                None => {
                    let (start, end) = self.spans[i];
                    out.extend_from_slice(&self.line[start..end]);
                }
            }
        }
        for f in &self.appended {
            out.push(self.delimiter);
            match &f.value {
                Some(v) => out.extend_from_slice(v.as_bytes()),
                None => out.extend_from_slice(NULL_TOKEN.as_bytes()),
            }
        }
        out.push(b'\n');
    }
}

/// Split a `--part-pos` style value of the form `lon,lat` into the two
/// field names.
pub fn parse_field_pair(option: &str, value: &str) -> Result<(String, String), CsvError> {
    let mut it = value.split(',').map(str::trim);
    match (it.next(), it.next(), it.next()) {
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => {
            Ok((a.to_string(), b.to_string()))
        }
        _ => Err(CsvError::BadFieldPair { option: option.to_string(), value: value.to_string() }),
    }
}

/// Iterate whole lines of a block, excluding the line terminators. The
/// block is required to end with a newline.
pub fn lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == b'\n').filter(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> RowEditor {
        RowEditor::new(vec!["id".into(), "ra".into(), "dec".into()], b',')
    }

    #[test]
    fn test_read_and_get() {
        let mut e = editor();
        e.read_line(b"1, 2.0, 3.0").unwrap();
        assert_eq!(e.get_str(0), Some("1"));
        assert_eq!(e.get_f64(1).unwrap(), 2.0);
        assert_eq!(e.get_f64(2).unwrap(), 3.0);
    }

    #[test]
    fn test_field_count_mismatch() {
        let mut e = editor();
        assert!(e.read_line(b"1,2").is_err());
    }

    #[test]
    fn test_null_detection() {
        let mut e = editor();
        e.read_line(b"\\N,2.0,").unwrap();
        assert!(e.is_null(0));
        assert!(!e.is_null(1));
        assert!(e.is_null(2));
        assert!(e.get_f64(0).is_err());
    }

    #[test]
    fn test_appended_fields_round_trip() {
        let mut e = editor();
        let chunk = e.output_field("chunkId");
        let sub = e.output_field("subChunkId");
        e.read_line(b"1,2.0,3.0").unwrap();
        e.set_i32(chunk, 1200);
        e.set_i32(sub, 7);
        let mut out = Vec::new();
        e.write_to(&mut out);
        assert_eq!(out, b"1,2.0,3.0,1200,7\n");
    }

    #[test]
    fn test_output_field_reuses_input_field() {
        let mut e = editor();
        let i = e.output_field("ra");
        assert_eq!(i, 1);
        e.read_line(b"1,2.0,3.0").unwrap();
        e.set_i32(i, 9);
        let mut out = Vec::new();
        e.write_to(&mut out);
        assert_eq!(out, b"1,9,3.0\n");
    }

    #[test]
    fn test_unset_appended_field_is_null() {
        let mut e = editor();
        e.output_field("flags");
        e.read_line(b"1,2.0,3.0").unwrap();
        let mut out = Vec::new();
        e.write_to(&mut out);
        assert_eq!(out, b"1,2.0,3.0,\\N\n");
    }

    #[test]
    fn test_parse_field_pair() {
        assert_eq!(parse_field_pair("part.pos", "ra, dec").unwrap(), ("ra".into(), "dec".into()));
        assert!(parse_field_pair("part.pos", "ra").is_err());
        assert!(parse_field_pair("part.pos", "ra,dec,extra").is_err());
    }

    #[test]
    fn test_lines_iterator() {
        let block = b"a\nbb\nccc\n";
        let lines: Vec<&[u8]> = lines(block).collect();
        assert_eq!(lines, vec![b"a".as_slice(), b"bb", b"ccc"]);
    }
}
