//! Template writers: substitute design values into staged config files.
//!
//! Three canonical implementations, mirroring `spec.md` §6: a fixed-label
//! substring replace, the array variant of the same, and a rectangular
//! table region rewrite.

use std::fs;
use std::path::Path;

use crate::error::EngineResult;
use crate::value::Value;

/// Narrow capability used by `Variable`/`Parameter` to stamp their current
/// value into a staged file.
pub trait Writer: std::fmt::Debug {
    fn write(&self, path: &Path, value: &Value) -> EngineResult<()>;
}

/// Replaces every occurrence of a fixed label with the scalar value.
///
/// If given a `Value::Vector`, only the first component is used — mirrors
/// the source's `if isinstance(value, np.ndarray): value = value[0]`.
#[derive(Debug, Clone)]
pub struct LabelReplacer {
    pub label: String,
}

impl LabelReplacer {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl Writer for LabelReplacer {
    fn write(&self, path: &Path, value: &Value) -> EngineResult<()> {
        let scalar = match value {
            Value::Scalar(v) => *v,
            Value::Vector(v) => *v.first().unwrap_or(&0.0),
        };
        let contents = fs::read_to_string(path)?;
        let replaced = contents.replace(&self.label, &format!("{scalar}"));
        fs::write(path, replaced)?;
        Ok(())
    }
}

/// Replaces every occurrence of a fixed label with a delimiter-joined
/// rendering of the whole vector.
#[derive(Debug, Clone)]
pub struct ArrayLabelReplacer {
    pub label: String,
    pub delim: String,
}

impl ArrayLabelReplacer {
    pub fn new(label: impl Into<String>, delim: impl Into<String>) -> Self {
        Self { label: label.into(), delim: delim.into() }
    }
}

impl Writer for ArrayLabelReplacer {
    fn write(&self, path: &Path, value: &Value) -> EngineResult<()> {
        let values = value.as_slice();
        let joined = values
            .iter()
            .map(|v| format!("{v}"))
            .collect::<Vec<_>>()
            .join(&self.delim);
        let contents = fs::read_to_string(path)?;
        let replaced = contents.replace(&self.label, &joined);
        fs::write(path, replaced)?;
        Ok(())
    }
}

/// Rewrites a rectangular block of a whitespace/`delim_chars`-delimited
/// table, keeping header/footer rows and any leading/trailing columns
/// untouched.
///
/// `start`/`end` bound the rows that form the table body (end exclusive,
/// `None` meaning "to the end"), the same convention `TableReader` uses.
#[derive(Debug, Clone)]
pub struct TableWriter {
    pub delim: String,
    pub start: (usize, usize),
    pub end: (Option<usize>, Option<usize>),
    pub delim_chars: String,
}

impl TableWriter {
    pub fn new(start: (usize, usize), end: (Option<usize>, Option<usize>)) -> Self {
        Self {
            delim: "  ".to_string(),
            start,
            end,
            delim_chars: String::new(),
        }
    }
}

impl Writer for TableWriter {
    fn write(&self, path: &Path, value: &Value) -> EngineResult<()> {
        // The driver always calls writers with one row's worth of values
        // per variable; a multi-row rewrite goes through `write_rows`.
        self.write_rows(path, &[value.as_slice()])
    }
}

impl TableWriter {
    /// Write `rows` (one `Vec<f64>` per table row) into the body region.
    pub fn write_rows(&self, path: &Path, rows: &[Vec<f64>]) -> EngineResult<()> {
        let contents = fs::read_to_string(path)?;
        let mut lines: Vec<String> = contents.lines().map(|l| l.to_string()).collect();

        if lines.len() < rows.len() {
            // "Soft fail": not enough lines to hold the data, leave file untouched.
            return Ok(());
        }

        let body_end = self.end.0.unwrap_or(lines.len());
        let footer: Vec<String> = lines.split_off(body_end.min(lines.len()));
        let mut header_and_body = lines;
        let body = header_and_body.split_off(self.start.0.min(header_and_body.len()));
        let header = header_and_body;

        if body.len() != rows.len() {
            return Err(crate::error::EngineError::BadArgument(format!(
                "table {:?} has {} body rows, data has {} rows",
                path,
                body.len(),
                rows.len()
            )));
        }

        let mut new_body = Vec::with_capacity(body.len());
        for (line, row) in body.iter().zip(rows.iter()) {
            let mut clean = line.clone();
            for ch in self.delim_chars.chars() {
                clean = clean.replace(ch, " ");
            }
            let tokens: Vec<&str> = clean.split_whitespace().collect();
            let left = &tokens[..self.start.1.min(tokens.len())];
            let right_start = self.end.1.unwrap_or(tokens.len()).min(tokens.len());
            let right = &tokens[right_start..];

            let mut new_line = String::new();
            for tok in left {
                new_line.push_str(tok);
                new_line.push_str(&self.delim);
            }
            for v in row {
                new_line.push_str(&format!("{v}"));
                new_line.push_str(&self.delim);
            }
            for tok in right {
                new_line.push_str(tok);
                new_line.push_str(&self.delim);
            }
            new_body.push(new_line.trim_end().to_string());
        }

        let mut out = header;
        out.extend(new_body);
        out.extend(footer);
        fs::write(path, out.join("\n") + "\n")?;
        Ok(())
    }
}
