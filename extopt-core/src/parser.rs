//! Solver-output parsers: extract a scalar or vector from a result file.

use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::value::Value;

/// Narrow capability used by `Function` to read a value or gradient
/// fragment out of a solver output file.
pub trait Parser: std::fmt::Debug {
    fn read(&self, path: &Path) -> EngineResult<Value>;
}

/// Reads a row/column slice out of a whitespace (or `delim`-char)
/// separated table, after skipping `start.0` header rows and everything
/// from `end.0` onward (footer). `row`/`col` of `None` means "take the
/// whole axis"; both `Some` selects a single cell.
#[derive(Debug, Clone)]
pub struct TableReader {
    pub row: Option<usize>,
    pub col: Option<usize>,
    pub start: (usize, usize),
    pub end: (Option<usize>, Option<usize>),
    pub delim: String,
}

impl TableReader {
    pub fn new(row: Option<usize>, col: Option<usize>) -> Self {
        Self {
            row,
            col,
            start: (0, 0),
            end: (None, None),
            delim: String::new(),
        }
    }
}

impl Parser for TableReader {
    fn read(&self, path: &Path) -> EngineResult<Value> {
        let contents = fs::read_to_string(path)?;
        let mut lines: Vec<&str> = contents.lines().collect();
        if let Some(end_row) = self.end.0 {
            lines.truncate(end_row);
        }
        if self.start.0 <= lines.len() {
            lines.drain(0..self.start.0);
        }

        let mut data: Vec<Vec<f64>> = Vec::with_capacity(lines.len());
        let mut num_col = 0usize;
        for line in &lines {
            let mut cleaned = line.to_string();
            for ch in self.delim.chars() {
                cleaned = cleaned.replace(ch, " ");
            }
            let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
            if self.start.1 <= tokens.len() {
                tokens.drain(0..self.start.1);
            }
            if let Some(end_col) = self.end.1 {
                if end_col <= tokens.len() {
                    tokens.truncate(end_col - self.start.1.min(end_col));
                }
            }
            let row: Result<Vec<f64>, _> = tokens.iter().map(|t| t.parse::<f64>()).collect();
            let row = row.map_err(|e| EngineError::SolverOutputError {
                path: path.to_path_buf(),
                message: format!("non-numeric table cell: {e}"),
            })?;
            if num_col == 0 {
                num_col = row.len();
            } else if row.len() != num_col {
                return Err(EngineError::SolverOutputError {
                    path: path.to_path_buf(),
                    message: "data is not in table format".to_string(),
                });
            }
            data.push(row);
        }

        match (self.row, self.col) {
            (None, None) => Ok(Value::Vector(data.into_iter().flatten().collect())),
            (None, Some(c)) => Ok(Value::Vector(data.iter().map(|r| r[c]).collect())),
            (Some(r), None) => Ok(Value::Vector(data[r].clone())),
            (Some(r), Some(c)) => Ok(Value::Scalar(data[r][c])),
        }
    }
}

/// Reads the delimiter-split payload of the line beginning with `label`
/// ("pre-string" convention): `LABEL 1.0, 2.0, 3.0`.
#[derive(Debug, Clone)]
pub struct PreStringHandler {
    pub label: String,
    pub delim: String,
}

impl PreStringHandler {
    pub fn new(label: impl Into<String>, delim: impl Into<String>) -> Self {
        Self { label: label.into(), delim: delim.into() }
    }
}

impl Parser for PreStringHandler {
    fn read(&self, path: &Path) -> EngineResult<Value> {
        let contents = fs::read_to_string(path)?;
        let payload = contents
            .lines()
            .find(|line| line.starts_with(&self.label))
            .ok_or_else(|| EngineError::SolverOutputError {
                path: path.to_path_buf(),
                message: format!("label '{}' not found", self.label),
            })?;
        let rest = payload[self.label.len()..].trim();
        let parts: Vec<&str> = rest.split(&self.delim).map(str::trim).collect();
        if parts.len() == 1 {
            let v: f64 = parts[0].parse().map_err(|e| EngineError::SolverOutputError {
                path: path.to_path_buf(),
                message: format!("non-numeric payload: {e}"),
            })?;
            Ok(Value::Scalar(v))
        } else {
            let v: Result<Vec<f64>, _> = parts.iter().map(|p| p.parse::<f64>()).collect();
            let v = v.map_err(|e| EngineError::SolverOutputError {
                path: path.to_path_buf(),
                message: format!("non-numeric payload: {e}"),
            })?;
            Ok(Value::Vector(v))
        }
    }
}

impl crate::writer::Writer for PreStringHandler {
    fn write(&self, path: &std::path::Path, value: &Value) -> EngineResult<()> {
        let contents = fs::read_to_string(path)?;
        let values = value.as_slice();
        let mut new_line: Option<String> = None;
        let mut out_lines = Vec::new();
        for line in contents.lines() {
            if line.starts_with(&self.label) {
                let line_text = new_line.get_or_insert_with(|| {
                    let joined = values
                        .iter()
                        .map(|v| format!("{v}"))
                        .collect::<Vec<_>>()
                        .join(&self.delim);
                    format!("{}{}", self.label, joined)
                });
                out_lines.push(line_text.clone());
            } else {
                out_lines.push(line.to_string());
            }
        }
        fs::write(path, out_lines.join("\n") + "\n")?;
        Ok(())
    }
}
