//! Write-line sinks for the driver's log and history files.
//!
//! Formatting stays inside the driver (`spec.md` §9 "Logger and history
//! sinks"); a sink only needs to accept a finished line and flush.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::error::EngineResult;

pub trait LineSink {
    fn write_line(&mut self, line: &str) -> EngineResult<()>;
}

/// Buffered file sink used by both the log and history writers.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<std::path::Path>) -> EngineResult<Self> {
        Ok(Self { writer: BufWriter::new(File::create(path)?) })
    }
}

impl LineSink for FileSink {
    fn write_line(&mut self, line: &str) -> EngineResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Renders one numeric value right-aligned in a `width`-character column,
/// with `min(8, width - 7)` significant digits — `spec.md` §6.
pub fn format_column(width: usize, value: f64) -> String {
    let precision = width.saturating_sub(7).min(8);
    format!("{value:>width$.precision$e}")
}

pub fn format_header_cell(width: usize, label: &str) -> String {
    format!("{label:>width$}")
}
