//! Discrete, cursor-advancing parameter sweeps (continuation/homotopy steps).

use std::path::Path;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::value::Value;
use crate::writer::Writer;

/// An ordered, finite sequence of values with a saturating cursor.
pub struct Parameter {
    name: String,
    values: Vec<f64>,
    index: usize,
    transform: Option<Box<dyn Fn(f64) -> f64 + Send + Sync>>,
    writer: Arc<dyn Writer + Send + Sync>,
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("values", &self.values)
            .finish()
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for Parameter {}

impl Parameter {
    pub fn new(
        name: impl Into<String>,
        values: Vec<f64>,
        start: usize,
        writer: Arc<dyn Writer + Send + Sync>,
    ) -> Self {
        let upper = values.len().saturating_sub(1);
        Self {
            name: name.into(),
            values,
            index: start.min(upper),
            transform: None,
            writer,
        }
    }

    pub fn with_transform(mut self, f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.transform = Some(Box::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> f64 {
        self.values[self.index]
    }

    /// Advance one step; saturates at the last index. Returns true when
    /// the saturation boundary is reached (matches or exceeds it).
    pub fn increment(&mut self) -> bool {
        let upper = self.values.len() - 1;
        self.index = (self.index + 1).min(upper);
        self.index == upper
    }

    /// Step back; saturates at 0. Returns true once at the floor.
    pub fn decrement(&mut self) -> bool {
        self.index = self.index.saturating_sub(1);
        self.index == 0
    }

    pub fn write_to_file(&self, path: &Path) -> EngineResult<()> {
        let mut value = self.current();
        if let Some(f) = &self.transform {
            value = f(value);
        }
        self.writer.write(path, &Value::Scalar(value))
    }
}
