//! Bounded design variables.

use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::value::Value;
use crate::writer::Writer;

/// A bounded vector of real-valued design components.
///
/// `x0`, lower and upper bounds, and the current value always share the
/// same length (`size`). The writer capability is fixed at construction
/// and never changes.
#[derive(Clone)]
pub struct Variable {
    name: String,
    size: usize,
    initial: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    current: Vec<f64>,
    scale: f64,
    writer: Arc<dyn Writer + Send + Sync>,
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("current", &self.current)
            .finish()
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for Variable {}

impl Variable {
    /// Construct a variable. `size == 0` means "infer from `x0`".
    /// Scalar `lb`/`ub` broadcast to `size`; otherwise their length must
    /// match.
    pub fn new(
        name: impl Into<String>,
        x0: Vec<f64>,
        lower: Vec<f64>,
        upper: Vec<f64>,
        writer: Arc<dyn Writer + Send + Sync>,
    ) -> EngineResult<Self> {
        let size = x0.len();
        if size == 0 {
            return Err(EngineError::BadArgument(
                "variable must have size >= 1".to_string(),
            ));
        }
        let lower = broadcast_or_check(lower, size)?;
        let upper = broadcast_or_check(upper, size)?;
        Ok(Self {
            name: name.into(),
            size,
            current: x0.clone(),
            initial: x0,
            lower,
            upper,
            scale: 1.0,
            writer,
        })
    }

    /// Convenience constructor for a scalar variable, broadcasting
    /// `x0`/`lb`/`ub` if a vector is requested via `size`.
    pub fn scalar(
        name: impl Into<String>,
        x0: f64,
        lower: f64,
        upper: f64,
        size: usize,
        writer: Arc<dyn Writer + Send + Sync>,
    ) -> EngineResult<Self> {
        let n = size.max(1);
        Self::new(name, vec![x0; n], vec![lower; n], vec![upper; n], writer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn initial(&self) -> &[f64] {
        &self.initial
    }
    pub fn current(&self) -> &[f64] {
        &self.current
    }
    pub fn lower_bound(&self) -> &[f64] {
        &self.lower
    }
    pub fn upper_bound(&self) -> &[f64] {
        &self.upper
    }
    pub fn scale(&self) -> f64 {
        self.scale
    }
    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    /// Overwrite the current value. `x.len()` must equal `size`.
    pub fn set_current(&mut self, x: &[f64]) {
        debug_assert_eq!(x.len(), self.size);
        self.current.copy_from_slice(&x[..self.size.min(x.len())]);
    }

    /// Write the current value into `path` using the variable's writer.
    pub fn write_to_file(&self, path: &Path) -> EngineResult<()> {
        let value = if self.size == 1 {
            Value::Scalar(self.current[0])
        } else {
            Value::Vector(self.current.clone())
        };
        self.writer.write(path, &value)
    }
}

fn broadcast_or_check(v: Vec<f64>, size: usize) -> EngineResult<Vec<f64>> {
    if v.len() == size {
        Ok(v)
    } else if v.len() == 1 {
        Ok(vec![v[0]; size])
    } else {
        Err(EngineError::BadArgument(format!(
            "expected length {size} or 1, got {}",
            v.len()
        )))
    }
}
