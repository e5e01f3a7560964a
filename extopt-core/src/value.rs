//! The scalar/vector sum type returned by parsers.

/// A value read from, or written to, a solver file.
///
/// Parsers may legitimately return either shape depending on how the
/// underlying table or label is structured; downstream code collapses a
/// vector into a scalar by summation when the owning variable is scalar,
/// and broadcasts a scalar when a vector write is requested for a single
/// label.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    /// Collapse to a single scalar: a `Vector` sums its components, a
    /// `Scalar` returns itself.
    pub fn sum(&self) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Vector(v) => v.iter().sum(),
        }
    }

    /// View the value as a flat slice without collapsing.
    pub fn as_slice(&self) -> Vec<f64> {
        match self {
            Value::Scalar(v) => vec![*v],
            Value::Vector(v) => v.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}
