//! `Function`: a value-producing pipeline with an auxiliary gradient
//! pipeline, plus the one analytic variant named by the spec.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::EngineResult;
use crate::parameter::Parameter;
use crate::parser::Parser;
use crate::run::RunHandle;
use crate::variable::Variable;

/// Identity key for a variable, used to key the driver's
/// `variableStartMask`. Two clones of the same `Rc<RefCell<Variable>>`
/// produce the same key.
pub type VarId = usize;

pub fn var_id(v: &Rc<RefCell<Variable>>) -> VarId {
    Rc::as_ptr(v) as usize
}

/// Common contract the driver relies on — pipeline-backed and analytic
/// functions both implement it, and the driver never distinguishes them.
pub trait Function {
    fn name(&self) -> &str;

    /// Collapses to a scalar (vector outputs are summed), matching how the
    /// source's `getValue` is always read into a single slot of `ofval`.
    fn get_value(&mut self) -> EngineResult<f64>;

    /// `mask`, if given, maps each variable to its `(offset, size)` in the
    /// full design vector and the returned gradient must be sized to the
    /// *whole* design vector (`max(offset + size)` over the mask), not
    /// just this function's own variables — otherwise fragments placed at
    /// a later offset than this function's own size would index out of
    /// bounds, and callers summing fragments index-for-index (no mask)
    /// would silently misalign. `None` concatenates this function's own
    /// variables' fragments in registration order instead.
    fn get_gradient(&mut self, mask: Option<&HashMap<VarId, (usize, usize)>>) -> EngineResult<Vec<f64>>;

    fn get_value_eval_chain(&self) -> Vec<RunHandle>;
    fn get_gradient_eval_chain(&self) -> Vec<RunHandle>;
    fn reset_value_eval_chain(&mut self);
    fn reset_gradient_eval_chain(&mut self);

    fn get_variables(&self) -> &[Rc<RefCell<Variable>>];
    fn get_parameters(&self) -> Vec<Rc<RefCell<Parameter>>>;

    /// A fallback scalar used in SOFT failure mode; `None` means the
    /// failure must propagate even in SOFT mode.
    fn default_value(&self) -> Option<f64> {
        None
    }
}

struct GradientSource {
    variable: Rc<RefCell<Variable>>,
    file: PathBuf,
    parser: Box<dyn Parser>,
}

/// A pipeline-backed function: runs `value_pipeline`/`gradient_pipeline`
/// sequentially (the scheduler runs them in parallel instead, out from
/// under this type) and reads results through the registered parsers.
pub struct PipelineFunction {
    name: String,
    out_file: PathBuf,
    out_parser: Box<dyn Parser>,
    value_pipeline: Vec<RunHandle>,
    gradient_pipeline: Vec<RunHandle>,
    gradient_sources: Vec<GradientSource>,
    variables: Vec<Rc<RefCell<Variable>>>,
    default_value: Option<f64>,
}

impl PipelineFunction {
    pub fn new(name: impl Into<String>, out_file: impl Into<PathBuf>, out_parser: Box<dyn Parser>) -> Self {
        Self {
            name: name.into(),
            out_file: out_file.into(),
            out_parser,
            value_pipeline: Vec::new(),
            gradient_pipeline: Vec::new(),
            gradient_sources: Vec::new(),
            variables: Vec::new(),
            default_value: None,
        }
    }

    pub fn with_default_value(mut self, value: f64) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn add_value_step(&mut self, run: RunHandle) {
        self.value_pipeline.push(run);
    }

    pub fn add_gradient_step(&mut self, run: RunHandle) {
        self.gradient_pipeline.push(run);
    }

    pub fn add_input_variable(
        &mut self,
        variable: Rc<RefCell<Variable>>,
        grad_file: impl Into<PathBuf>,
        grad_parser: Box<dyn Parser>,
    ) {
        self.gradient_sources.push(GradientSource {
            variable: variable.clone(),
            file: grad_file.into(),
            parser: grad_parser,
        });
        self.variables.push(variable);
    }

    fn run_sequential(evals: &[RunHandle]) -> EngineResult<()> {
        for run in evals {
            let mut r = run.borrow_mut();
            r.initialize()?;
            r.run()?;
        }
        Ok(())
    }
}

impl Function for PipelineFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_value(&mut self) -> EngineResult<f64> {
        if self.value_pipeline.iter().any(|r| !r.borrow().is_run()) {
            Self::run_sequential(&self.value_pipeline)?;
        }
        let value = self.out_parser.read(&self.out_file)?;
        Ok(value.sum())
    }

    fn get_gradient(&mut self, mask: Option<&HashMap<VarId, (usize, usize)>>) -> EngineResult<Vec<f64>> {
        if self.gradient_pipeline.iter().any(|r| !r.borrow().is_run()) {
            Self::run_sequential(&self.gradient_pipeline)?;
        }

        let size = match mask {
            Some(m) => m.values().map(|(off, sz)| off + sz).max().unwrap_or(0),
            None => self.variables.iter().map(|v| v.borrow().size()).sum(),
        };
        let mut gradient = vec![0.0; size];
        let mut cursor = 0usize;

        for source in &self.gradient_sources {
            let raw = source.parser.read(&source.file)?;
            let var_size = source.variable.borrow().size();
            let fragment: Vec<f64> = if var_size == 1 && raw.len() > 1 {
                vec![raw.sum()]
            } else {
                raw.as_slice()
            };

            let offset = match mask {
                Some(m) => m[&var_id(&source.variable)].0,
                None => cursor,
            };
            for (i, v) in fragment.iter().enumerate() {
                gradient[offset + i] = *v;
            }
            cursor += var_size;
        }

        Ok(gradient)
    }

    fn get_value_eval_chain(&self) -> Vec<RunHandle> {
        self.value_pipeline.clone()
    }

    fn get_gradient_eval_chain(&self) -> Vec<RunHandle> {
        self.gradient_pipeline.clone()
    }

    fn reset_value_eval_chain(&mut self) {
        for r in &self.value_pipeline {
            r.borrow_mut().finalize();
        }
    }

    fn reset_gradient_eval_chain(&mut self) {
        for r in &self.gradient_pipeline {
            r.borrow_mut().finalize();
        }
    }

    fn get_variables(&self) -> &[Rc<RefCell<Variable>>] {
        &self.variables
    }

    fn get_parameters(&self) -> Vec<Rc<RefCell<Parameter>>> {
        let mut params = Vec::new();
        for run in self.value_pipeline.iter().chain(self.gradient_pipeline.iter()) {
            for p in run.borrow().parameters_for_discovery() {
                if !params.iter().any(|existing| Rc::ptr_eq(existing, p)) {
                    params.push(p.clone());
                }
            }
        }
        params
    }

    fn default_value(&self) -> Option<f64> {
        self.default_value
    }
}

/// Bounded-domain non-discreteness metric, computed directly from
/// variables with no external process involved:
/// `4 * sum_i (ub_i - x_i)(x_i - lb_i) / (ub_i + lb_i)^2 / N`.
pub struct NonDiscreteness {
    name: String,
    variables: Vec<Rc<RefCell<Variable>>>,
}

impl NonDiscreteness {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), variables: Vec::new() }
    }

    pub fn add_input_variable(&mut self, variable: Rc<RefCell<Variable>>) {
        self.variables.push(variable);
    }
}

impl Function for NonDiscreteness {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_value(&mut self) -> EngineResult<f64> {
        let mut total_n = 0usize;
        let mut y = 0.0;
        for var in &self.variables {
            let var = var.borrow();
            total_n += var.size();
            for ((x, lb), ub) in var
                .current()
                .iter()
                .zip(var.lower_bound())
                .zip(var.upper_bound())
            {
                y += (ub - x) * (x - lb) / (ub + lb).powi(2);
            }
        }
        Ok(4.0 * y / total_n.max(1) as f64)
    }

    fn get_gradient(&mut self, mask: Option<&HashMap<VarId, (usize, usize)>>) -> EngineResult<Vec<f64>> {
        let n: usize = self.variables.iter().map(|v| v.borrow().size()).sum();
        let size = match mask {
            Some(m) => m.values().map(|(off, sz)| off + sz).max().unwrap_or(0),
            None => n,
        };
        let mut gradient = vec![0.0; size];
        let mut cursor = 0usize;
        for var in &self.variables {
            let v = var.borrow();
            let offset = match mask {
                Some(m) => m[&var_id(var)].0,
                None => cursor,
            };
            for (i, ((x, lb), ub)) in v
                .current()
                .iter()
                .zip(v.lower_bound())
                .zip(v.upper_bound())
                .enumerate()
            {
                gradient[offset + i] = (4.0 / n.max(1) as f64) * (ub + lb - 2.0 * x) / (ub + lb).powi(2);
            }
            cursor += v.size();
        }
        Ok(gradient)
    }

    fn get_value_eval_chain(&self) -> Vec<RunHandle> {
        Vec::new()
    }
    fn get_gradient_eval_chain(&self) -> Vec<RunHandle> {
        Vec::new()
    }
    fn reset_value_eval_chain(&mut self) {}
    fn reset_gradient_eval_chain(&mut self) {}

    fn get_variables(&self) -> &[Rc<RefCell<Variable>>] {
        &self.variables
    }
    fn get_parameters(&self) -> Vec<Rc<RefCell<Parameter>>> {
        Vec::new()
    }
}
