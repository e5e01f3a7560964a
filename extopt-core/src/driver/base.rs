//! `DriverBase` — registration, variable/parameter discovery, and the
//! flat design-vector layout. `spec.md` §4.3.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::function::{var_id, Function, VarId};
use crate::log::{FileSink, LineSink};
use crate::parameter::Parameter;
use crate::variable::Variable;

/// Sense of an objective registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Min,
    Max,
}

/// `HARD` propagates errors; `SOFT` substitutes defaults / cached
/// fallbacks — `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    Hard,
    Soft,
}

pub struct Objective {
    pub function: Box<dyn Function>,
    /// `+scale*weight` for `min`, `-scale*weight` for `max`.
    pub signed_scale: f64,
}

pub struct Constraint {
    pub function: Box<dyn Function>,
    pub scale: f64,
    pub bound1: f64,
    pub bound2: f64,
}

/// Registration and layout state shared by every driver tier.
pub struct DriverBase {
    pub(crate) variables: Vec<Rc<RefCell<Variable>>>,
    pub(crate) parameters: Vec<Rc<RefCell<Parameter>>>,

    pub(crate) objectives: Vec<Objective>,
    pub(crate) constraints_eq: Vec<Constraint>,
    pub(crate) constraints_lt: Vec<Constraint>,
    pub(crate) constraints_gt: Vec<Constraint>,
    pub(crate) constraints_in: Vec<Constraint>,

    /// Each variable's `(offset, size)` in the flat design vector — a
    /// `Function` needs both to place its gradient fragment and to size
    /// its returned vector to the *full* design-vector length, not just
    /// the highest offset it happens to touch.
    pub(crate) variable_start_mask: HashMap<VarId, (usize, usize)>,
    pub(crate) var_scales: Vec<f64>,

    pub(crate) user_dir: PathBuf,
    pub(crate) work_dir: PathBuf,
    pub(crate) dir_prefix: String,
    pub(crate) keep_designs: bool,
    pub(crate) failure_mode: FailureMode,

    pub(crate) log_sink: Option<Box<dyn LineSink>>,
    pub(crate) log_col_width: usize,
    pub(crate) history_sink: Option<Box<dyn LineSink>>,
    pub(crate) history_delim: String,

    pub(crate) user_preprocess_fun: Option<String>,
    pub(crate) user_preprocess_grad: Option<String>,
}

impl Default for DriverBase {
    fn default() -> Self {
        Self {
            variables: Vec::new(),
            parameters: Vec::new(),
            objectives: Vec::new(),
            constraints_eq: Vec::new(),
            constraints_lt: Vec::new(),
            constraints_gt: Vec::new(),
            constraints_in: Vec::new(),
            variable_start_mask: HashMap::new(),
            var_scales: Vec::new(),
            user_dir: PathBuf::new(),
            work_dir: PathBuf::from("__WORKDIR__"),
            dir_prefix: "DSN_".to_string(),
            keep_designs: true,
            failure_mode: FailureMode::Hard,
            log_sink: None,
            log_col_width: 13,
            history_sink: None,
            history_delim: ",  ".to_string(),
            user_preprocess_fun: None,
            user_preprocess_grad: None,
        }
    }
}

impl DriverBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_objective(
        &mut self,
        sense: Sense,
        function: Box<dyn Function>,
        scale: f64,
        weight: f64,
    ) -> EngineResult<()> {
        if scale <= 0.0 || weight <= 0.0 {
            return Err(EngineError::BadArgument(
                "objective scale and weight must be positive".to_string(),
            ));
        }
        let signed_scale = match sense {
            Sense::Min => scale * weight,
            Sense::Max => -scale * weight,
        };
        self.objectives.push(Objective { function, signed_scale });
        Ok(())
    }

    pub fn add_equality(&mut self, function: Box<dyn Function>, target: f64, scale: f64) -> EngineResult<()> {
        check_scale(scale)?;
        self.constraints_eq.push(Constraint { function, scale, bound1: target, bound2: 0.0 });
        Ok(())
    }

    pub fn add_upper_bound(&mut self, function: Box<dyn Function>, bound: f64, scale: f64) -> EngineResult<()> {
        check_scale(scale)?;
        self.constraints_lt.push(Constraint { function, scale, bound1: bound, bound2: 0.0 });
        Ok(())
    }

    pub fn add_lower_bound(&mut self, function: Box<dyn Function>, bound: f64, scale: f64) -> EngineResult<()> {
        check_scale(scale)?;
        self.constraints_gt.push(Constraint { function, scale, bound1: bound, bound2: 0.0 });
        Ok(())
    }

    /// Two-sided range `[lower, upper]`; derives `scale = 1/(upper-lower)`
    /// so the shifted/scaled value lies in `[0, 1]` when feasible.
    pub fn add_up_low_bound(&mut self, function: Box<dyn Function>, lower: f64, upper: f64) -> EngineResult<()> {
        if upper <= lower {
            return Err(EngineError::BadArgument("upper bound must exceed lower bound".to_string()));
        }
        let scale = 1.0 / (upper - lower);
        self.constraints_in.push(Constraint { function, scale, bound1: lower, bound2: upper });
        Ok(())
    }

    pub fn set_working_directory(&mut self, dir: impl Into<PathBuf>) {
        self.work_dir = dir.into();
    }

    pub fn set_storage_mode(&mut self, keep_designs: bool, dir_prefix: impl Into<String>) {
        self.keep_designs = keep_designs;
        self.dir_prefix = dir_prefix.into();
    }

    pub fn set_failure_mode(&mut self, mode: FailureMode) {
        self.failure_mode = mode;
    }

    pub fn set_user_preprocess_fun(&mut self, command: impl Into<String>) {
        self.user_preprocess_fun = Some(command.into());
    }

    pub fn set_user_preprocess_grad(&mut self, command: impl Into<String>) {
        self.user_preprocess_grad = Some(command.into());
    }

    pub fn set_logger(&mut self, sink: Box<dyn LineSink>, width: usize) {
        self.log_sink = Some(sink);
        self.log_col_width = width;
    }

    pub fn set_logger_file(&mut self, path: impl AsRef<std::path::Path>, width: usize) -> EngineResult<()> {
        self.set_logger(Box::new(FileSink::create(path)?), width);
        Ok(())
    }

    pub fn set_historian(&mut self, sink: Box<dyn LineSink>, delim: impl Into<String>) {
        self.history_sink = Some(sink);
        self.history_delim = delim.into();
    }

    pub fn set_historian_file(&mut self, path: impl AsRef<std::path::Path>, delim: impl Into<String>) -> EngineResult<()> {
        self.set_historian(Box::new(FileSink::create(path)?), delim);
        Ok(())
    }

    pub fn num_variables(&self) -> usize {
        self.variables.iter().map(|v| v.borrow().size()).sum()
    }

    fn concatenated(&self, f: impl Fn(&Variable) -> Vec<f64>) -> Vec<f64> {
        self.variables.iter().flat_map(|v| f(&v.borrow())).collect()
    }

    pub fn get_initial(&self) -> Vec<f64> {
        scaled(self.concatenated(|v| v.initial().to_vec()), &self.var_scales)
    }

    pub fn get_lower_bound(&self) -> Vec<f64> {
        scaled(self.concatenated(|v| v.lower_bound().to_vec()), &self.var_scales)
    }

    pub fn get_upper_bound(&self) -> Vec<f64> {
        scaled(self.concatenated(|v| v.upper_bound().to_vec()), &self.var_scales)
    }

    /// Slice `x` by each variable's size, in order, dividing by its scale
    /// before writing into the variable.
    pub fn set_current(&mut self, x: &[f64]) {
        let mut start = 0;
        for var in &self.variables {
            let mut v = var.borrow_mut();
            let end = start + v.size();
            let scale = v.scale();
            let descaled: Vec<f64> = x[start..end].iter().map(|xi| xi / scale).collect();
            v.set_current(&descaled);
            start = end;
        }
    }

    fn discover(functions: &mut [Objective], variables: &mut Vec<Rc<RefCell<Variable>>>, parameters: &mut Vec<Rc<RefCell<Parameter>>>) {
        for obj in functions {
            for var in obj.function.get_variables() {
                if !variables.iter().any(|existing| Rc::ptr_eq(existing, var)) {
                    variables.push(var.clone());
                }
            }
            for par in obj.function.get_parameters() {
                if !parameters.iter().any(|existing| Rc::ptr_eq(existing, &par)) {
                    parameters.push(par);
                }
            }
            let vars = obj.function.get_variables().to_vec();
            for run in obj.function.get_value_eval_chain() {
                run.borrow_mut().update_variables(&vars);
            }
            for run in obj.function.get_gradient_eval_chain() {
                run.borrow_mut().update_variables(&vars);
            }
        }
    }

    fn discover_constraints(constraints: &mut [Constraint], variables: &mut Vec<Rc<RefCell<Variable>>>, parameters: &mut Vec<Rc<RefCell<Parameter>>>) {
        for c in constraints {
            for var in c.function.get_variables() {
                if !variables.iter().any(|existing| Rc::ptr_eq(existing, var)) {
                    variables.push(var.clone());
                }
            }
            for par in c.function.get_parameters() {
                if !parameters.iter().any(|existing| Rc::ptr_eq(existing, &par)) {
                    parameters.push(par);
                }
            }
            let vars = c.function.get_variables().to_vec();
            for run in c.function.get_value_eval_chain() {
                run.borrow_mut().update_variables(&vars);
            }
            for run in c.function.get_gradient_eval_chain() {
                run.borrow_mut().update_variables(&vars);
            }
        }
    }

    /// Finalizes setup; must run once before the first evaluation.
    /// Builds the deduplicated variable/parameter lists, the flat-vector
    /// offset mask, and the concatenated scale vector, then records the
    /// current working directory as the user directory.
    pub fn preprocess_variables(&mut self) -> EngineResult<()> {
        self.variables.clear();
        self.parameters.clear();

        Self::discover(&mut self.objectives, &mut self.variables, &mut self.parameters);
        Self::discover_constraints(&mut self.constraints_eq, &mut self.variables, &mut self.parameters);
        Self::discover_constraints(&mut self.constraints_lt, &mut self.variables, &mut self.parameters);
        Self::discover_constraints(&mut self.constraints_gt, &mut self.variables, &mut self.parameters);
        Self::discover_constraints(&mut self.constraints_in, &mut self.variables, &mut self.parameters);

        self.variable_start_mask.clear();
        let mut offset = 0usize;
        for var in &self.variables {
            let size = var.borrow().size();
            self.variable_start_mask.insert(var_id(var), (offset, size));
            offset += size;
        }

        self.var_scales = self.concatenated(|v| vec![v.scale(); v.size()]);

        self.user_dir = std::env::current_dir()?;
        info!(num_variables = offset, num_parameters = self.parameters.len(), "preprocessed variables");
        Ok(())
    }

    pub fn reset_all_value_evaluations(&mut self) {
        for obj in &mut self.objectives {
            obj.function.reset_value_eval_chain();
        }
        for c in self
            .constraints_eq
            .iter_mut()
            .chain(self.constraints_lt.iter_mut())
            .chain(self.constraints_gt.iter_mut())
            .chain(self.constraints_in.iter_mut())
        {
            c.function.reset_value_eval_chain();
        }
    }

    pub fn reset_all_gradient_evaluations(&mut self) {
        for obj in &mut self.objectives {
            obj.function.reset_gradient_eval_chain();
        }
        for c in self
            .constraints_eq
            .iter_mut()
            .chain(self.constraints_lt.iter_mut())
            .chain(self.constraints_gt.iter_mut())
            .chain(self.constraints_in.iter_mut())
        {
            c.function.reset_gradient_eval_chain();
        }
    }
}

fn check_scale(scale: f64) -> EngineResult<()> {
    if scale <= 0.0 {
        Err(EngineError::BadArgument("scale must be positive".to_string()))
    } else {
        Ok(())
    }
}

fn scaled(values: Vec<f64>, scales: &[f64]) -> Vec<f64> {
    values.iter().zip(scales).map(|(v, s)| v * s).collect()
}
