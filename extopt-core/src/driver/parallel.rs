//! `ParallelEvalDriver` — dependency graphs, the lazy evaluator, and the
//! parallel poll-based scheduler. `spec.md` §4.4.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, info_span};

use crate::driver::base::{DriverBase, FailureMode};
use crate::error::EngineResult;
use crate::graph::{run_id, EvalGraph, RunId};

const UNSET_SENTINEL: f64 = 1e20;

/// Adds dependency-graph scheduling and raw-value bookkeeping on top of
/// [`DriverBase`].
pub struct ParallelEvalDriver {
    pub base: DriverBase,

    pub(crate) parallel_eval: bool,
    pub(crate) wait_time: Duration,
    pub(crate) fun_eval_graph: Option<EvalGraph>,
    pub(crate) jac_eval_graph: Option<EvalGraph>,

    pub(crate) x_prev: Vec<f64>,
    pub(crate) fun_ready: bool,
    pub(crate) jac_ready: bool,

    pub(crate) fun_eval: u64,
    pub(crate) jac_eval: u64,
    pub(crate) fun_time: f64,
    pub(crate) jac_time: f64,

    pub(crate) ofval: Vec<f64>,
    pub(crate) eqval: Vec<f64>,
    pub(crate) ltval: Vec<f64>,
    pub(crate) gtval: Vec<f64>,
    pub(crate) inval: Vec<f64>,
}

impl std::ops::Deref for ParallelEvalDriver {
    type Target = DriverBase;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
impl std::ops::DerefMut for ParallelEvalDriver {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl ParallelEvalDriver {
    pub fn new(base: DriverBase) -> Self {
        Self {
            base,
            parallel_eval: false,
            wait_time: Duration::from_secs_f64(10.0),
            fun_eval_graph: None,
            jac_eval_graph: None,
            x_prev: Vec::new(),
            fun_ready: false,
            jac_ready: false,
            fun_eval: 0,
            jac_eval: 0,
            fun_time: 0.0,
            jac_time: 0.0,
            ofval: Vec::new(),
            eqval: Vec::new(),
            ltval: Vec::new(),
            gtval: Vec::new(),
            inval: Vec::new(),
        }
    }

    pub fn fun_eval_count(&self) -> u64 {
        self.fun_eval
    }
    pub fn jac_eval_count(&self) -> u64 {
        self.jac_eval
    }

    /// Builds the value and gradient dependency graphs over every unique
    /// run appearing in any registered function's pipelines. When
    /// `parallel` is false, no graph is built and evaluation falls back to
    /// each `Function`'s own sequential path.
    pub fn set_evaluation_mode(&mut self, parallel: bool, wait_time_secs: f64) {
        self.parallel_eval = parallel;
        self.wait_time = Duration::from_secs_f64(wait_time_secs.max(0.0));
        if !parallel {
            return;
        }

        let mut value_pipelines = Vec::new();
        let mut grad_pipelines = Vec::new();
        self.collect_pipelines(&mut value_pipelines, &mut grad_pipelines);

        self.fun_eval_graph = Some(EvalGraph::build(&value_pipelines));
        self.jac_eval_graph = Some(EvalGraph::build(&grad_pipelines));
    }

    fn collect_pipelines(&self, value: &mut Vec<Vec<crate::run::RunHandle>>, grad: &mut Vec<Vec<crate::run::RunHandle>>) {
        for obj in &self.base.objectives {
            value.push(obj.function.get_value_eval_chain());
            grad.push(obj.function.get_gradient_eval_chain());
        }
        for c in self
            .base
            .constraints_eq
            .iter()
            .chain(self.base.constraints_lt.iter())
            .chain(self.base.constraints_gt.iter())
            .chain(self.base.constraints_in.iter())
        {
            value.push(c.function.get_value_eval_chain());
            grad.push(c.function.get_gradient_eval_chain());
        }
    }

    /// `|x_prev - x|_inf > machine epsilon`; on change, pushes `x` into the
    /// variables, rotates the working directory, and invalidates caches.
    pub fn handle_variable_change(&mut self, x: &[f64]) -> EngineResult<bool> {
        if self.x_prev.len() == x.len()
            && self
                .x_prev
                .iter()
                .zip(x)
                .all(|(a, b)| (a - b).abs() <= f64::EPSILON)
        {
            return Ok(false);
        }

        self.x_prev = x.to_vec();
        self.base.set_current(x);
        self.rotate_working_directory()?;
        self.fun_ready = false;
        self.jac_ready = false;
        self.base.reset_all_value_evaluations();
        self.base.reset_all_gradient_evaluations();
        Ok(true)
    }

    fn rotate_working_directory(&mut self) -> EngineResult<()> {
        let current = self.base.work_dir.clone();
        if current.exists() {
            if self.base.keep_designs {
                let rotated = current.with_file_name(format!("{}{:03}", self.base.dir_prefix, self.fun_eval));
                std::fs::rename(&current, rotated)?;
            } else {
                std::fs::remove_dir_all(&current)?;
            }
        }
        std::fs::create_dir_all(&current)?;
        Ok(())
    }

    fn run_preprocess(&self, command: &Option<String>) -> EngineResult<()> {
        if let Some(cmd) = command {
            std::env::set_current_dir(&self.base.user_dir)?;
            let status = std::process::Command::new("sh").arg("-c").arg(cmd).status()?;
            if !status.success() {
                tracing::warn!(command = %cmd, "user preprocess command exited non-zero");
            }
        }
        Ok(())
    }

    /// Runs the value dependency graph to completion, with every node
    /// active (every value evaluation is needed unconditionally).
    fn eval_fun_in_parallel(&mut self) -> EngineResult<()> {
        let Some(graph) = &self.fun_eval_graph else { return Ok(()) };
        let active: HashMap<RunId, bool> = graph.nodes().into_iter().map(|n| (n, true)).collect();
        crate::scheduler::run_graph(graph, active, self.wait_time)
    }

    /// Runs the gradient dependency graph, activating only the branches
    /// that feed an active constraint (objectives and EQ are always
    /// active; LT active if violated `>0`; GT active if violated `<0`).
    fn eval_jac_in_parallel(&mut self) -> EngineResult<()> {
        let Some(graph) = &self.jac_eval_graph else { return Ok(()) };
        let mut active: HashMap<RunId, bool> = graph.nodes().into_iter().map(|n| (n, false)).collect();

        for obj in &self.base.objectives {
            for run in obj.function.get_gradient_eval_chain() {
                active.insert(run_id(&run), true);
            }
        }
        for c in &self.base.constraints_eq {
            for run in c.function.get_gradient_eval_chain() {
                active.insert(run_id(&run), true);
            }
        }
        for (c, &v) in self.base.constraints_lt.iter().zip(self.ltval.iter()) {
            if v > 0.0 {
                for run in c.function.get_gradient_eval_chain() {
                    active.insert(run_id(&run), true);
                }
            }
        }
        for (c, &v) in self.base.constraints_gt.iter().zip(self.gtval.iter()) {
            if v < 0.0 {
                for run in c.function.get_gradient_eval_chain() {
                    active.insert(run_id(&run), true);
                }
            }
        }
        for (c, &v) in self.base.constraints_in.iter().zip(self.inval.iter()) {
            if !(0.0..=1.0).contains(&v) {
                for run in c.function.get_gradient_eval_chain() {
                    active.insert(run_id(&run), true);
                }
            }
        }

        crate::scheduler::run_graph(graph, active, self.wait_time)
    }

    /// Evaluates every objective/constraint at `x`, shifts by bound and
    /// scales, and caches the result (`spec.md` §4.4). Returns `true` if
    /// fresh work happened, `false` on a cache hit.
    pub fn evaluate_functions(&mut self, x: &[f64]) -> EngineResult<bool> {
        self.handle_variable_change(x)?;
        if self.fun_ready {
            return Ok(false);
        }

        self.run_preprocess(&self.base.user_preprocess_fun.clone())?;
        std::env::set_current_dir(&self.base.work_dir)?;

        let span = info_span!("evaluate_functions", fun_eval = self.fun_eval);
        let _guard = span.enter();

        if self.parallel_eval {
            match self.eval_fun_in_parallel() {
                Ok(()) => {}
                Err(e) if self.base.failure_mode == FailureMode::Hard => return Err(e),
                Err(_) => {}
            }
        }

        self.fun_eval += 1;

        self.ofval = vec![0.0; self.base.objectives.len()];
        self.eqval = vec![0.0; self.base.constraints_eq.len()];
        self.ltval = vec![0.0; self.base.constraints_lt.len()];
        self.gtval = vec![0.0; self.base.constraints_gt.len()];
        self.inval = vec![0.0; self.base.constraints_in.len()];

        fetch_objective_values(&mut self.base.objectives, &mut self.ofval, self.base.failure_mode)?;
        fetch_constraint_values(&mut self.base.constraints_eq, &mut self.eqval, self.base.failure_mode)?;
        fetch_constraint_values(&mut self.base.constraints_lt, &mut self.ltval, self.base.failure_mode)?;
        fetch_constraint_values(&mut self.base.constraints_gt, &mut self.gtval, self.base.failure_mode)?;
        fetch_constraint_values(&mut self.base.constraints_in, &mut self.inval, self.base.failure_mode)?;

        self.write_history_line()?;

        for (v, obj) in self.ofval.iter_mut().zip(&self.base.objectives) {
            *v *= obj.signed_scale;
        }
        shift_and_scale(&mut self.eqval, &self.base.constraints_eq);
        shift_and_scale(&mut self.ltval, &self.base.constraints_lt);
        shift_and_scale(&mut self.gtval, &self.base.constraints_gt);
        shift_and_scale(&mut self.inval, &self.base.constraints_in);

        self.fun_ready = true;
        std::env::set_current_dir(&self.base.user_dir)?;

        info!(fun_eval = self.fun_eval, "function evaluation complete");
        Ok(true)
    }

    fn write_history_line(&mut self) -> EngineResult<()> {
        let Some(sink) = self.base.history_sink.as_mut() else { return Ok(()) };
        if self.fun_eval == 1 {
            let mut names: Vec<String> = Vec::new();
            for obj in &self.base.objectives {
                names.push(obj.function.name().to_string());
            }
            for c in self
                .base
                .constraints_eq
                .iter()
                .chain(self.base.constraints_lt.iter())
                .chain(self.base.constraints_gt.iter())
                .chain(self.base.constraints_in.iter())
            {
                names.push(c.function.name().to_string());
            }
            let mut header = vec!["ITER".to_string()];
            header.extend(names);
            sink.write_line(&header.join(&self.base.history_delim))?;
        }
        let mut row = vec![self.fun_eval.to_string()];
        for v in self.ofval.iter().chain(&self.eqval).chain(&self.ltval).chain(&self.gtval).chain(&self.inval) {
            row.push(v.to_string());
        }
        sink.write_line(&row.join(&self.base.history_delim))
    }

    /// Gradients always require values first; early-outs on cache hit.
    pub fn evaluate_gradients(&mut self, x: &[f64]) -> EngineResult<bool> {
        self.evaluate_functions(x)?;
        if self.jac_ready {
            return Ok(false);
        }

        self.run_preprocess(&self.base.user_preprocess_grad.clone())?;
        std::env::set_current_dir(&self.base.work_dir)?;

        if self.parallel_eval {
            self.eval_jac_in_parallel()?;
        }

        std::env::set_current_dir(&self.base.user_dir)?;
        self.jac_eval += 1;
        self.jac_ready = true;
        Ok(true)
    }

    pub fn invalidate(&mut self) {
        self.x_prev = vec![UNSET_SENTINEL; self.x_prev.len().max(1)];
        self.fun_ready = false;
        self.jac_ready = false;
        self.base.reset_all_value_evaluations();
        self.base.reset_all_gradient_evaluations();
    }
}

fn fetch_objective_values(
    objectives: &mut [crate::driver::base::Objective],
    dst: &mut [f64],
    mode: FailureMode,
) -> EngineResult<()> {
    for (slot, obj) in dst.iter_mut().zip(objectives.iter_mut()) {
        match obj.function.get_value() {
            Ok(v) => *slot = v,
            Err(e) => {
                if mode == FailureMode::Soft {
                    if let Some(default) = obj.function.default_value() {
                        *slot = default;
                        continue;
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

fn fetch_constraint_values(
    constraints: &mut [crate::driver::base::Constraint],
    dst: &mut [f64],
    mode: FailureMode,
) -> EngineResult<()> {
    for (slot, c) in dst.iter_mut().zip(constraints.iter_mut()) {
        match c.function.get_value() {
            Ok(v) => *slot = v,
            Err(e) => {
                if mode == FailureMode::Soft {
                    if let Some(default) = c.function.default_value() {
                        *slot = default;
                        continue;
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

fn shift_and_scale(values: &mut [f64], constraints: &[crate::driver::base::Constraint]) {
    for (v, c) in values.iter_mut().zip(constraints) {
        *v = (*v - c.bound1) * c.scale;
    }
}
