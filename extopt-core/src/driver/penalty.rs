//! `ExteriorPenaltyDriver` — composes objectives and active constraints
//! into one augmented objective/gradient and runs the penalty-update
//! state machine. `spec.md` §4.5.

use tracing::info;

use crate::driver::base::FailureMode;
use crate::driver::parallel::ParallelEvalDriver;
use crate::error::EngineResult;
use crate::log::{format_column, format_header_cell};

/// Tunables of the exterior-penalty method, named the same as the
/// `ExteriorPenaltyDriver` constructor arguments in `spec.md` §4.5.
#[derive(Debug, Clone, Copy)]
pub struct PenaltyParams {
    pub tol: f64,
    pub freq: u64,
    pub rini: f64,
    pub rmax: f64,
    pub factor_up: f64,
    pub factor_down: f64,
}

impl Default for PenaltyParams {
    fn default() -> Self {
        Self { tol: 1e-3, freq: 1, rini: 8.0, rmax: 1024.0, factor_up: 4.0, factor_down: 0.5 }
    }
}

pub struct ExteriorPenaltyDriver {
    pub parallel: ParallelEvalDriver,
    params: PenaltyParams,

    eq_pen: Vec<f64>,
    lt_pen: Vec<f64>,
    gt_pen: Vec<f64>,
    in_pen: Vec<f64>,

    grad: Vec<f64>,
    old_grad: Vec<f64>,

    is_feasible: bool,
    initialized: bool,
}

impl std::ops::Deref for ExteriorPenaltyDriver {
    type Target = ParallelEvalDriver;
    fn deref(&self) -> &Self::Target {
        &self.parallel
    }
}
impl std::ops::DerefMut for ExteriorPenaltyDriver {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.parallel
    }
}

impl ExteriorPenaltyDriver {
    pub fn new(parallel: ParallelEvalDriver, params: PenaltyParams) -> Self {
        Self {
            parallel,
            params,
            eq_pen: Vec::new(),
            lt_pen: Vec::new(),
            gt_pen: Vec::new(),
            in_pen: Vec::new(),
            grad: Vec::new(),
            old_grad: Vec::new(),
            is_feasible: false,
            initialized: false,
        }
    }

    fn ensure_initialized(&mut self) -> EngineResult<()> {
        if self.initialized {
            return Ok(());
        }
        let n_eq = self.parallel.base.constraints_eq.len();
        let n_lt = self.parallel.base.constraints_lt.len();
        let n_gt = self.parallel.base.constraints_gt.len();
        let n_in = self.parallel.base.constraints_in.len();

        self.eq_pen = vec![self.params.rini; n_eq];
        self.lt_pen = vec![self.params.rini; n_lt];
        self.gt_pen = vec![self.params.rini; n_gt];
        self.in_pen = vec![self.params.rini; n_in];

        let n = self.parallel.base.num_variables();
        self.grad = vec![0.0; n];
        self.old_grad = vec![0.0; n];

        self.write_log_header()?;
        self.initialized = true;
        Ok(())
    }

    fn write_log_header(&mut self) -> EngineResult<()> {
        let w = self.parallel.base.log_col_width;
        let Some(sink) = self.parallel.base.log_sink.as_mut() else { return Ok(()) };
        let mut header = vec![
            format_header_cell(w, "FUN EVAL"),
            format_header_cell(w, "FUN TIME"),
            format_header_cell(w, "GRAD EVAL"),
            format_header_cell(w, "GRAD TIME"),
            format_header_cell(w, "FEASIBLE"),
        ];
        for obj in &self.parallel.base.objectives {
            header.push(format_header_cell(w, obj.function.name()));
        }
        for c in self
            .parallel
            .base
            .constraints_eq
            .iter()
            .chain(self.parallel.base.constraints_lt.iter())
            .chain(self.parallel.base.constraints_gt.iter())
            .chain(self.parallel.base.constraints_in.iter())
        {
            header.push(format_header_cell(w, c.function.name()));
            header.push(format_header_cell(w, "PEN COEFF"));
        }
        sink.write_line(&header.concat())
    }

    fn write_log_line(&mut self) -> EngineResult<()> {
        let w = self.parallel.base.log_col_width;
        let (fun_eval, fun_time, jac_eval, jac_time, feasible) = (
            self.parallel.fun_eval,
            self.parallel.fun_time,
            self.parallel.jac_eval,
            self.parallel.jac_time,
            self.is_feasible,
        );
        let ofval = self.parallel.ofval.clone();
        let eqval = self.parallel.eqval.clone();
        let ltval = self.parallel.ltval.clone();
        let gtval = self.parallel.gtval.clone();
        let inval = self.parallel.inval.clone();
        let eq_pen = self.eq_pen.clone();
        let lt_pen = self.lt_pen.clone();
        let gt_pen = self.gt_pen.clone();
        let in_pen = self.in_pen.clone();

        let Some(sink) = self.parallel.base.log_sink.as_mut() else { return Ok(()) };
        let mut row = vec![
            format!("{fun_eval:>w$}"),
            format!("{fun_time:>w$.3e}"),
            format!("{jac_eval:>w$}"),
            format!("{jac_time:>w$.3e}"),
            format!("{:>w$}", if feasible { "YES" } else { "NO" }),
        ];
        for v in &ofval {
            row.push(format_column(w, *v));
        }
        for (v, r) in eqval.iter().zip(&eq_pen) {
            row.push(format_column(w, *v));
            row.push(format_column(w, *r));
        }
        for (v, r) in ltval.iter().zip(&lt_pen) {
            row.push(format_column(w, *v));
            row.push(format_column(w, *r));
        }
        for (v, r) in gtval.iter().zip(&gt_pen) {
            row.push(format_column(w, *v));
            row.push(format_column(w, *r));
        }
        for (v, r) in inval.iter().zip(&in_pen) {
            row.push(format_column(w, *v));
            row.push(format_column(w, *r));
        }
        sink.write_line(&row.concat())
    }

    /// `f(x) = sum(signed-scale objectives) + penalty terms over all four
    /// constraint buckets` — `spec.md` §4.5.
    pub fn fun(&mut self, x: &[f64]) -> EngineResult<f64> {
        self.ensure_initialized()?;
        self.parallel.evaluate_functions(x)?;

        let mut f: f64 = self.parallel.ofval.iter().sum();
        for (v, r) in self.parallel.eqval.iter().zip(&self.eq_pen) {
            f += r * v * v;
        }
        for (v, r) in self.parallel.ltval.iter().zip(&self.lt_pen) {
            f += r * v.max(0.0) * v;
        }
        for (v, r) in self.parallel.gtval.iter().zip(&self.gt_pen) {
            f += r * v.min(0.0) * v;
        }
        for (v, r) in self.parallel.inval.iter().zip(&self.in_pen) {
            f += r * (v.min(0.0) + (v.max(1.0) - 1.0)) * v;
        }
        Ok(f)
    }

    /// Under SOFT failure mode, any downstream error returns the cached
    /// `old_grad` instead of propagating. Under HARD failure mode a
    /// downstream error must surface, not masquerade as a fresh gradient —
    /// since this method's signature is infallible, it panics rather than
    /// silently handing the optimizer a stale vector. Callers that want
    /// HARD-mode errors as a `Result` instead of a panic must call
    /// `try_grad` in place of this method.
    pub fn grad(&mut self, x: &[f64]) -> Vec<f64> {
        match self.evaluate_gradients_inner(x) {
            Ok(g) => g,
            Err(e) if self.parallel.base.failure_mode == FailureMode::Soft => {
                tracing::warn!(error = %e, "gradient evaluation failed in SOFT mode, reusing cached gradient");
                self.old_grad.clone()
            }
            Err(e) => panic!("gradient evaluation failed in HARD mode: {e}"),
        }
    }

    /// Same as [`Self::grad`] but returns the `Result` instead of panicking
    /// in HARD mode — use this from any caller that can propagate a
    /// `Result` up to its own boundary.
    pub fn try_grad(&mut self, x: &[f64]) -> EngineResult<Vec<f64>> {
        self.evaluate_gradients_inner(x)
    }

    fn evaluate_gradients_inner(&mut self, x: &[f64]) -> EngineResult<Vec<f64>> {
        self.fun(x)?;
        if self.parallel.jac_ready {
            return Ok(self.grad.clone());
        }

        self.parallel.evaluate_gradients(x)?;

        let n = self.grad.len();
        self.grad = vec![0.0; n];
        let mask = self.parallel.base.variable_start_mask.clone();

        for obj in &mut self.parallel.base.objectives {
            let g = obj.function.get_gradient(Some(&mask))?;
            axpy(&mut self.grad, obj.signed_scale, &g);
        }
        for (i, (c, &v)) in self
            .parallel
            .base
            .constraints_eq
            .iter_mut()
            .zip(self.parallel.eqval.clone().iter())
            .enumerate()
        {
            let g = c.function.get_gradient(Some(&mask))?;
            axpy(&mut self.grad, 2.0 * self.eq_pen[i] * v * c.scale, &g);
        }
        for (i, (c, &v)) in self
            .parallel
            .base
            .constraints_lt
            .iter_mut()
            .zip(self.parallel.ltval.clone().iter())
            .enumerate()
        {
            if v > 0.0 {
                let g = c.function.get_gradient(Some(&mask))?;
                axpy(&mut self.grad, 2.0 * self.lt_pen[i] * v * c.scale, &g);
            }
        }
        for (i, (c, &v)) in self
            .parallel
            .base
            .constraints_gt
            .iter_mut()
            .zip(self.parallel.gtval.clone().iter())
            .enumerate()
        {
            if v < 0.0 {
                let g = c.function.get_gradient(Some(&mask))?;
                axpy(&mut self.grad, 2.0 * self.gt_pen[i] * v * c.scale, &g);
            }
        }
        for (i, (c, &v)) in self
            .parallel
            .base
            .constraints_in
            .iter_mut()
            .zip(self.parallel.inval.clone().iter())
            .enumerate()
        {
            if !(0.0..=1.0).contains(&v) {
                let g = c.function.get_gradient(Some(&mask))?;
                axpy(&mut self.grad, 2.0 * self.in_pen[i] * v * c.scale, &g);
            }
        }

        for (g, s) in self.grad.iter_mut().zip(&self.parallel.base.var_scales) {
            *g /= s;
        }

        if self.params.freq > 0 && self.parallel.jac_eval % self.params.freq == 0 {
            self.update(false)?;
        }

        self.parallel.base.reset_all_gradient_evaluations();
        self.old_grad = self.grad.clone();
        Ok(self.grad.clone())
    }

    /// Runs one outer iteration: tightens or relaxes every constraint's
    /// penalty coefficient, advances parameters, and invalidates caches.
    pub fn update(&mut self, params_if_feasible: bool) -> EngineResult<()> {
        self.is_feasible = true;
        let tol = self.params.tol;

        for (v, r) in self.parallel.eqval.clone().iter().zip(self.eq_pen.iter_mut()) {
            if v.abs() > tol {
                *r = (*r * self.params.factor_up).min(self.params.rmax);
                self.is_feasible = false;
            }
        }
        for (v, r) in self.parallel.ltval.clone().iter().zip(self.lt_pen.iter_mut()) {
            if *v > tol {
                *r = (*r * self.params.factor_up).min(self.params.rmax);
                self.is_feasible = false;
            } else if *v < 0.0 {
                *r = (*r * self.params.factor_down).max(self.params.rini);
            }
        }
        for (v, r) in self.parallel.gtval.clone().iter().zip(self.gt_pen.iter_mut()) {
            if *v < -tol {
                *r = (*r * self.params.factor_up).min(self.params.rmax);
                self.is_feasible = false;
            } else if *v > 0.0 {
                *r = (*r * self.params.factor_down).max(self.params.rini);
            }
        }
        for (v, r) in self.parallel.inval.clone().iter().zip(self.in_pen.iter_mut()) {
            if *v > 1.0 + tol || *v < -tol {
                *r = (*r * self.params.factor_up).min(self.params.rmax);
                self.is_feasible = false;
            } else if *v > 0.0 && *v < 1.0 {
                *r = (*r * self.params.factor_down).max(self.params.rini);
            }
        }

        if !params_if_feasible || self.is_feasible {
            for p in &self.parallel.base.parameters {
                p.borrow_mut().increment();
            }
        }

        self.parallel.invalidate();

        info!(feasible = self.is_feasible, "penalty update complete");
        self.write_log_line()
    }

    pub fn feasible_design(&self) -> bool {
        self.is_feasible
    }
}

fn axpy(dst: &mut [f64], alpha: f64, x: &[f64]) {
    for (d, v) in dst.iter_mut().zip(x) {
        *d += alpha * v;
    }
}
