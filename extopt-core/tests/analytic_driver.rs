//! `ExteriorPenaltyDriver` over purely analytic functions (no subprocess):
//! an objective and an equality constraint both in closed form, checking
//! that the penalty coefficient tightens on violation and that gradient
//! descent makes progress toward feasibility.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use extopt_core::driver::base::Sense;
use extopt_core::driver::parallel::ParallelEvalDriver;
use extopt_core::driver::penalty::{ExteriorPenaltyDriver, PenaltyParams};
use extopt_core::error::EngineResult;
use extopt_core::function::{var_id, Function, VarId};
use extopt_core::parameter::Parameter;
use extopt_core::run::RunHandle;
use extopt_core::writer::Writer;
use extopt_core::{DriverBase, NonDiscreteness, Value, Variable};

#[derive(Debug)]
struct NullWriter;
impl Writer for NullWriter {
    fn write(&self, _path: &std::path::Path, _value: &Value) -> EngineResult<()> {
        Ok(())
    }
}

/// Raw `sum(x)`; the driver's own shift/scale step subtracts the
/// registered target, so this must NOT subtract it again.
struct SumTarget {
    variables: Vec<Rc<RefCell<Variable>>>,
}

impl Function for SumTarget {
    fn name(&self) -> &str {
        "sum_target"
    }
    fn get_value(&mut self) -> EngineResult<f64> {
        Ok(self.variables.iter().flat_map(|v| v.borrow().current().to_vec()).sum())
    }
    fn get_gradient(&mut self, mask: Option<&HashMap<VarId, (usize, usize)>>) -> EngineResult<Vec<f64>> {
        let n: usize = self.variables.iter().map(|v| v.borrow().size()).sum();
        let size = mask
            .map(|m| m.values().map(|(off, sz)| off + sz).max().unwrap_or(0))
            .unwrap_or(n);
        let mut g = vec![0.0; size];
        let mut cursor = 0;
        for v in &self.variables {
            let var = v.borrow();
            let offset = mask.map(|m| m[&var_id(v)].0).unwrap_or(cursor);
            for i in 0..var.size() {
                g[offset + i] = 1.0;
            }
            cursor += var.size();
        }
        Ok(g)
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

fn build(x1_0: f64, x2_0: f64, target: f64) -> ExteriorPenaltyDriver {
    let writer: Arc<dyn Writer + Send + Sync> = Arc::new(NullWriter);
    let x1 = Rc::new(RefCell::new(Variable::new("x1", vec![x1_0], vec![0.0], vec![1.0], writer.clone()).unwrap()));
    let x2 = Rc::new(RefCell::new(Variable::new("x2", vec![x2_0], vec![0.0], vec![1.0], writer).unwrap()));

    let mut base = DriverBase::new();
    let mut objective = NonDiscreteness::new("non_discreteness");
    objective.add_input_variable(x1.clone());
    objective.add_input_variable(x2.clone());
    base.add_objective(Sense::Min, Box::new(objective), 1.0, 1.0).unwrap();

    let constraint = SumTarget { variables: vec![x1, x2] };
    base.add_equality(Box::new(constraint), target, 1.0).unwrap();

    base.preprocess_variables().unwrap();

    let mut parallel = ParallelEvalDriver::new(base);
    parallel.set_evaluation_mode(false, 0.0);

    ExteriorPenaltyDriver::new(parallel, PenaltyParams { freq: 1, ..PenaltyParams::default() })
}

#[test]
fn infeasible_start_tightens_penalty_on_update() {
    let mut driver = build(0.1, 0.1, 1.0);
    let x = driver.get_initial();

    let f0 = driver.fun(&x).unwrap();
    assert!(f0.is_finite());

    let _ = driver.grad(&x);
    assert!(!driver.feasible_design(), "sum(0.2) != target(1.0) should be infeasible");
}

#[test]
fn gradient_pushes_sum_toward_target_when_below_it() {
    let mut driver = build(0.1, 0.1, 1.0);
    let x = driver.get_initial();

    let g = driver.grad(&x);

    // sum(x) = 0.2 is below the target of 1.0: the penalty term on an
    // under-target equality constraint must push both components up
    // (negative gradient, since steepest descent moves against it).
    assert_eq!(g.len(), 2);
    assert!(g[0] < 0.0 && g[1] < 0.0, "expected a downhill gradient pushing x up, got {g:?}");

    // With rini=8 dominating the small non-discreteness term, the pull
    // is strongly toward increasing x: -2*r*v*scale = -2*8*(-0.8) = 12.8,
    // offset by the ~1.6 non-discreteness term.
    assert!((g[0] - (1.6 - 12.8)).abs() < 1e-6, "unexpected gradient magnitude: {g:?}");
}

#[test]
fn parameter_cursor_saturates_at_bounds() {
    let writer: Arc<dyn Writer + Send + Sync> = Arc::new(NullWriter);
    let mut p = Parameter::new("sweep", vec![1.0, 2.0, 3.0], 0, writer);
    assert_eq!(p.current(), 1.0);
    assert!(!p.increment());
    assert_eq!(p.current(), 2.0);
    assert!(p.increment());
    assert_eq!(p.current(), 3.0);
    assert!(p.increment(), "incrementing past the last index stays saturated");
    assert_eq!(p.current(), 3.0);
}
