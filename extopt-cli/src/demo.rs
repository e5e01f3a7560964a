//! Built-in demo problem: a handful of analytic design variables driven
//! through the exterior-penalty loop with no external solver involved, so
//! `extopt optimize` runs end to end with nothing on disk but the config
//! file itself.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use extopt_core::function::{var_id, VarId};
use extopt_core::{
    DriverBase, DriverConfig, EngineResult, ExteriorPenaltyDriver, Function, NonDiscreteness, Parameter,
    ParallelEvalDriver, PenaltyParams, RunHandle, Sense, Variable,
};

#[derive(Debug, Deserialize)]
struct DemoConfig {
    #[serde(flatten)]
    driver: DriverConfig,
    #[serde(default)]
    variable: Vec<DemoVariable>,
    #[serde(default = "default_target")]
    target_sum: f64,
}

#[derive(Debug, Deserialize)]
struct DemoVariable {
    name: String,
    x0: f64,
    lower: f64,
    upper: f64,
}

fn default_target() -> f64 {
    0.0
}

#[derive(Debug)]
struct NullWriter;

impl extopt_core::writer::Writer for NullWriter {
    fn write(&self, _path: &Path, _value: &extopt_core::Value) -> EngineResult<()> {
        Ok(())
    }
}

/// Equality constraint `sum(x) - target == 0`, evaluated directly from the
/// variables with no subprocess — mirrors `NonDiscreteness`'s analytic shape.
/// Raw `sum(x)`; the driver's own shift/scale step subtracts the
/// registered target, so this must NOT subtract it again.
struct SumOfVariables {
    variables: Vec<Rc<RefCell<Variable>>>,
}

impl Function for SumOfVariables {
    fn name(&self) -> &str {
        "sum_of_variables"
    }

    fn get_value(&mut self) -> EngineResult<f64> {
        Ok(self.variables.iter().flat_map(|v| v.borrow().current().to_vec()).sum())
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
            for i in 0..v.size() {
                gradient[offset + i] = 1.0;
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

fn load_demo_config(path: &Path) -> anyhow::Result<DemoConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn build_driver(config: &DemoConfig) -> anyhow::Result<ExteriorPenaltyDriver> {
    if config.variable.is_empty() {
        anyhow::bail!("config must declare at least one [[variable]]");
    }

    let mut base = DriverBase::new();
    config.driver.apply(&mut base)?;

    let writer: Arc<dyn extopt_core::writer::Writer + Send + Sync> = Arc::new(NullWriter);
    let mut variables = Vec::new();
    for v in &config.variable {
        let var = Variable::new(v.name.clone(), vec![v.x0], vec![v.lower], vec![v.upper], writer.clone())?;
        variables.push(Rc::new(RefCell::new(var)));
    }

    let mut non_discreteness = NonDiscreteness::new("non_discreteness");
    for v in &variables {
        non_discreteness.add_input_variable(v.clone());
    }
    base.add_objective(Sense::Min, Box::new(non_discreteness), 1.0, 1.0)?;

    let equality = SumOfVariables { variables: variables.clone() };
    base.add_equality(Box::new(equality), config.target_sum, 1.0)?;

    base.preprocess_variables()?;

    let mut parallel = ParallelEvalDriver::new(base);
    parallel.set_evaluation_mode(false, 0.0);

    Ok(ExteriorPenaltyDriver::new(parallel, PenaltyParams::from(config.driver.penalty)))
}

pub fn run_optimize(config_path: &Path, iters: usize, step: f64) -> anyhow::Result<String> {
    let config = load_demo_config(config_path)?;
    let mut driver = build_driver(&config)?;

    let mut x = driver.get_initial();
    let mut last_f = f64::NAN;
    for i in 0..iters {
        last_f = driver.fun(&x)?;
        let g = driver.try_grad(&x)?;
        for (xi, gi) in x.iter_mut().zip(&g) {
            *xi -= step * gi;
        }
        info!(iter = i, f = last_f, feasible = driver.feasible_design(), "optimize step");
    }

    Ok(format!(
        "finished {iters} iteration(s): f = {last_f:.6}, feasible = {}",
        driver.feasible_design()
    ))
}

pub fn show_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_demo_config(config_path)?;
    println!("work_dir = {}", config.driver.work_dir.display());
    println!("failure_mode = {:?}", config.driver.failure_mode);
    println!("penalty = {:?}", config.driver.penalty);
    println!("target_sum = {}", config.target_sum);
    for v in &config.variable {
        println!("variable {} in [{}, {}], x0 = {}", v.name, v.lower, v.upper, v.x0);
    }
    Ok(())
}
