//! TOML-driven configuration for the ambient driver settings — working
//! directory, storage mode, failure mode, logging, and the penalty-method
//! tunables. Function/variable/constraint registration stays in code, the
//! same way FADO wires a problem up in Python before handing it to a driver;
//! only the operational knobs are config-driven here.

use std::path::PathBuf;

use serde::Deserialize;

use crate::driver::base::FailureMode;
use crate::driver::penalty::PenaltyParams;
use crate::error::EngineResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DriverConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_true")]
    pub keep_designs: bool,
    #[serde(default = "default_prefix")]
    pub dir_prefix: String,
    #[serde(default)]
    pub failure_mode: FailureModeConfig,

    #[serde(default)]
    pub parallel_eval: bool,
    #[serde(default = "default_wait_time")]
    pub wait_time_secs: f64,

    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_width")]
    pub log_col_width: usize,
    pub history_file: Option<PathBuf>,
    #[serde(default = "default_history_delim")]
    pub history_delim: String,

    #[serde(default)]
    pub penalty: PenaltyConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureModeConfig {
    #[default]
    Hard,
    Soft,
}

impl From<FailureModeConfig> for FailureMode {
    fn from(value: FailureModeConfig) -> Self {
        match value {
            FailureModeConfig::Hard => FailureMode::Hard,
            FailureModeConfig::Soft => FailureMode::Soft,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PenaltyConfig {
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default = "default_freq")]
    pub freq: u64,
    #[serde(default = "default_rini")]
    pub rini: f64,
    #[serde(default = "default_rmax")]
    pub rmax: f64,
    #[serde(default = "default_factor_up")]
    pub factor_up: f64,
    #[serde(default = "default_factor_down")]
    pub factor_down: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            tol: default_tol(),
            freq: default_freq(),
            rini: default_rini(),
            rmax: default_rmax(),
            factor_up: default_factor_up(),
            factor_down: default_factor_down(),
        }
    }
}

impl From<PenaltyConfig> for PenaltyParams {
    fn from(value: PenaltyConfig) -> Self {
        Self {
            tol: value.tol,
            freq: value.freq,
            rini: value.rini,
            rmax: value.rmax,
            factor_up: value.factor_up,
            factor_down: value.factor_down,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("__WORKDIR__")
}
fn default_true() -> bool {
    true
}
fn default_prefix() -> String {
    "DSN_".to_string()
}
fn default_wait_time() -> f64 {
    10.0
}
fn default_log_width() -> usize {
    13
}
fn default_history_delim() -> String {
    ",  ".to_string()
}
fn default_tol() -> f64 {
    1e-3
}
fn default_freq() -> u64 {
    1
}
fn default_rini() -> f64 {
    8.0
}
fn default_rmax() -> f64 {
    1024.0
}
fn default_factor_up() -> f64 {
    4.0
}
fn default_factor_down() -> f64 {
    0.5
}

impl DriverConfig {
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| crate::error::EngineError::BadArgument(format!("invalid driver config: {e}")))
    }

    /// Apply every ambient setting to a freshly constructed driver's base.
    pub fn apply(&self, base: &mut crate::driver::base::DriverBase) -> EngineResult<()> {
        base.set_working_directory(self.work_dir.clone());
        base.set_storage_mode(self.keep_designs, self.dir_prefix.clone());
        base.set_failure_mode(self.failure_mode.into());
        if let Some(path) = &self.log_file {
            base.set_logger_file(path, self.log_col_width)?;
        }
        if let Some(path) = &self.history_file {
            base.set_historian_file(path, self.history_delim.clone())?;
        }
        Ok(())
    }
}
