//! `ExternalRun`: one subprocess invocation in an isolated working directory.
//!
//! Mirrors FADO's `evaluation.py::ExternalRun` lifecycle
//! (`Fresh -> Initialized -> {Polling,Blocking} -> Completed`, with a
//! `Completed -> Initialized` self-edge on retry) using
//! `std::process::Command` rather than an async runtime, matching the
//! single-threaded cooperative-polling model in `spec.md` §5.

use std::cell::RefCell;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::parameter::Parameter;
use crate::variable::Variable;

/// Shared, mutable handle to an `ExternalRun`.
///
/// Identity (`Rc::ptr_eq`) is how the dependency graph builder deduplicates
/// a run step that appears in more than one function's pipeline — the same
/// handle cloned into two pipelines is the same node.
pub type RunHandle = Rc<RefCell<ExternalRun>>;

/// Where a data file's path should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLocation {
    Auto,
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Fresh,
    Initialized,
    Completed,
}

struct DataFile {
    path: PathBuf,
    relative: bool,
}

enum AttemptOutcome {
    Completed(i32),
    Retrying,
}

/// One invocation of an external executable in a private working
/// directory.
pub struct ExternalRun {
    work_dir: PathBuf,
    command: String,
    use_symlinks: bool,
    data_files: Vec<DataFile>,
    config_files: Vec<PathBuf>,
    expected_files: Vec<PathBuf>,
    parameters: Vec<Rc<RefCell<Parameter>>>,
    variables: Vec<Rc<RefCell<Variable>>>,
    max_tries: u32,
    tries: u32,
    state: RunState,
    child: Option<Child>,
    last_code: Option<i32>,
}

impl ExternalRun {
    pub fn new(work_dir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            command: command.into(),
            use_symlinks: false,
            data_files: Vec::new(),
            config_files: Vec::new(),
            expected_files: Vec::new(),
            parameters: Vec::new(),
            variables: Vec::new(),
            max_tries: 1,
            tries: 0,
            state: RunState::Fresh,
            child: None,
            last_code: None,
        }
    }

    pub fn into_handle(self) -> RunHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn use_symlinks(mut self, use_symlinks: bool) -> Self {
        self.use_symlinks = use_symlinks;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn add_data(&mut self, path: impl Into<PathBuf>, location: FileLocation) -> EngineResult<()> {
        let path = path.into();
        match location {
            FileLocation::Relative => {
                self.data_files.push(DataFile { path, relative: true });
                Ok(())
            }
            FileLocation::Absolute => {
                let abs = absolute_existing(&path)?;
                self.data_files.push(DataFile { path: abs, relative: false });
                Ok(())
            }
            FileLocation::Auto => {
                match absolute_existing(&path) {
                    Ok(abs) => self.data_files.push(DataFile { path: abs, relative: false }),
                    Err(_) => self.data_files.push(DataFile { path, relative: true }),
                }
                Ok(())
            }
        }
    }

    pub fn add_config(&mut self, path: impl Into<PathBuf>) -> EngineResult<()> {
        self.config_files.push(absolute_existing(&path.into())?);
        Ok(())
    }

    pub fn add_parameter(&mut self, param: Rc<RefCell<Parameter>>) {
        self.parameters.push(param);
    }

    pub fn update_variables(&mut self, vars: &[Rc<RefCell<Variable>>]) {
        for v in vars {
            if !self.variables.iter().any(|existing| Rc::ptr_eq(existing, v)) {
                self.variables.push(v.clone());
            }
        }
    }

    /// Parameters registered on this run, used by `Function::get_parameters`
    /// during discovery.
    pub fn parameters_for_discovery(&self) -> &[Rc<RefCell<Parameter>>] {
        &self.parameters
    }

    pub fn add_expected(&mut self, relative_path: impl Into<PathBuf>) {
        self.expected_files.push(self.work_dir.join(relative_path.into()));
    }

    pub fn set_max_tries(&mut self, n: u32) {
        self.max_tries = n.max(1);
    }

    pub fn is_initialized(&self) -> bool {
        self.state != RunState::Fresh
    }

    pub fn is_run(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Stage data/config files, template the configs, and spawn the
    /// subprocess. Idempotent while already initialized.
    pub fn initialize(&mut self) -> EngineResult<()> {
        if self.state != RunState::Fresh {
            return Ok(());
        }

        fs::create_dir_all(&self.work_dir)?;

        for data in &self.data_files {
            let source = if data.relative {
                self.work_dir
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(&data.path)
            } else {
                data.path.clone()
            };
            let target = self.work_dir.join(file_name_of(&data.path));
            stage_file(&source, &target, self.use_symlinks)?;
        }

        for config in &self.config_files {
            let target = self.work_dir.join(file_name_of(config));
            fs::copy(config, &target)?;
            for param in &self.parameters {
                param.borrow().write_to_file(&target)?;
            }
            for var in &self.variables {
                var.borrow().write_to_file(&target)?;
            }
        }

        self.spawn()?;
        self.state = RunState::Initialized;
        self.tries = 0;
        debug!(work_dir = %self.work_dir.display(), "external run initialized");
        Ok(())
    }

    fn spawn(&mut self) -> EngineResult<()> {
        let stdout = File::create(self.work_dir.join("stdout.txt"))?;
        let stderr = File::create(self.work_dir.join("stderr.txt"))?;
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.work_dir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        self.child = Some(child);
        Ok(())
    }

    /// Blocks until the run reaches `Completed` or exhausts its retries,
    /// respawning and re-waiting on each missing-output attempt in between
    /// (mirrors the original's `return self.run(timeout)` recursion).
    pub fn run(&mut self) -> EngineResult<i32> {
        if self.state == RunState::Fresh {
            return Err(EngineError::ProcessNotInitialized {
                work_dir: self.work_dir.display().to_string(),
            });
        }
        if self.state == RunState::Completed {
            return Ok(self.last_code.unwrap_or(0));
        }

        loop {
            let mut child = self.child.take().expect("initialized run has a child");
            let status = child.wait()?;
            self.tries += 1;
            match self.validate_attempt(status.code())? {
                AttemptOutcome::Completed(code) => return Ok(code),
                AttemptOutcome::Retrying => continue,
            }
        }
    }

    /// Non-blocking poll; returns `None` while the process is still
    /// running. Does not retry past a single missing-output attempt — the
    /// caller is expected to call `poll` again on a later pass.
    pub fn poll(&mut self) -> EngineResult<Option<i32>> {
        if self.state == RunState::Fresh {
            return Err(EngineError::ProcessNotInitialized {
                work_dir: self.work_dir.display().to_string(),
            });
        }
        if self.state == RunState::Completed {
            return Ok(Some(self.last_code.unwrap_or(0)));
        }

        let exited = {
            let child = self.child.as_mut().expect("initialized run has a child");
            child.try_wait()?
        };
        let Some(status) = exited else {
            return Ok(None);
        };
        self.tries += 1;
        match self.validate_attempt(status.code())? {
            AttemptOutcome::Completed(code) => Ok(Some(code)),
            AttemptOutcome::Retrying => Ok(None),
        }
    }

    /// Checks the just-finished attempt's expected outputs, respawning for
    /// another attempt on failure. Never blocks; `run()` loops on
    /// `Retrying`, `poll()` reports it as "still not done" to its caller.
    fn validate_attempt(&mut self, code: Option<i32>) -> EngineResult<AttemptOutcome> {
        self.last_code = code;
        if self.expected_files.iter().all(|f| f.is_file()) {
            self.state = RunState::Completed;
            self.tries = 0;
            self.child = None;
            return Ok(AttemptOutcome::Completed(code.unwrap_or(-1)));
        }

        if self.tries >= self.max_tries {
            warn!(work_dir = %self.work_dir.display(), tries = self.tries, "run exhausted retries");
            return Err(EngineError::RunFailed {
                work_dir: self.work_dir.display().to_string(),
                tries: self.tries,
            });
        }

        warn!(work_dir = %self.work_dir.display(), tries = self.tries, "expected outputs missing, retrying");
        self.teardown_for_retry()?;
        self.spawn()?;
        Ok(AttemptOutcome::Retrying)
    }

    fn teardown_for_retry(&mut self) -> EngineResult<()> {
        self.child = None;
        Ok(())
    }

    /// Closes stream handles and resets lifecycle flags. Leaves the
    /// working directory on disk.
    pub fn finalize(&mut self) {
        self.child = None;
        self.state = RunState::Fresh;
        self.last_code = None;
    }
}

fn file_name_of(path: &Path) -> &std::ffi::OsStr {
    path.file_name().unwrap_or_else(|| path.as_os_str())
}

fn stage_file(source: &Path, target: &Path, use_symlinks: bool) -> EngineResult<()> {
    if use_symlinks {
        #[cfg(unix)]
        std::os::unix::fs::symlink(source, target)?;
        #[cfg(not(unix))]
        fs::copy(source, target).map(|_| ())?;
    } else {
        fs::copy(source, target)?;
    }
    Ok(())
}

fn absolute_existing(path: &Path) -> EngineResult<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if !abs.is_file() {
        return Err(EngineError::FileNotFound { path: abs });
    }
    Ok(abs)
}
