use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "extopt", version, about = "Evaluation-coordination engine command surface")]
pub struct Cli {
    #[arg(long, global = true, default_value = "info")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the built-in demo problem through an exterior-penalty loop.
    Optimize {
        /// Path to a driver config TOML file (ambient settings + demo variables).
        config: PathBuf,
        #[arg(long, default_value_t = 50)]
        iters: usize,
        #[arg(long, default_value_t = 0.1)]
        step: f64,
    },
    /// Parse and print a driver config file without running anything.
    ShowConfig { config: PathBuf },
}
