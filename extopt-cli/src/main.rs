mod cli;
mod demo;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(cli.log_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match &cli.command {
        Some(Commands::Optimize { config, iters, step }) => match demo::run_optimize(config, *iters, *step) {
            Ok(summary) => info!("{summary}"),
            Err(e) => error!("optimize failed: {e:#}"),
        },
        Some(Commands::ShowConfig { config }) => match demo::show_config(config) {
            Ok(()) => {}
            Err(e) => error!("show-config failed: {e:#}"),
        },
        None => {
            info!("No subcommand provided. Use `extopt --help` for more information.");
        }
    }
}
