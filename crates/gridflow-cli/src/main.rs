mod cli;
mod restart;
mod transfers;

use clap::Parser;
use eyre::Result;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(dir) = &cli.config_dir {
        gridflow_core::config::set_config_dir(dir);
    }

    match &cli.command {
        Commands::Put(args) => transfers::run_put(args)?,
        Commands::Get(args) => transfers::run_get(args)?,
        Commands::Restart { command } => restart::run(command)?,
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}
