mod cli;
mod ops;
mod storage;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use snapfreeze::logging::{self, Profile};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(Profile::from_flags(cli.verbose, cli.log_json));

    match cli.command {
        Commands::Backup { config, ask_password } => {
            ops::do_backup(&config, ask_password)?;
        }
        Commands::DryRun { config, ask_password } => {
            ops::do_dry_run(&config, ask_password)?;
        }
        Commands::Inspect { path } => {
            ops::do_inspect(&path)?;
        }
        Commands::Verify { backup_dir } => {
            ops::do_verify(&backup_dir)?;
        }
        Commands::List { config } => {
            ops::do_list(&config)?;
        }
        Commands::Version => {
            ops::do_version();
        }
    }

    Ok(())
}
