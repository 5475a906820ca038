mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Commands};

/// Exit status for failures of cellbox itself, as opposed to the command.
const EXIT_RUNTIME_ERROR: u8 = 125;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.global.init_logging();

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, &cli.global).await,
    };

    match result {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
