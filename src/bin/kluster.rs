//! kluster binary entry point

use std::process::ExitCode;

use clap::Parser;
use kluster::cli::Cli;
use kluster::{format_error, Error};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(error) => eprintln!("{}", format_error(error)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
