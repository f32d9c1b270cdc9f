use std::process::ExitCode;

use beach_cast::app;
use beach_cast::cli::Cli;
use beach_cast::error::CliError;
use beach_cast::telemetry::logging;
use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("{}", CliError::Logging(err.to_string()));
        return ExitCode::FAILURE;
    }

    match app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "beach_cast::app", error = %err, "broadcaster exited");
            eprintln!("❌ {err}");
            ExitCode::FAILURE
        }
    }
}
