//! Example server: serves `add`, `echo`, `print` and `fail` until SIGINT or
//! SIGTERM.

#![allow(clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mrpc::config::ConfigFile;
use mrpc::{MethodError, ServerBuilder};
use tracing::info;

#[derive(Parser)]
#[command(about = "Example MessagePack-RPC server")]
struct Cli {
    /// Configuration file.
    #[arg(long, short = 'f', default_value = "mrpc.toml")]
    config_file: PathBuf,

    /// Configuration name.
    #[arg(long, short = 'n', default_value = "example")]
    config_name: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_file = match ConfigFile::load(&cli.config_file) {
        Ok(config_file) => config_file,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let logging = match config_file.logging_config(&cli.config_name) {
        Ok(logging) => logging.clone(),
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::FAILURE;
        }
    };
    let _logger_guard = match mrpc_log::init(&logging) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to set up logging: {error:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &config_file) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = format!("{error:#}"), "Server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config_file: &ConfigFile) -> anyhow::Result<()> {
    let server_config = config_file.server_config(&cli.config_name)?.clone();

    let server = ServerBuilder::from_config(server_config)
        .method("add", |(x, y): (i32, i32)| Ok(x + y))
        .method("echo", |(text,): (String,)| Ok(text))
        .method("print", |(text,): (String,)| {
            info!("message: {text}");
            Ok(())
        })
        .method("fail", |(value,): (i64,)| -> Result<(), MethodError> {
            Err(MethodError::with_payload(&value))
        })
        .build()?;

    let uris: Vec<String> = server.local_uris().iter().map(ToString::to_string).collect();
    info!(?uris, "Serving");

    server.run_until_signal()?;

    Ok(())
}
