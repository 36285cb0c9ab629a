//! Example client: exercises calls, notifications and server-side errors.

#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use mrpc::config::ConfigFile;
use mrpc::{ClientBuilder, ErrorKind};
use tracing::info;

#[derive(Parser)]
#[command(about = "Example MessagePack-RPC client")]
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
            tracing::error!(error = format!("{error:#}"), "Client failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config_file: &ConfigFile) -> anyhow::Result<()> {
    let client_config = config_file.client_config(&cli.config_name)?.clone();

    let client = ClientBuilder::from_config(client_config).build()?;
    client.wait_until_connected(Duration::from_secs(10))?;

    // A call with a result.
    let sum: i32 = client.call("add", (2, 3))?;
    info!(sum, "add(2, 3)");
    println!("add(2, 3) = {sum}");

    // Echo a string back.
    let echoed: String = client.call("echo", ("hello",))?;
    println!("echo(\"hello\") = {echoed:?}");

    // A notification: no response, best-effort.
    client.notify("print", ("hello from the example client",))?;

    // A server-side failure carrying a structured payload.
    let error = client
        .call::<()>("fail", (42_i64,))
        .expect_err("the fail method always fails");
    assert_eq!(error.kind(), ErrorKind::ServerError);
    println!(
        "fail(42) failed as expected with payload {}",
        error.project_payload::<i64>()?
    );

    client.stop();

    Ok(())
}
