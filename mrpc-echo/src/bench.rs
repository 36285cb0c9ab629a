//! Self-contained echo benchmark: serves and calls in one process.

#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use mrpc::{ClientBuilder, ServerBuilder};

#[derive(Parser)]
#[command(about = "Round-trip benchmark against an in-process echo server")]
struct Cli {
    /// Number of round trips to measure.
    #[arg(long, default_value_t = 10_000)]
    requests: u32,

    /// Payload size in bytes.
    #[arg(long, default_value_t = 128)]
    payload_size: usize,
}

fn main() -> ExitCode {
    match run(&Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("benchmark failed: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let server = ServerBuilder::new()
        .method("echo", |(payload,): (String,)| Ok(payload))
        .listen_to("tcp://127.0.0.1:0")
        .build()?;

    let client = ClientBuilder::new()
        .connect_to(server.local_uris()[0].to_string())
        .build()?;
    client.wait_until_connected(Duration::from_secs(5))?;

    let payload = "x".repeat(cli.payload_size);

    // Warm up the connection and both pools.
    for _ in 0..100 {
        let _: String = client.call("echo", (payload.clone(),))?;
    }

    let started = Instant::now();
    for _ in 0..cli.requests {
        let echoed: String = client.call("echo", (payload.clone(),))?;
        debug_assert_eq!(echoed.len(), payload.len());
    }
    let elapsed = started.elapsed();

    let per_call = elapsed / cli.requests;
    let per_second = f64::from(cli.requests) / elapsed.as_secs_f64();
    println!(
        "{} round trips of {} bytes in {elapsed:?} ({per_call:?} per call, {per_second:.0}/s)",
        cli.requests, cli.payload_size,
    );

    client.stop();
    server.stop();

    Ok(())
}
