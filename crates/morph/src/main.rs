//! morph builds Linux system images from declarative morphology
//! definitions, locally or across a fleet of workers.

// The CLI prints to stdout/stderr by design.
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod commands;
mod config;

use crate::cli::{Cli, EXIT_INTERNAL, EXIT_OK, EXIT_USAGE, exit_code_for, render_error};
use clap::Parser;

/// Exit code for SIGINT (128 + signal number 2).
const EXIT_SIGINT: i32 = 130;

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("morph panicked: {panic_info}");
        eprintln!("internal error; run with RUST_LOG=debug for more detail");
        std::process::exit(EXIT_INTERNAL);
    }));
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are successes, everything else is usage.
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            return code;
        }
    };
    cli.init_tracing();

    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            EXIT_SIGINT
        }
        result = commands::dispatch(cli) => {
            match result {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    render_error(&e);
                    exit_code_for(&e)
                }
            }
        }
    }
}
