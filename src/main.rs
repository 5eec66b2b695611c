use clap::error::ErrorKind;
use clap::Parser;
use simdock::cli::{normalize_args, Cli};
use simdock::commands::{dispatch, report_error, Context};
use simdock::runner::{RealRunner, SystemProbe};
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    simdock::init_tracing();
    let cli = match Cli::try_parse_from(normalize_args(env::args())) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    let ctx = Context::from_cli(&cli);
    match dispatch(&ctx, cli.command, &SystemProbe, &RealRunner) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(ctx.json, &err);
            ExitCode::FAILURE
        }
    }
}
