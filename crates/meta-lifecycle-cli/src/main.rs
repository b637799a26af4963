use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = meta_lifecycle_cli::Cli::parse();
    meta_lifecycle_cli::init_tracing(cli.quiet());
    match meta_lifecycle_cli::run_cli(cli) {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
