use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = phase_ledger_cli::Cli::parse();
    phase_ledger_cli::init_tracing(cli.log_json);
    match phase_ledger_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("{}", phase_ledger_cli::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
