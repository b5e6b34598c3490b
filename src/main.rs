//! arcpress CLI entry point.
//!
//! Parses arguments, runs the command and turns failures into a message on
//! stderr and an exit code: 1 for a failed update, 2 when a rollback failed and
//! the installation needs manual recovery.

use arcpress::cli;
use arcpress::core::user_friendly_error;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    if let Err(e) = cli.execute().await {
        let error_ctx = user_friendly_error(e);
        error_ctx.display();
        std::process::exit(error_ctx.exit_code());
    }
}
