//! Sluice CLI
//!
//! Runs and checks job scripts against the local table store and the
//! configured remote orgs.

use sluice_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
