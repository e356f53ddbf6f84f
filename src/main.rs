use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, warn};

mod blockchain;
mod cli;
mod config;

fn main() {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // First interrupt cancels mining, a second one exits immediately
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        warn!("Interrupt received, cancelling mining");
    }) {
        warn!("Failed to install interrupt handler: {}", e);
    }

    let cli = cli::Cli::parse();
    if let Err(err) = cli::run(cli, cancel) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
