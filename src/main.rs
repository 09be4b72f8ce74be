//! Tracker launcher.

use colored::Colorize;
use picoballoon::generate_error_string;
use tracing::info;

/// Program entry point.
fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("picoballoon {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = picoballoon::run() {
        print!(
            "{}",
            generate_error_string(&e, "Error running the tracker").red()
        );
        std::process::exit(1);
    }
}
