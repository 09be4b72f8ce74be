//! Picoballoon tracker software.
//!
//! This crate provides the core of a high-altitude balloon APRS tracker: a
//! data collector sampling GPS, power and environment sensors into
//! timestamped snapshots, a persistent log ring, the APRS/AX.25 codec, the
//! radio manager serialising access to the single transceiver, and the
//! application threads (position beacon, SSDV image transmitter, log
//! transmitter, receive dispatcher with digipeater).
//!
//! ## Configuration
//!
//! The tracker is configured through `config.toml`. Please refer to the
//! [`config`](config/index.html) module for further information; a missing
//! or invalid file falls back to the compile-time defaults.
//!
//! ## Launcher
//!
//! The project has a launcher in `src/main.rs` and can be started with
//! `cargo run`. The launcher runs against the deterministic bench devices;
//! flight builds plug the real drivers into the same
//! [`threads::Fixtures`] seams.

#![deny(clippy::all)]
#![forbid(anonymous_parameters)]
#![warn(clippy::pedantic)]
#![deny(
    variant_size_differences,
    unused_results,
    unused_qualifications,
    unused_import_braces,
    trivial_numeric_casts,
    missing_docs,
    unused_extern_crates
)]
#![allow(clippy::use_self, clippy::missing_errors_doc)]

/// Configuration file.
pub const CONFIG_FILE: &str = "config.toml";

pub mod aprs;
pub mod ax25;
pub mod cli;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geofence;
pub mod logring;
pub mod packet;
pub mod radio;
pub mod sensors;
pub mod ssdv;
pub mod telemetry;
pub mod threads;
pub mod watchdog;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Error};
use tracing::warn;

use crate::{
    config::Config,
    radio::SimTransceiver,
    sensors::SimCamera,
    threads::Fixtures,
};

/// The main logic of the program: load the configuration, wire up the
/// tracker against the bench devices, run the console, and supervise until
/// a restart is requested.
pub fn run() -> Result<(), Error> {
    let config = Arc::new(Config::load_or_default(CONFIG_FILE));
    let (ok, errors) = config.verify();
    if !ok {
        return Err(error::Config::Invalid { errors }.into());
    }

    let (suite, _gps, _power, _adc) = sensors::bench_suite();
    let fixtures = Fixtures {
        suite,
        camera: Box::new(SimCamera),
        transceiver: Box::new(SimTransceiver::new()),
    };

    let runtime = threads::spawn_all(Arc::clone(&config), fixtures).context(error::Logic::Init)?;

    let quit = Arc::new(AtomicBool::new(false));
    let console = cli::Cli {
        config: Arc::clone(&config),
        collector: runtime.collector.clone(),
        radio: runtime.radio.clone(),
        pool: runtime.pool.clone(),
        heard: Arc::clone(&runtime.heard),
        camera: Box::new(SimCamera),
        quit: Arc::clone(&quit),
    };
    // The console blocks on stdin; it is not joined on shutdown.
    let _console = thread::Builder::new()
        .name("console".to_owned())
        .spawn(move || cli::run(console))
        .context(error::Logic::Spawn)?;

    loop {
        thread::sleep(Duration::from_millis(500));
        if quit.load(Ordering::Acquire) {
            break;
        }
        if runtime.restart_requested() {
            warn!("restart requested, shutting the tracker down");
            break;
        }
    }

    runtime.shutdown();
    Ok(())
}

/// Generates a stack trace string of an error.
pub fn generate_error_string<S>(error: &Error, main_error: S) -> String
where
    S: AsRef<str>,
{
    let mut result = format!("{}:\n{}\n", main_error.as_ref(), error);

    for cause in error.chain().skip(1) {
        result.push_str(&format!("\tcaused by: {cause}\n"));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The error string carries the whole cause chain.
    #[test]
    fn error_string_includes_causes() {
        let error = Error::new(error::Pool::Exhausted).context(error::Logic::Init);
        let rendered = generate_error_string(&error, "tracker failed");
        assert!(rendered.starts_with("tracker failed:\n"));
        assert!(rendered.contains("initialization"));
        assert!(rendered.contains("caused by: the packet pool is exhausted"));
    }
}
