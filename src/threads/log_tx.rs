//! Log transmitter thread.
//!
//! Walks the log ring from a persisted cursor, packs a few records into one
//! base91 APRS packet and advances the cursor once the packet is on the
//! air.

use std::{
    fs,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    aprs,
    collector::CollectorHandle,
    config::Config,
    logring,
    packet::PacketPool,
    radio::{Priority, RadioHandle},
    threads::{pause, transmit_info},
    watchdog::Heartbeat,
};

/// User-defined APRS packet marker for packed log records.
const LOG_PREFIX: &[u8] = b"{{L";

/// Log thread context.
pub struct LogTx {
    /// Tracker configuration.
    pub config: Arc<Config>,
    /// Collector handle (the ring is read through it).
    pub collector: CollectorHandle,
    /// Radio manager handle.
    pub radio: RadioHandle,
    /// Packet pool.
    pub pool: PacketPool,
    /// Watchdog heartbeat.
    pub heartbeat: Heartbeat,
    /// Shutdown flag.
    pub shutdown: Arc<AtomicBool>,
    /// Log cycle.
    pub cycle: Duration,
    /// Where the cursor survives restarts.
    pub cursor_path: PathBuf,
}

fn load_cursor(path: &PathBuf) -> u32 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn store_cursor(path: &PathBuf, id: u32) {
    if let Err(e) = fs::write(path, id.to_string()) {
        warn!("could not persist log cursor: {e}");
    }
}

/// Log thread body.
pub fn run(log: LogTx) {
    let mut last_sent = load_cursor(&log.cursor_path);
    let batch = usize::from(log.config.log_tx().records_per_packet());

    loop {
        if !pause(&log.shutdown, &log.heartbeat, log.cycle) {
            return;
        }

        // Collect the next unsent records in insertion order.
        let mut records = Vec::new();
        let mut index = 0;
        loop {
            match log.collector.get_log(index) {
                Ok(Some(point)) => {
                    if point.id > last_sent {
                        records.push(point);
                        if records.len() == batch {
                            break;
                        }
                    }
                    index += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("log read failed: {e}");
                    break;
                }
            }
        }

        let Some(newest) = records.last().map(|point| point.id) else {
            debug!("no new log records to transmit");
            continue;
        };

        let mut payload = Vec::with_capacity(records.len() * logring::RECORD_LEN);
        for point in &records {
            payload.extend_from_slice(&logring::pack_record(point));
        }
        let mut info = LOG_PREFIX.to_vec();
        info.extend_from_slice(aprs::base91_encode_bytes(&payload).as_bytes());

        match transmit_info(&log.config, &log.pool, &log.radio, info, Priority::Image) {
            Ok(()) => {
                info!(
                    "transmitted {} log records up to id {}",
                    records.len(),
                    newest
                );
                last_sent = newest;
                store_cursor(&log.cursor_path, last_sent);
            }
            Err(e) => warn!("log transmission failed: {e:#}"),
        }
    }
}
