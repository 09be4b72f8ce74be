//! Error module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that happened in a certain part of the logic.
#[derive(Debug, Clone, Copy, Error)]
pub enum Logic {
    /// Initialization error.
    #[error("there was an error during the initialization")]
    Init,
    /// Error spawning one of the application threads.
    #[error("there was an error spawning the application threads")]
    Spawn,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum Config {
    /// Error opening the configuration file.
    #[error("error opening the configuration file at '{}'", path.display())]
    Open {
        /// The path of the configuration file.
        path: PathBuf,
    },
    /// Error reading the configuration file.
    #[error("error reading the configuration file at '{}'", path.display())]
    Read {
        /// The path of the configuration file.
        path: PathBuf,
    },
    /// Invalid TOML found in the configuration file.
    #[error("invalid TOML found in the configuration file at '{}'", path.display())]
    InvalidToml {
        /// The path of the configuration file.
        path: PathBuf,
    },
    /// Invalid configuration options.
    #[error("the configuration is invalid:\n{errors}")]
    Invalid {
        /// The list of errors in the configuration.
        errors: String,
    },
    /// Error writing the configuration back to storage.
    #[error("error writing the configuration file at '{}'", path.display())]
    Write {
        /// The path of the configuration file.
        path: PathBuf,
    },
}

/// Errors reported by the data collector and the sensor façade.
#[derive(Debug, Clone, Error)]
pub enum Collector {
    /// A sensor could not be read over the bus.
    #[error("sensor bus error reading '{sensor}'")]
    SensorBus {
        /// The sensor that failed.
        sensor: &'static str,
    },
    /// The GPS did not answer on its serial link.
    #[error("GPS communication error")]
    Gps,
    /// The collector thread is gone and cannot answer requests.
    #[error("the data collector is not running")]
    NotRunning,
}

/// Errors raised by the log ring.
#[derive(Debug, Error)]
pub enum Ring {
    /// Error opening the log ring storage.
    #[error("error opening the log ring storage at '{}'", path.display())]
    Open {
        /// Path of the backing storage.
        path: PathBuf,
    },
    /// I/O error accessing a slot.
    #[error("I/O error accessing log ring slot {slot}")]
    SlotIo {
        /// The slot that failed.
        slot: usize,
    },
}

/// Errors raised by the APRS / AX.25 codec.
#[derive(Debug, Clone, Error)]
pub enum Codec {
    /// The encoded info field would exceed the AX.25 limit.
    #[error("packet info field would be {len} bytes, over the {max} byte limit")]
    PacketTooLong {
        /// The length that was requested.
        len: usize,
        /// The maximum length allowed.
        max: usize,
    },
    /// A callsign is empty or longer than six characters.
    #[error("invalid callsign '{call}'")]
    InvalidCall {
        /// The offending callsign.
        call: String,
    },
    /// The digipeater path has more than eight entries.
    #[error("digipeater path has {len} entries, over the limit of 8")]
    PathTooLong {
        /// The number of entries requested.
        len: usize,
    },
    /// A received frame was too short to carry an AX.25 UI header.
    #[error("received frame of {len} bytes is too short")]
    FrameTooShort {
        /// The received length.
        len: usize,
    },
    /// A received frame failed its FCS check.
    #[error("frame check sequence mismatch")]
    BadFcs,
    /// A received frame is not an AX.25 UI frame.
    #[error("unsupported frame type (control {control:#04x}, pid {pid:#04x})")]
    NotUi {
        /// The control byte found.
        control: u8,
        /// The PID byte found.
        pid: u8,
    },
}

/// Errors raised by the radio manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Radio {
    /// The channel stayed busy through all CCA retries.
    #[error("channel busy after clear channel assessment retries")]
    ChannelBusy,
    /// The transceiver failed and was reset.
    #[error("transceiver hardware failure")]
    Hardware,
    /// The task was not served before its deadline.
    #[error("radio task timed out")]
    Timeout,
    /// The task was cancelled before transmission started.
    #[error("radio task cancelled")]
    Cancelled,
    /// The radio manager worker is gone.
    #[error("the radio manager is not running")]
    NotRunning,
}

/// Errors raised by the packet pool.
#[derive(Debug, Clone, Copy, Error)]
pub enum Pool {
    /// No free packet buffer was available.
    #[error("the packet pool is exhausted")]
    Exhausted,
}

/// Errors raised by the watchdog.
#[derive(Debug, Clone, Error)]
pub enum Watchdog {
    /// A registered thread missed its heartbeat window.
    #[error("thread '{name}' missed its heartbeat")]
    MissedHeartbeat {
        /// Name the thread registered under.
        name: String,
    },
}
