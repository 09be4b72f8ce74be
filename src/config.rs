//! Configuration module.
//!
//! The configuration is read from a TOML file at boot. A missing, unreadable
//! or invalid file falls back to the compile-time defaults, so the tracker
//! always comes up with a usable configuration. Runtime modifications are
//! written back atomically with [`Config::save`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error, geofence, radio::Modulation};

/// Tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    callsign: String,
    ssid: u8,
    destination: String,
    path: String,
    symbol: String,
    data_dir: PathBuf,
    collector: CollectorConfig,
    beacon: BeaconConfig,
    image: ImageConfig,
    log_tx: LogTxConfig,
    radio: RadioConfig,
    digipeater: DigipeaterConfig,
    aprs: AprsConfig,
    ring: RingConfig,
    watchdog: WatchdogConfig,
}

/// Data collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    cycle_s: u64,
    freshness_s: u64,
    gps_timeout_s: u64,
    gps_stay_on: bool,
    gps_on_vbat_mv: u16,
    gps_off_vbat_mv: u16,
    gps_onper_vbat_mv: u16,
    log_fallback_window_s: u64,
}

/// Position beacon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    cycle_s: u64,
    tel_enc_cycle_s: u64,
    sleep_vbat_mv: u16,
    base_call: String,
}

/// Image transmitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    cycle_s: u64,
    continuous: bool,
    quality: u8,
    width: u16,
    height: u16,
    retries: u8,
    sleep_vbat_mv: u16,
}

/// Log transmitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogTxConfig {
    cycle_s: u64,
    records_per_packet: u8,
}

/// Radio manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    power: u8,
    modulation: String,
    preamble: u16,
    cca_rssi_dbm: i16,
    cca_max_retries: u8,
    tx_timeout_s: u64,
    cooldown_s: u64,
    default_frequency_hz: u32,
    rx_frequency_hz: u32,
}

/// Digipeater configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DigipeaterConfig {
    enabled: bool,
}

/// APRS dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AprsConfig {
    aprsd_window_s: u64,
    msg_dedup_window_s: u64,
    telemetry_title: String,
}

/// Log ring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    slots: usize,
    file_name: String,
}

/// Watchdog configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    timeout_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: "DL7AD".to_owned(),
            ssid: 12,
            destination: "APECAN".to_owned(),
            path: "WIDE1-1".to_owned(),
            symbol: "/O".to_owned(),
            data_dir: PathBuf::from("data"),
            collector: CollectorConfig::default(),
            beacon: BeaconConfig::default(),
            image: ImageConfig::default(),
            log_tx: LogTxConfig::default(),
            radio: RadioConfig::default(),
            digipeater: DigipeaterConfig::default(),
            aprs: AprsConfig::default(),
            ring: RingConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cycle_s: 60,
            freshness_s: 30,
            gps_timeout_s: 120,
            gps_stay_on: false,
            gps_on_vbat_mv: 3300,
            gps_off_vbat_mv: 2500,
            gps_onper_vbat_mv: 2800,
            log_fallback_window_s: 1800,
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            cycle_s: 120,
            tel_enc_cycle_s: 10800,
            sleep_vbat_mv: 0,
            base_call: String::new(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            cycle_s: 1800,
            continuous: false,
            quality: 4,
            width: 640,
            height: 480,
            retries: 3,
            sleep_vbat_mv: 0,
        }
    }
}

impl Default for LogTxConfig {
    fn default() -> Self {
        Self {
            cycle_s: 600,
            records_per_packet: 2,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            power: 0x7F,
            modulation: "afsk1200".to_owned(),
            preamble: 40,
            cca_rssi_dbm: -90,
            cca_max_retries: 5,
            tx_timeout_s: 30,
            cooldown_s: 5,
            default_frequency_hz: 144_800_000,
            rx_frequency_hz: 144_800_000,
        }
    }
}

impl Default for DigipeaterConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AprsConfig {
    fn default() -> Self {
        Self {
            aprsd_window_s: 600,
            msg_dedup_window_s: 30,
            telemetry_title: "picoballoon".to_owned(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            slots: 256,
            file_name: "logring.bin".to_owned(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { timeout_s: 60 }
    }
}

impl Config {
    /// Creates a new configuration object from a path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let contents = fs::read_to_string(path.as_ref()).context(error::Config::Read {
            path: path.as_ref().to_owned(),
        })?;

        let config: Config = toml::from_str(&contents).context(error::Config::InvalidToml {
            path: path.as_ref().to_owned(),
        })?;

        let (ok, errors) = config.verify();
        if ok {
            Ok(config)
        } else {
            Err(error::Config::Invalid { errors }.into())
        }
    }

    /// Loads the configuration from a path, falling back to the compile-time
    /// defaults if the file is missing or invalid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Config {
        match Config::from_file(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "could not load configuration from '{}' ({e:#}), using defaults",
                    path.as_ref().display()
                );
                Config::default()
            }
        }
    }

    /// Writes the configuration back atomically (write to a temporary file,
    /// then rename over the target).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let serialized = toml::to_string_pretty(self).context(error::Config::Write {
            path: path.as_ref().to_owned(),
        })?;
        let tmp = path.as_ref().with_extension("tmp");
        fs::write(&tmp, serialized).context(error::Config::Write { path: tmp.clone() })?;
        fs::rename(&tmp, path.as_ref()).context(error::Config::Write {
            path: path.as_ref().to_owned(),
        })?;
        Ok(())
    }

    /// Verify the correctness of the configuration, and return a list of errors if invalid.
    pub fn verify(&self) -> (bool, String) {
        let mut errors = String::new();
        let mut ok = true;

        if self.callsign.is_empty()
            || self.callsign.len() > 6
            || !self.callsign.chars().all(|c| c.is_ascii_alphanumeric())
        {
            ok = false;
            errors.push_str(&format!(
                "callsign must be 1-6 alphanumeric characters, found '{}'\n",
                self.callsign
            ));
        }
        if self.ssid > 15 {
            ok = false;
            errors.push_str(&format!("SSID must be 0-15, found {}\n", self.ssid));
        }
        if self.symbol.chars().count() != 2 {
            ok = false;
            errors.push_str(&format!(
                "symbol must be a table and a code character, found '{}'\n",
                self.symbol
            ));
        }
        let path_entries = self.path.split(',').filter(|e| !e.is_empty()).count();
        if path_entries > 8 {
            ok = false;
            errors.push_str(&format!(
                "digipeater path must have at most 8 entries, found {path_entries}\n"
            ));
        }

        if self.collector.gps_off_vbat_mv > self.collector.gps_onper_vbat_mv
            || self.collector.gps_onper_vbat_mv > self.collector.gps_on_vbat_mv
        {
            ok = false;
            errors.push_str(&format!(
                "GPS battery thresholds must be ordered off <= onper <= on, found {} / {} / {}\n",
                self.collector.gps_off_vbat_mv,
                self.collector.gps_onper_vbat_mv,
                self.collector.gps_on_vbat_mv
            ));
        }

        if Modulation::from_name(&self.radio.modulation).is_none() {
            ok = false;
            errors.push_str(&format!(
                "modulation must be 'afsk1200' or 'fsk9600', found '{}'\n",
                self.radio.modulation
            ));
        }
        if self.radio.power > 0x7F {
            ok = false;
            errors.push_str(&format!(
                "radio power must be 0-127, found {}\n",
                self.radio.power
            ));
        }
        if self.radio.cca_max_retries == 0 {
            ok = false;
            errors.push_str("CCA retry count must be at least 1\n");
        }
        if !geofence::in_any_band(self.radio.default_frequency_hz) {
            ok = false;
            errors.push_str(&format!(
                "default frequency {} Hz is outside the band plan\n",
                self.radio.default_frequency_hz
            ));
        }
        if !geofence::in_any_band(self.radio.rx_frequency_hz) {
            ok = false;
            errors.push_str(&format!(
                "receive frequency {} Hz is outside the band plan\n",
                self.radio.rx_frequency_hz
            ));
        }

        if self.image.quality > 7 {
            ok = false;
            errors.push_str(&format!(
                "image quality must be 0-7, found {}\n",
                self.image.quality
            ));
        }
        if self.log_tx.records_per_packet == 0 {
            ok = false;
            errors.push_str("log transmitter must pack at least 1 record per packet\n");
        }
        if self.ring.slots < 2 {
            ok = false;
            errors.push_str(&format!(
                "log ring must have at least 2 slots, found {}\n",
                self.ring.slots
            ));
        }
        if self.watchdog.timeout_s == 0 {
            ok = false;
            errors.push_str("watchdog timeout must be non-zero\n");
        }

        (ok, errors)
    }

    /// Gets the station callsign, without the SSID.
    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Gets the station SSID.
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Gets the AX.25 destination callsign.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Gets the digipeater path entries.
    pub fn path_entries(&self) -> Vec<&str> {
        self.path.split(',').filter(|e| !e.is_empty()).collect()
    }

    /// Gets the APRS symbol table character.
    pub fn symbol_table(&self) -> char {
        self.symbol.chars().next().unwrap_or('/')
    }

    /// Gets the APRS symbol code character.
    pub fn symbol_code(&self) -> char {
        self.symbol.chars().nth(1).unwrap_or('O')
    }

    /// Gets the configured data directory.
    pub fn data_dir(&self) -> &Path {
        self.data_dir.as_path()
    }

    /// Gets the data collector configuration.
    pub fn collector(&self) -> &CollectorConfig {
        &self.collector
    }

    /// Gets the position beacon configuration.
    pub fn beacon(&self) -> &BeaconConfig {
        &self.beacon
    }

    /// Gets the image transmitter configuration.
    pub fn image(&self) -> &ImageConfig {
        &self.image
    }

    /// Gets the log transmitter configuration.
    pub fn log_tx(&self) -> &LogTxConfig {
        &self.log_tx
    }

    /// Gets the radio manager configuration.
    pub fn radio(&self) -> &RadioConfig {
        &self.radio
    }

    /// Checks whether digipeating is enabled.
    pub fn digipeater_enabled(&self) -> bool {
        self.digipeater.enabled
    }

    /// Gets the APRS dispatcher configuration.
    pub fn aprs(&self) -> &AprsConfig {
        &self.aprs
    }

    /// Gets the log ring configuration.
    pub fn ring(&self) -> &RingConfig {
        &self.ring
    }

    /// Gets the watchdog configuration.
    pub fn watchdog(&self) -> &WatchdogConfig {
        &self.watchdog
    }
}

impl CollectorConfig {
    /// Gets the collector refresh cycle, in seconds.
    pub fn cycle_s(&self) -> u64 {
        self.cycle_s
    }

    /// Gets the snapshot freshness window, in seconds.
    pub fn freshness_s(&self) -> u64 {
        self.freshness_s
    }

    /// Gets the window to wait for a GPS fix, in seconds.
    pub fn gps_timeout_s(&self) -> u64 {
        self.gps_timeout_s
    }

    /// Checks whether the GPS stays powered after a fix.
    pub fn gps_stay_on(&self) -> bool {
        self.gps_stay_on
    }

    /// Gets the battery voltage above which the GPS may be powered on, in mV.
    pub fn gps_on_vbat_mv(&self) -> u16 {
        self.gps_on_vbat_mv
    }

    /// Gets the battery voltage below which the GPS stays off, in mV.
    pub fn gps_off_vbat_mv(&self) -> u16 {
        self.gps_off_vbat_mv
    }

    /// Gets the battery voltage below which a running GPS is powered off
    /// prematurely, in mV.
    pub fn gps_onper_vbat_mv(&self) -> u16 {
        self.gps_onper_vbat_mv
    }

    /// Gets the window after which a stale position degrades to the log
    /// fallback, in seconds.
    pub fn log_fallback_window_s(&self) -> u64 {
        self.log_fallback_window_s
    }
}

impl BeaconConfig {
    /// Gets the beacon cycle, in seconds.
    pub fn cycle_s(&self) -> u64 {
        self.cycle_s
    }

    /// Gets the telemetry configuration cycle, in seconds.
    pub fn tel_enc_cycle_s(&self) -> u64 {
        self.tel_enc_cycle_s
    }

    /// Gets the battery voltage below which the beacon skips a cycle, in mV.
    /// Zero disables the check.
    pub fn sleep_vbat_mv(&self) -> u16 {
        self.sleep_vbat_mv
    }

    /// Gets the base callsign the APRSD summary is addressed to. Empty means
    /// the summary goes to our own callsign.
    pub fn base_call(&self) -> &str {
        &self.base_call
    }
}

impl ImageConfig {
    /// Gets the image cycle, in seconds.
    pub fn cycle_s(&self) -> u64 {
        self.cycle_s
    }

    /// Checks whether the image thread loops without waiting for the cycle.
    pub fn continuous(&self) -> bool {
        self.continuous
    }

    /// Gets the SSDV quality level (0-7).
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Gets the configured picture width, in pixels.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Gets the configured picture height, in pixels.
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Gets the per-packet retry count.
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Gets the battery voltage below which the image thread skips a cycle,
    /// in mV. Zero disables the check.
    pub fn sleep_vbat_mv(&self) -> u16 {
        self.sleep_vbat_mv
    }
}

impl LogTxConfig {
    /// Gets the log transmitter cycle, in seconds.
    pub fn cycle_s(&self) -> u64 {
        self.cycle_s
    }

    /// Gets the number of log records packed into one packet.
    pub fn records_per_packet(&self) -> u8 {
        self.records_per_packet
    }
}

impl RadioConfig {
    /// Gets the transmit power level (0-127).
    pub fn power(&self) -> u8 {
        self.power
    }

    /// Gets the configured modulation.
    pub fn modulation(&self) -> Modulation {
        Modulation::from_name(&self.modulation).unwrap_or(Modulation::Afsk1200)
    }

    /// Gets the preamble length, in flag octets.
    pub fn preamble(&self) -> u16 {
        self.preamble
    }

    /// Gets the CCA threshold, in dBm. Zero disables CCA.
    pub fn cca_rssi_dbm(&self) -> i16 {
        self.cca_rssi_dbm
    }

    /// Gets the maximum number of CCA retries.
    pub fn cca_max_retries(&self) -> u8 {
        self.cca_max_retries
    }

    /// Gets the per-task transmission timeout, in seconds.
    pub fn tx_timeout_s(&self) -> u64 {
        self.tx_timeout_s
    }

    /// Gets the cooldown after a hardware failure, in seconds.
    pub fn cooldown_s(&self) -> u64 {
        self.cooldown_s
    }

    /// Gets the fallback APRS frequency, in Hz.
    pub fn default_frequency_hz(&self) -> u32 {
        self.default_frequency_hz
    }

    /// Gets the frequency the receiver listens on, in Hz.
    pub fn rx_frequency_hz(&self) -> u32 {
        self.rx_frequency_hz
    }
}

impl AprsConfig {
    /// Gets the window a directly heard station stays listed, in seconds.
    pub fn aprsd_window_s(&self) -> u64 {
        self.aprsd_window_s
    }

    /// Gets the window in which duplicate message numbers are absorbed, in
    /// seconds.
    pub fn msg_dedup_window_s(&self) -> u64 {
        self.msg_dedup_window_s
    }

    /// Gets the project title advertised in the telemetry BITS packet.
    pub fn telemetry_title(&self) -> &str {
        &self.telemetry_title
    }
}

impl RingConfig {
    /// Gets the number of slots in the log ring.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Gets the log ring file name inside the data directory.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl WatchdogConfig {
    /// Gets the heartbeat timeout, in seconds.
    pub fn timeout_s(&self) -> u64 {
        self.timeout_s
    }
}
