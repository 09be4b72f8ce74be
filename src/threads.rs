//! Application threads module.
//!
//! The beacon, image, log and receiver threads each loop on their own
//! cycle, pull snapshots from the collector, compose packets through the
//! codec and hand them to the radio manager. [`spawn_all`] wires the whole
//! tracker together from a configuration and a set of device fixtures.

#![allow(missing_debug_implementations)]

pub mod beacon;
pub mod image;
pub mod log_tx;
pub mod receiver;

use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context, Error};
use tracing::{info, warn};

use crate::{
    collector::{self, CollectorHandle, CollectorParams},
    config::Config,
    dispatch::{Dispatcher, HeardList},
    error,
    geofence::Frequency,
    logring::LogRing,
    packet::{PacketPool, DEFAULT_CAPACITY},
    radio::{self, Priority, RadioHandle, RadioParams, RadioTask, Transceiver},
    sensors::{Camera, SensorSuite},
    telemetry::DataPoint,
    watchdog::{Heartbeat, Watchdog},
};

/// Granularity of interruptible sleeps.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Sleeps for `duration` in slices, feeding the heartbeat, and returns
/// `false` as soon as shutdown is requested.
pub(crate) fn pause(shutdown: &AtomicBool, heartbeat: &Heartbeat, duration: Duration) -> bool {
    let mut remaining = duration;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        heartbeat.beat();
        if remaining.is_zero() {
            return true;
        }
        let slice = remaining.min(PAUSE_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

/// The optional per-thread sleep condition: skip the cycle while the
/// battery is below the threshold. Zero disables the check.
pub(crate) fn duty_allowed(sleep_vbat_mv: u16, point: &DataPoint) -> bool {
    sleep_vbat_mv == 0 || point.vbat_mv() >= sleep_vbat_mv
}

/// Our own callsign in addressee form.
pub(crate) fn own_addressee(config: &Config) -> String {
    if config.ssid() == 0 {
        config.callsign().to_owned()
    } else {
        format!("{}-{}", config.callsign(), config.ssid())
    }
}

/// Builds one UI frame from an info field, allocates it from the pool and
/// transmits it, blocking until the radio is done.
pub(crate) fn transmit_info(
    config: &Config,
    pool: &PacketPool,
    radio: &RadioHandle,
    info: Vec<u8>,
    priority: Priority,
) -> Result<(), Error> {
    let source = crate::ax25::Address::new(config.callsign(), config.ssid())?;
    let destination = crate::ax25::Address::new(config.destination(), 0)?;
    let path = config
        .path_entries()
        .iter()
        .filter_map(|entry| entry.parse().ok())
        .collect();

    let packet = crate::ax25::Packet::new(source, destination, path, info)?;
    let handle = pool
        .allocate(packet)
        .ok_or(error::Pool::Exhausted)
        .context("dropping frame")?;

    let radio_config = config.radio();
    let task = RadioTask {
        packet: handle,
        frequency: Frequency::Dynamic,
        power: radio_config.power(),
        modulation: radio_config.modulation(),
        cca_rssi_dbm: radio_config.cca_rssi_dbm(),
        preamble: radio_config.preamble(),
        priority,
        timeout: Duration::from_secs(radio_config.tx_timeout_s()),
        done: None,
        cancel: None,
    };
    radio.transmit_blocking(task)?;
    Ok(())
}

/// Device fixtures the tracker runs against: real drivers in flight,
/// simulated ones on the bench.
pub struct Fixtures {
    /// The sensor suite for the collector.
    pub suite: SensorSuite,
    /// The camera for the image thread.
    pub camera: Box<dyn Camera>,
    /// The transceiver for the radio manager.
    pub transceiver: Box<dyn Transceiver>,
}

/// A running tracker.
pub struct Runtime {
    /// Collector handle.
    pub collector: CollectorHandle,
    /// Radio manager handle.
    pub radio: RadioHandle,
    /// The packet pool every transmitter allocates from.
    pub pool: PacketPool,
    /// Directly heard stations.
    pub heard: Arc<HeardList>,
    /// Raised by a received `REBOOT` command.
    pub reboot: Arc<AtomicBool>,
    /// Raised when the watchdog fired.
    pub watchdog_fired: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    watchdog: Watchdog,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Checks whether anything asked for a restart.
    pub fn restart_requested(&self) -> bool {
        self.reboot.load(Ordering::Acquire) || self.watchdog_fired.load(Ordering::Acquire)
    }

    /// Stops every thread and joins them.
    pub fn shutdown(mut self) {
        info!("shutting down");
        self.shutdown.store(true, Ordering::Release);
        self.watchdog.stop();
        self.radio.shutdown();
        self.collector.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("a worker thread panicked during shutdown");
            }
        }
    }
}

/// Wires up the collector, radio manager and every application thread.
pub fn spawn_all(config: Arc<Config>, fixtures: Fixtures) -> Result<Runtime, Error> {
    fs::create_dir_all(config.data_dir()).context(error::Logic::Init)?;

    let ring = LogRing::open(
        config.data_dir().join(config.ring().file_name()),
        config.ring().slots(),
    )
    .context(error::Logic::Init)?;

    let collector_config = config.collector();
    let (collector, collector_worker) = collector::spawn(
        fixtures.suite,
        ring,
        CollectorParams {
            cycle: Duration::from_secs(collector_config.cycle_s()),
            freshness: Duration::from_secs(collector_config.freshness_s()),
            gps_timeout: Duration::from_secs(collector_config.gps_timeout_s()),
            gps_poll: Duration::from_millis(100),
            gps_stay_on: collector_config.gps_stay_on(),
            gps_on_vbat_mv: collector_config.gps_on_vbat_mv(),
            gps_off_vbat_mv: collector_config.gps_off_vbat_mv(),
            gps_onper_vbat_mv: collector_config.gps_onper_vbat_mv(),
            log_fallback_window: Duration::from_secs(collector_config.log_fallback_window_s()),
        },
    );

    let (rx_tx, rx_frames) = mpsc::channel();
    let radio_config = config.radio();
    let position_collector = collector.clone();
    let (radio, radio_worker) = radio::spawn(
        fixtures.transceiver,
        RadioParams {
            cca_max_retries: radio_config.cca_max_retries(),
            cooldown: Duration::from_secs(radio_config.cooldown_s()),
            default_frequency_hz: radio_config.default_frequency_hz(),
            rx_frequency_hz: radio_config.rx_frequency_hz(),
        },
        Arc::new(move || position_collector.latest()),
        rx_tx,
    );

    let pool = PacketPool::new(DEFAULT_CAPACITY);
    let heard = Arc::new(HeardList::new(Duration::from_secs(
        config.aprs().aprsd_window_s(),
    )));
    let dispatcher = Dispatcher::new(
        Arc::clone(&config),
        pool.clone(),
        radio.clone(),
        collector.clone(),
        Arc::clone(&heard),
    );
    let reboot = dispatcher.reboot_flag();

    let shutdown = Arc::new(AtomicBool::new(false));
    let watchdog = Watchdog::new(Duration::from_secs(config.watchdog().timeout_s()));
    let watchdog_fired = Arc::new(AtomicBool::new(false));
    let monitor = {
        let fired = Arc::clone(&watchdog_fired);
        let shutdown = Arc::clone(&shutdown);
        watchdog.spawn(move |_name| {
            fired.store(true, Ordering::Release);
            shutdown.store(true, Ordering::Release);
        })
    };

    let mut workers = vec![collector_worker, radio_worker, monitor];

    let beacon = beacon::Beacon {
        config: Arc::clone(&config),
        collector: collector.clone(),
        radio: radio.clone(),
        pool: pool.clone(),
        heard: Arc::clone(&heard),
        heartbeat: watchdog.register("beacon"),
        shutdown: Arc::clone(&shutdown),
        cycle: Duration::from_secs(config.beacon().cycle_s()),
        tel_enc_cycle: Duration::from_secs(config.beacon().tel_enc_cycle_s()),
        config_spacing: Duration::from_secs(5),
    };
    workers.push(
        std::thread::Builder::new()
            .name("beacon".to_owned())
            .spawn(move || beacon::run(beacon))
            .context(error::Logic::Spawn)?,
    );

    let image = image::Image {
        config: Arc::clone(&config),
        collector: collector.clone(),
        radio: radio.clone(),
        pool: pool.clone(),
        camera: fixtures.camera,
        heartbeat: watchdog.register("image"),
        shutdown: Arc::clone(&shutdown),
        cycle: Duration::from_secs(config.image().cycle_s()),
    };
    workers.push(
        std::thread::Builder::new()
            .name("image".to_owned())
            .spawn(move || image::run(image))
            .context(error::Logic::Spawn)?,
    );

    let log_tx = log_tx::LogTx {
        config: Arc::clone(&config),
        collector: collector.clone(),
        radio: radio.clone(),
        pool: pool.clone(),
        heartbeat: watchdog.register("log"),
        shutdown: Arc::clone(&shutdown),
        cycle: Duration::from_secs(config.log_tx().cycle_s()),
        cursor_path: config.data_dir().join("log_cursor"),
    };
    workers.push(
        std::thread::Builder::new()
            .name("log".to_owned())
            .spawn(move || log_tx::run(log_tx))
            .context(error::Logic::Spawn)?,
    );

    let receiver = receiver::Receiver {
        frames: rx_frames,
        dispatcher,
        heartbeat: watchdog.register("receiver"),
        shutdown: Arc::clone(&shutdown),
    };
    workers.push(
        std::thread::Builder::new()
            .name("receiver".to_owned())
            .spawn(move || receiver::run(receiver))
            .context(error::Logic::Spawn)?,
    );

    info!(
        "tracker up: callsign {}, beacon every {} s",
        own_addressee(&config),
        config.beacon().cycle_s()
    );

    Ok(Runtime {
        collector,
        radio,
        pool,
        heard,
        reboot,
        watchdog_fired,
        shutdown,
        watchdog,
        workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::CollectorParams,
        radio::SimTransceiver,
        sensors::{self, SimCamera},
        telemetry::DataPoint,
    };
    use std::{thread, time::Instant};

    fn wait_for_transmissions(trx: &SimTransceiver, count: usize) -> Vec<radio::SimTx> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let sent = trx.transmissions();
            if sent.len() >= count {
                return sent;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {count} transmissions");
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// The sleep condition skips cycles only below the threshold.
    #[test]
    fn duty_condition() {
        let mut point = DataPoint::empty(1);
        point.adc_vbat = 3000;
        assert!(duty_allowed(0, &point));
        assert!(duty_allowed(2900, &point));
        assert!(!duty_allowed(3100, &point));
    }

    /// First beacon cycle on a fresh boot: the four telemetry configuration
    /// PDUs go out before the position packet, the position rides on the
    /// regional frequency for the fix, and the APRSD summary follows.
    #[test]
    fn beacon_scenario_initial_boot() {
        let config = Arc::new(Config::default());
        let trx = SimTransceiver::new();
        let (suite, _gps, _power, _adc) = sensors::bench_suite();

        let ring_path = std::env::temp_dir().join(format!(
            "picoballoon-beacon-{}",
            std::process::id()
        ));
        let _ = fs::remove_file(&ring_path);
        let ring = LogRing::open(&ring_path, 16).unwrap();
        let (collector_handle, collector_worker) = collector::spawn(
            suite,
            ring,
            CollectorParams {
                cycle: Duration::from_secs(600),
                freshness: Duration::ZERO,
                gps_timeout: Duration::from_secs(1),
                gps_poll: Duration::from_millis(5),
                gps_stay_on: false,
                gps_on_vbat_mv: 3300,
                gps_off_vbat_mv: 2500,
                gps_onper_vbat_mv: 2800,
                log_fallback_window: Duration::from_secs(3600),
            },
        );

        let (rx_tx, _rx_frames) = mpsc::channel();
        let position_collector = collector_handle.clone();
        let (radio_handle, radio_worker) = radio::spawn(
            Box::new(trx.clone()),
            RadioParams {
                cca_max_retries: 5,
                cooldown: Duration::from_millis(1),
                default_frequency_hz: 144_800_000,
                rx_frequency_hz: 144_800_000,
            },
            Arc::new(move || position_collector.latest()),
            rx_tx,
        );

        let pool = PacketPool::new(DEFAULT_CAPACITY);
        let heard = Arc::new(HeardList::new(Duration::from_secs(600)));
        heard.insert("DK3SB".to_owned());
        let shutdown = Arc::new(AtomicBool::new(false));
        let watchdog = Watchdog::new(Duration::from_secs(60));

        let beacon = beacon::Beacon {
            config: Arc::clone(&config),
            collector: collector_handle.clone(),
            radio: radio_handle.clone(),
            pool,
            heard,
            heartbeat: watchdog.register("beacon"),
            shutdown: Arc::clone(&shutdown),
            cycle: Duration::from_millis(50),
            tel_enc_cycle: Duration::from_secs(3600),
            config_spacing: Duration::from_millis(1),
        };
        let beacon_worker = thread::spawn(move || beacon::run(beacon));

        let sent = wait_for_transmissions(&trx, 6);
        shutdown.store(true, Ordering::Release);
        beacon_worker.join().unwrap();
        radio_handle.shutdown();
        radio_worker.join().unwrap();
        collector_handle.shutdown();
        collector_worker.join().unwrap();
        let _ = fs::remove_file(&ring_path);

        let frames: Vec<_> = sent
            .iter()
            .map(|tx| radio::decode_afsk_airstream(&tx.bits))
            .collect();
        let infos: Vec<String> = frames
            .iter()
            .map(|frame| String::from_utf8_lossy(&frame.info).into_owned())
            .collect();

        // Telemetry configuration group precedes the first position packet.
        assert!(infos[0].contains("PARM."), "got {infos:?}");
        assert!(infos[1].contains("UNIT."));
        assert!(infos[2].contains("EQNS."));
        assert!(infos[3].contains("BITS."));
        assert!(infos[4].starts_with('!'), "expected a position: {}", infos[4]);
        assert!(infos[5].contains("Directs=DK3SB"));

        // The bench fix is in North America, so everything rides 144.390.
        assert_eq!(sent[4].hz, 144_390_000);
        assert_eq!(frames[4].source.to_string(), "DL7AD-12");
        assert_eq!(frames[4].path[0].to_string(), "WIDE1-1");
    }

    /// The full wiring comes up and shuts down cleanly.
    #[test]
    fn spawn_all_smoke() {
        let data_dir = std::env::temp_dir().join(format!(
            "picoballoon-spawnall-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&data_dir);

        let mut rendered = toml::to_string(&Config::default()).unwrap();
        rendered = rendered.replace("data_dir = \"data\"", &format!("data_dir = \"{}\"", data_dir.display()));
        let config: Config = toml::from_str(&rendered).unwrap();

        let (suite, _gps, _power, _adc) = sensors::bench_suite();
        let trx = SimTransceiver::new();
        let runtime = spawn_all(
            Arc::new(config),
            Fixtures {
                suite,
                camera: Box::new(SimCamera),
                transceiver: Box::new(trx),
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert!(!runtime.restart_requested());
        assert!(data_dir.join("logring.bin").exists());
        runtime.shutdown();

        let _ = fs::remove_dir_all(&data_dir);
    }
}
