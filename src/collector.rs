//! Data collector module.
//!
//! One thread owns the sensor suite and the log ring, samples everything on
//! request (or on its own cycle), and publishes immutable [`DataPoint`]
//! snapshots. A sensor failure marks its status bit and never aborts the
//! cycle. On boot the newest log record seeds the position of last resort.

#![allow(missing_debug_implementations)]

use std::{
    sync::{mpsc, Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    error,
    logring::LogRing,
    sensors::SensorSuite,
    telemetry::{BmeSlot, BmeStatus, DataPoint, GpsState, SysError},
};

/// What a snapshot requester needs from this cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerIntent {
    /// The caller wants a position, so the GPS should run if the battery
    /// allows it.
    pub needs_gps: bool,
}

/// Collector tuning knobs, lifted out of the configuration.
#[derive(Debug, Clone)]
pub struct CollectorParams {
    /// Unsolicited refresh cycle.
    pub cycle: Duration,
    /// Snapshots older than this are refreshed before replying.
    pub freshness: Duration,
    /// Window to wait for a GPS fix.
    pub gps_timeout: Duration,
    /// Interval between fix polls.
    pub gps_poll: Duration,
    /// Keep the GPS powered after a fix.
    pub gps_stay_on: bool,
    /// Battery voltage above which the GPS may be powered on, in mV.
    pub gps_on_vbat_mv: u16,
    /// Battery voltage below which the GPS stays off, in mV.
    pub gps_off_vbat_mv: u16,
    /// Battery voltage below which a running GPS is powered off early, in mV.
    pub gps_onper_vbat_mv: u16,
    /// Without a live fix for this long, the position degrades to the log
    /// fallback state.
    pub log_fallback_window: Duration,
}

enum Request {
    Snapshot {
        intent: CallerIntent,
        reply: mpsc::Sender<Arc<DataPoint>>,
    },
    GetLog {
        index: usize,
        reply: mpsc::Sender<Option<DataPoint>>,
    },
    OfferAprsFix {
        lat: i32,
        lon: i32,
    },
    Shutdown,
}

struct Shared {
    latest: Mutex<Option<Arc<DataPoint>>>,
    cond: Condvar,
}

/// Cloneable handle to the collector thread.
#[derive(Clone)]
pub struct CollectorHandle {
    tx: mpsc::Sender<Request>,
    shared: Arc<Shared>,
}

impl CollectorHandle {
    /// Requests a snapshot, refreshing first if the latest one is stale.
    pub fn request_snapshot(
        &self,
        intent: CallerIntent,
    ) -> Result<Arc<DataPoint>, error::Collector> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(Request::Snapshot { intent, reply })
            .map_err(|_| error::Collector::NotRunning)?;
        rx.recv().map_err(|_| error::Collector::NotRunning)
    }

    /// The latest published snapshot, without triggering a refresh.
    pub fn latest(&self) -> Option<Arc<DataPoint>> {
        match self.shared.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Blocks until a snapshot newer than `last_id` is published, or the
    /// timeout elapses.
    pub fn wait_new(&self, last_id: u32, timeout: Duration) -> Option<Arc<DataPoint>> {
        let deadline = Instant::now() + timeout;
        let mut guard = match self.shared.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(point) = guard.as_ref() {
                if point.id > last_id {
                    return Some(Arc::clone(point));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = match self.shared.cond.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Indexed read from the log ring, 0 being the oldest record.
    pub fn get_log(&self, index: usize) -> Result<Option<DataPoint>, error::Collector> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(Request::GetLog { index, reply })
            .map_err(|_| error::Collector::NotRunning)?;
        rx.recv().map_err(|_| error::Collector::NotRunning)
    }

    /// Offers a position taken from a received APRS frame, used as a last
    /// resort when the GPS cannot deliver.
    pub fn offer_aprs_fix(&self, lat: i32, lon: i32) {
        let _ = self.tx.send(Request::OfferAprsFix { lat, lon });
    }

    /// Stops the collector thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown);
    }
}

struct Collector {
    suite: SensorSuite,
    ring: LogRing,
    params: CollectorParams,
    shared: Arc<Shared>,
    boot: Instant,
    next_id: u32,
    reset_count: u16,
    seed: Option<DataPoint>,
    last_live_fix: Option<Instant>,
    aprs_fix: Option<(i32, i32)>,
    last_refresh: Option<Instant>,
}

/// Spawns the collector thread.
pub fn spawn(
    suite: SensorSuite,
    mut ring: LogRing,
    params: CollectorParams,
) -> (CollectorHandle, JoinHandle<()>) {
    let shared = Arc::new(Shared {
        latest: Mutex::new(None),
        cond: Condvar::new(),
    });
    let (tx, rx) = mpsc::channel();
    let handle = CollectorHandle {
        tx,
        shared: Arc::clone(&shared),
    };

    let seed = match ring.last() {
        Ok(seed) => seed,
        Err(e) => {
            warn!("log ring recovery failed: {e:#}");
            None
        }
    };
    let (next_id, reset_count) = match &seed {
        Some(point) => (point.id + 1, point.reset_count.wrapping_add(1)),
        None => (1, 0),
    };
    if let Some(point) = &seed {
        info!(
            "seeded from log record id {} ({} resets)",
            point.id, point.reset_count
        );
    }

    let mut collector = Collector {
        suite,
        ring,
        params,
        shared,
        boot: Instant::now(),
        next_id,
        reset_count,
        seed,
        last_live_fix: None,
        aprs_fix: None,
        last_refresh: None,
    };

    let worker = thread::Builder::new()
        .name("collector".to_owned())
        .spawn(move || {
            collector.publish_seed();
            collector.run(&rx);
            info!("data collector stopped");
        })
        .expect("spawning the collector cannot fail");

    (handle, worker)
}

impl Collector {
    /// Publishes the position of last resort recovered from the log, so
    /// readers have something before the first full cycle.
    fn publish_seed(&mut self) {
        let Some(seed) = self.seed.clone() else {
            return;
        };
        let mut point = seed;
        point.id = self.next_id;
        self.next_id += 1;
        point.reset_count = self.reset_count;
        point.sys_time = 0;
        point.gps_state = GpsState::FromLog;
        self.publish(point);
    }

    fn run(&mut self, rx: &mpsc::Receiver<Request>) {
        loop {
            match rx.recv_timeout(self.params.cycle) {
                Ok(Request::Snapshot { intent, reply }) => {
                    if self.is_stale() {
                        self.refresh(intent);
                    }
                    if let Some(latest) = self.latest() {
                        let _ = reply.send(latest);
                    }
                }
                Ok(Request::GetLog { index, reply }) => {
                    let record = self.ring.get(index).unwrap_or_else(|e| {
                        warn!("log ring read failed: {e:#}");
                        None
                    });
                    let _ = reply.send(record);
                }
                Ok(Request::OfferAprsFix { lat, lon }) => {
                    self.aprs_fix = Some((lat, lon));
                }
                Ok(Request::Shutdown) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.refresh(CallerIntent { needs_gps: true });
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn latest(&self) -> Option<Arc<DataPoint>> {
        match self.shared.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn is_stale(&self) -> bool {
        match self.last_refresh {
            Some(at) => at.elapsed() > self.params.freshness,
            None => true,
        }
    }

    fn vbat_now(&mut self) -> u16 {
        self.suite.adc.read().map(|adc| adc.vbat).unwrap_or(0)
    }

    /// One full sampling cycle.
    fn refresh(&mut self, intent: CallerIntent) {
        let mut point = DataPoint::empty(self.next_id);
        point.reset_count = self.reset_count;

        self.acquire_position(intent, &mut point);

        match self.suite.power.read() {
            Ok(power) => {
                point.pac_vbat = power.vbat;
                point.pac_vsol = power.vsol;
                point.pac_pbat = power.pbat;
                point.pac_psol = power.psol;
            }
            Err(e) => {
                debug!("power meter read failed: {e:#}");
                point.sys_error.insert(SysError::POWER_METER | SysError::I2C);
            }
        }

        match self.suite.adc.read() {
            Ok(adc) => {
                point.adc_vbat = adc.vbat;
                point.adc_vsol = adc.vsol;
                point.light_intensity = adc.light;
            }
            Err(e) => {
                debug!("ADC read failed: {e:#}");
                point.sys_error.insert(SysError::I2C);
            }
        }

        // Strict slot order: i1, e1, e2.
        for (slot, index) in [(BmeSlot::I1, 0), (BmeSlot::E1, 1), (BmeSlot::E2, 2)] {
            let sensor = &mut self.suite.env[index];
            let (reading, status) = if !sensor.fitted() {
                (Default::default(), BmeStatus::NotFitted)
            } else {
                match sensor.read() {
                    Ok((press, temp, hum)) => (
                        crate::telemetry::BmeReading {
                            press,
                            temp,
                            hum,
                            status: BmeStatus::Ok,
                        },
                        BmeStatus::Ok,
                    ),
                    Err(e) => {
                        debug!("BME280 {slot:?} read failed: {e:#}");
                        point.sys_error.insert(SysError::I2C);
                        (Default::default(), BmeStatus::Fail)
                    }
                }
            };
            let target = match slot {
                BmeSlot::I1 => &mut point.bme_i1,
                BmeSlot::E1 => &mut point.bme_e1,
                BmeSlot::E2 => &mut point.bme_e2,
            };
            *target = reading;
            target.status = status;
            point.sys_error.set_bme_status(slot, status);
        }

        match self.suite.temps.read() {
            Ok((mcu, radio)) => {
                point.stm32_temp = mcu;
                point.si446x_temp = radio;
            }
            Err(e) => {
                debug!("die temperature read failed: {e:#}");
                point.sys_error.insert(SysError::I2C);
            }
        }

        point.gpio = self.suite.gpio.snapshot();
        point.sys_time = self.boot.elapsed().as_secs() as u32;

        self.next_id += 1;
        self.last_refresh = Some(Instant::now());
        self.publish(point);
    }

    /// GPS phase of the cycle: power policy, fix polling, classification.
    fn acquire_position(&mut self, intent: CallerIntent, point: &mut DataPoint) {
        let carry = |point: &mut DataPoint, source: Option<&DataPoint>| {
            if let Some(prev) = source {
                point.gps_lat = prev.gps_lat;
                point.gps_lon = prev.gps_lon;
                point.gps_alt = prev.gps_alt;
            }
        };
        let previous = self.latest();

        if !intent.needs_gps {
            if self.suite.gps.is_on() {
                let _ = self.suite.gps.power_off();
            }
            point.gps_state = GpsState::Off;
            carry(point, previous.as_deref());
            self.degrade_position(point);
            return;
        }

        let vbat = self.vbat_now();
        if vbat < self.params.gps_off_vbat_mv
            || (!self.suite.gps.is_on() && vbat < self.params.gps_on_vbat_mv)
        {
            point.gps_state = GpsState::LowBattNeverOn;
            carry(point, previous.as_deref());
            self.degrade_position(point);
            return;
        }

        if !self.suite.gps.is_on() {
            if let Err(e) = self.suite.gps.power_on() {
                warn!("GPS power-on failed: {e:#}");
                point.gps_state = GpsState::Error;
                point.sys_error.insert(SysError::GPS);
                carry(point, previous.as_deref());
                self.degrade_position(point);
                return;
            }
        }

        let started = Instant::now();
        let mut state = GpsState::Loss;
        while started.elapsed() < self.params.gps_timeout {
            if self.vbat_now() < self.params.gps_onper_vbat_mv {
                let _ = self.suite.gps.power_off();
                state = GpsState::LowBattEarlyOff;
                break;
            }

            match self.suite.gps.poll_fix() {
                Ok(Some(fix)) => {
                    point.gps_time = fix.time;
                    point.gps_lat = fix.lat;
                    point.gps_lon = fix.lon;
                    point.gps_alt = fix.alt;
                    point.gps_sats = fix.sats;
                    point.gps_pdop = fix.pdop;
                    point.gps_ttff = started.elapsed().as_secs().min(255) as u8;
                    self.last_live_fix = Some(Instant::now());
                    state = if self.params.gps_stay_on {
                        GpsState::LockedOn
                    } else {
                        let _ = self.suite.gps.power_off();
                        GpsState::LockedOff
                    };
                    break;
                }
                Ok(None) => thread::sleep(self.params.gps_poll),
                Err(e) => {
                    warn!("GPS communication error: {e:#}");
                    let _ = self.suite.gps.power_off();
                    state = GpsState::Error;
                    point.sys_error.insert(SysError::GPS);
                    break;
                }
            }
        }

        if state == GpsState::Loss && !self.params.gps_stay_on {
            let _ = self.suite.gps.power_off();
        }
        point.gps_state = state;
        if !state.has_fix() {
            carry(point, previous.as_deref());
            self.degrade_position(point);
        }
    }

    /// Without a live fix, fall back to an offered APRS position or to the
    /// log seed once the fallback window has passed.
    fn degrade_position(&mut self, point: &mut DataPoint) {
        if point.gps_state.has_fix() {
            return;
        }
        if let Some((lat, lon)) = self.aprs_fix {
            if self.last_live_fix.is_none() {
                point.gps_lat = lat;
                point.gps_lon = lon;
                point.gps_state = GpsState::FromAprsFix;
                return;
            }
        }

        let no_fix_for = match self.last_live_fix {
            Some(at) => at.elapsed(),
            None => self.boot.elapsed(),
        };
        if self.seed.is_some()
            && self.last_live_fix.is_none()
            && no_fix_for >= self.params.log_fallback_window
        {
            if let Some(seed) = &self.seed {
                point.gps_lat = seed.gps_lat;
                point.gps_lon = seed.gps_lon;
                point.gps_alt = seed.gps_alt;
            }
            point.gps_state = GpsState::FromLog;
        }
    }

    fn publish(&mut self, point: DataPoint) {
        if let Err(e) = self.ring.append(&point) {
            warn!("log ring append failed: {e:#}");
        }

        let point = Arc::new(point);
        {
            let mut guard = match self.shared.latest.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(Arc::clone(&point));
        }
        self.shared.cond.notify_all();
        debug!(
            "published snapshot id {} (gps {})",
            point.id, point.gps_state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sensors::{
            AdcReading, GpsFix, PowerReading, SensorSuite, SimAdc, SimEnv, SimGpio, SimGps,
            SimPower, SimTemps,
        },
        telemetry::ERASED_ID,
    };

    fn fast_params() -> CollectorParams {
        CollectorParams {
            cycle: Duration::from_secs(60),
            freshness: Duration::ZERO,
            gps_timeout: Duration::from_millis(500),
            gps_poll: Duration::from_millis(5),
            gps_stay_on: false,
            gps_on_vbat_mv: 3300,
            gps_off_vbat_mv: 2500,
            gps_onper_vbat_mv: 2800,
            log_fallback_window: Duration::from_secs(3600),
        }
    }

    fn fix() -> GpsFix {
        GpsFix {
            time: 1_700_000_000,
            lat: 377_749_000,
            lon: -1_224_194_000,
            alt: 1200,
            sats: 9,
            pdop: 28,
        }
    }

    struct Bench {
        gps: SimGps,
        power: SimPower,
        adc: SimAdc,
        env_i1: SimEnv,
    }

    fn suite(polls_until_fix: u32) -> (SensorSuite, Bench) {
        let gps = SimGps::new(Some(fix()), polls_until_fix);
        let power = SimPower::new(PowerReading {
            vbat: 4000,
            vsol: 900,
            pbat: -120,
            psol: 250,
        });
        let adc = SimAdc::new(AdcReading {
            vbat: 3980,
            vsol: 890,
            light: 512,
        });
        let env_i1 = SimEnv::new(1_013_250, 2150, 40);
        let suite = SensorSuite {
            gps: Box::new(gps.clone()),
            power: Box::new(power.clone()),
            adc: Box::new(adc.clone()),
            env: [
                Box::new(env_i1.clone()),
                Box::new(SimEnv::not_fitted()),
                Box::new(SimEnv::not_fitted()),
            ],
            temps: Box::new(SimTemps::new(2400, 2600)),
            gpio: Box::new(SimGpio(0b101)),
        };
        (
            suite,
            Bench {
                gps,
                power,
                adc,
                env_i1,
            },
        )
    }

    fn temp_ring(name: &str) -> (std::path::PathBuf, LogRing) {
        let path = std::env::temp_dir().join(format!(
            "picoballoon-collector-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let ring = LogRing::open(&path, 16).unwrap();
        (path, ring)
    }

    /// Snapshot ids increase strictly and sys_time never decreases.
    #[test]
    fn snapshot_monotonicity() {
        let (suite, _bench) = suite(1);
        let (path, ring) = temp_ring("monotonic");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let mut last_id = 0;
        let mut last_time = 0;
        for _ in 0..4 {
            let point = handle
                .request_snapshot(CallerIntent { needs_gps: true })
                .unwrap();
            assert!(point.id > last_id, "ids must increase strictly");
            assert!(point.sys_time >= last_time);
            last_id = point.id;
            last_time = point.sys_time;
        }

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// A healthy pass fills GPS, power, environment and die temperatures.
    #[test]
    fn full_cycle_contents() {
        let (suite, _bench) = suite(1);
        let (path, ring) = temp_ring("full");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let point = handle
            .request_snapshot(CallerIntent { needs_gps: true })
            .unwrap();
        assert_eq!(point.gps_state, GpsState::LockedOff);
        assert_eq!(point.gps_lat, 377_749_000);
        assert_eq!(point.gps_sats, 9);
        assert_eq!(point.pac_vbat, 4000);
        assert_eq!(point.adc_vbat, 3980);
        assert_eq!(point.bme_i1.status, BmeStatus::Ok);
        assert_eq!(point.bme_e1.status, BmeStatus::NotFitted);
        assert_eq!(point.stm32_temp, 2400);
        assert_eq!(point.gpio, 0b101);
        assert!(point.sys_error.is_empty() || point.sys_error.bits() & 0xF == 0);

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// Below the power-on threshold the GPS is never switched on.
    #[test]
    fn low_battery_never_on() {
        let (suite, bench) = suite(1);
        bench.adc.set(AdcReading {
            vbat: 2400,
            vsol: 0,
            light: 0,
        });
        let (path, ring) = temp_ring("lowbatt");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let point = handle
            .request_snapshot(CallerIntent { needs_gps: true })
            .unwrap();
        assert_eq!(point.gps_state, GpsState::LowBattNeverOn);
        assert!(!bench.gps.powered());

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// A battery collapse while acquiring powers the GPS off early.
    #[test]
    fn low_battery_early_off() {
        let (suite, bench) = suite(1000);
        let (path, ring) = temp_ring("earlyoff");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let requester = {
            let handle = handle.clone();
            thread::spawn(move || handle.request_snapshot(CallerIntent { needs_gps: true }))
        };
        thread::sleep(Duration::from_millis(50));
        bench.adc.set(AdcReading {
            vbat: 2600,
            vsol: 0,
            light: 0,
        });

        let point = requester.join().unwrap().unwrap();
        assert_eq!(point.gps_state, GpsState::LowBattEarlyOff);
        assert!(!bench.gps.powered());

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// A GPS communication error is classified and flagged but the cycle
    /// still publishes.
    #[test]
    fn gps_error_does_not_abort() {
        let (suite, bench) = suite(1);
        bench.gps.set_fail(true);
        let (path, ring) = temp_ring("gpserr");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let point = handle
            .request_snapshot(CallerIntent { needs_gps: true })
            .unwrap();
        assert_eq!(point.gps_state, GpsState::Error);
        assert!(point.sys_error.contains(SysError::GPS));
        assert_eq!(point.pac_vbat, 4000);

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// A power meter failure sets its bits and the ADC value still arrives.
    #[test]
    fn sensor_failure_sets_bits() {
        let (suite, bench) = suite(1);
        bench.power.set_fail(true);
        bench.env_i1.set_fail(true);
        let (path, ring) = temp_ring("sensorfail");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let point = handle
            .request_snapshot(CallerIntent { needs_gps: false })
            .unwrap();
        assert!(point.sys_error.contains(SysError::POWER_METER));
        assert!(point.sys_error.contains(SysError::I2C));
        assert_eq!(point.bme_i1.status, BmeStatus::Fail);
        assert_eq!(point.adc_vbat, 3980);

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// The newest log record seeds the position of last resort.
    #[test]
    fn seeds_from_log() {
        let (path, mut ring) = temp_ring("seed");
        let mut old = DataPoint::empty(17);
        old.gps_state = GpsState::LockedOff;
        old.gps_lat = 481_234_000;
        old.gps_lon = 115_678_000;
        old.gps_alt = 7000;
        ring.append(&old).unwrap();
        drop(ring);

        let ring = LogRing::open(&path, 16).unwrap();
        let (suite, _bench) = suite(1);
        let (handle, worker) = spawn(suite, ring, fast_params());

        let seeded = handle.wait_new(0, Duration::from_secs(2)).unwrap();
        assert_eq!(seeded.gps_state, GpsState::FromLog);
        assert_eq!(seeded.gps_lat, 481_234_000);
        assert_eq!(seeded.id, 18);
        assert_eq!(seeded.reset_count, 1);
        assert_ne!(seeded.id, ERASED_ID);

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// Snapshots land in the log ring and are readable through the handle.
    #[test]
    fn snapshots_logged() {
        let (suite, _bench) = suite(1);
        let (path, ring) = temp_ring("logged");
        let (handle, worker) = spawn(suite, ring, fast_params());

        let a = handle
            .request_snapshot(CallerIntent { needs_gps: false })
            .unwrap();
        let b = handle
            .request_snapshot(CallerIntent { needs_gps: false })
            .unwrap();

        let first = handle.get_log(0).unwrap().unwrap();
        let second = handle.get_log(1).unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert!(handle.get_log(5).unwrap().is_none());

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// An offered APRS fix fills the position when the GPS never locked.
    #[test]
    fn aprs_fix_fallback() {
        let (suite, bench) = suite(1);
        bench.gps.set_fail(true);
        let (path, ring) = temp_ring("aprsfix");
        let (handle, worker) = spawn(suite, ring, fast_params());

        handle.offer_aprs_fix(505_000_000, 30_000_000);
        // Give the offer time to land before the snapshot request.
        thread::sleep(Duration::from_millis(50));
        let point = handle
            .request_snapshot(CallerIntent { needs_gps: true })
            .unwrap();
        assert_eq!(point.gps_state, GpsState::FromAprsFix);
        assert_eq!(point.gps_lat, 505_000_000);

        handle.shutdown();
        worker.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
