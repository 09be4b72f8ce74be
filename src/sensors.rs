//! Sensor façade module.
//!
//! Uniform traits over the external device classes (GPS, power meter, ADC,
//! BME280 slots, die thermometers, camera, GPIO lines). The collector owns
//! one [`SensorSuite`] exclusively, which serialises every bus access. The
//! `Sim*` implementations are deterministic stand-ins used by the bench
//! launcher and the tests; they share their state behind a mutex so a test
//! can keep a handle and steer the device while the collector runs.

#![allow(missing_debug_implementations)]

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Error};

use crate::error;

/// One GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsFix {
    /// Epoch seconds.
    pub time: u32,
    /// Latitude, in 1e-7 degrees.
    pub lat: i32,
    /// Longitude, in 1e-7 degrees.
    pub lon: i32,
    /// Altitude, in meters.
    pub alt: u16,
    /// Satellites used.
    pub sats: u8,
    /// Position dilution of precision, in 0.05 units.
    pub pdop: u8,
}

/// GPS receiver contract.
pub trait Gps: Send {
    /// Powers the receiver on.
    fn power_on(&mut self) -> Result<(), Error>;
    /// Powers the receiver off.
    fn power_off(&mut self) -> Result<(), Error>;
    /// Checks whether the receiver is powered.
    fn is_on(&self) -> bool;
    /// Polls for a fix. `Ok(None)` means still searching; an error means
    /// the receiver did not answer.
    fn poll_fix(&mut self) -> Result<Option<GpsFix>, Error>;
}

/// Power meter reading (PAC1720 class).
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerReading {
    /// Battery voltage, in mV.
    pub vbat: u16,
    /// Solar voltage, in mV.
    pub vsol: u16,
    /// Battery power, in mW. Negative while discharging.
    pub pbat: i16,
    /// Solar power, in mW.
    pub psol: i16,
}

/// Power meter contract.
pub trait PowerMonitor: Send {
    /// Reads voltages and both power channels.
    fn read(&mut self) -> Result<PowerReading, Error>;
}

/// ADC reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdcReading {
    /// Battery voltage, in mV.
    pub vbat: u16,
    /// Solar voltage, in mV.
    pub vsol: u16,
    /// Light sensor value.
    pub light: u16,
}

/// ADC contract.
pub trait Adc: Send {
    /// Reads the ADC channels.
    fn read(&mut self) -> Result<AdcReading, Error>;
}

/// Environment sensor contract (BME280 class).
pub trait EnvironmentSensor: Send {
    /// Checks whether a sensor is fitted in this slot.
    fn fitted(&self) -> bool;
    /// Reads pressure (0.1 Pa), temperature (0.01 °C) and humidity (%).
    fn read(&mut self) -> Result<(u32, i16, u8), Error>;
}

/// Die thermometer contract.
pub trait ChipTemps: Send {
    /// Reads (MCU, transceiver) die temperatures, in 0.01 °C.
    fn read(&mut self) -> Result<(i16, i16), Error>;
}

/// Camera contract (OV5640 class).
pub trait Camera: Send {
    /// Captures one JPEG at the given resolution and quality.
    fn capture(&mut self, width: u16, height: u16, quality: u8) -> Result<Vec<u8>, Error>;
}

/// GPIO line snapshot contract.
pub trait GpioLines: Send {
    /// Samples the monitored lines into one byte.
    fn snapshot(&mut self) -> u8;
}

/// Everything the collector reads, owned exclusively by its thread.
pub struct SensorSuite {
    /// GPS receiver.
    pub gps: Box<dyn Gps>,
    /// Power meter.
    pub power: Box<dyn PowerMonitor>,
    /// ADC.
    pub adc: Box<dyn Adc>,
    /// The three BME280 slots, in i1, e1, e2 order.
    pub env: [Box<dyn EnvironmentSensor>; 3],
    /// Die thermometers.
    pub temps: Box<dyn ChipTemps>,
    /// GPIO lines.
    pub gpio: Box<dyn GpioLines>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
struct SimGpsState {
    powered: bool,
    fix: Option<GpsFix>,
    polls_until_fix: u32,
    polls: u32,
    fail: bool,
}

/// Deterministic GPS stand-in. A fix appears after a configurable number
/// of polls.
#[derive(Clone)]
pub struct SimGps {
    state: Arc<Mutex<SimGpsState>>,
}

impl SimGps {
    /// Creates a receiver that locks onto `fix` after `polls_until_fix`
    /// polls.
    pub fn new(fix: Option<GpsFix>, polls_until_fix: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimGpsState {
                powered: false,
                fix,
                polls_until_fix,
                polls: 0,
                fail: false,
            })),
        }
    }

    /// Replaces the scripted fix.
    pub fn set_fix(&self, fix: Option<GpsFix>) {
        lock(&self.state).fix = fix;
    }

    /// Makes every subsequent access fail like a dead serial link.
    pub fn set_fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    /// Checks whether the receiver is currently powered.
    pub fn powered(&self) -> bool {
        lock(&self.state).powered
    }
}

impl Gps for SimGps {
    fn power_on(&mut self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.fail {
            bail!(error::Collector::Gps);
        }
        state.powered = true;
        state.polls = 0;
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), Error> {
        lock(&self.state).powered = false;
        Ok(())
    }

    fn is_on(&self) -> bool {
        lock(&self.state).powered
    }

    fn poll_fix(&mut self) -> Result<Option<GpsFix>, Error> {
        let mut state = lock(&self.state);
        if state.fail {
            bail!(error::Collector::Gps);
        }
        if !state.powered {
            return Ok(None);
        }
        state.polls += 1;
        if state.polls >= state.polls_until_fix {
            Ok(state.fix)
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug)]
struct SimPowerState {
    reading: PowerReading,
    fail: bool,
}

/// Deterministic power meter stand-in.
#[derive(Clone)]
pub struct SimPower {
    state: Arc<Mutex<SimPowerState>>,
}

impl SimPower {
    /// Creates a meter returning `reading`.
    pub fn new(reading: PowerReading) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimPowerState {
                reading,
                fail: false,
            })),
        }
    }

    /// Replaces the reading.
    pub fn set(&self, reading: PowerReading) {
        lock(&self.state).reading = reading;
    }

    /// Makes every subsequent read fail.
    pub fn set_fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }
}

impl PowerMonitor for SimPower {
    fn read(&mut self) -> Result<PowerReading, Error> {
        let state = lock(&self.state);
        if state.fail {
            bail!(error::Collector::SensorBus { sensor: "pac1720" });
        }
        Ok(state.reading)
    }
}

/// Deterministic ADC stand-in.
#[derive(Clone)]
pub struct SimAdc {
    state: Arc<Mutex<AdcReading>>,
}

impl SimAdc {
    /// Creates an ADC returning `reading`.
    pub fn new(reading: AdcReading) -> Self {
        Self {
            state: Arc::new(Mutex::new(reading)),
        }
    }

    /// Replaces the reading.
    pub fn set(&self, reading: AdcReading) {
        *lock(&self.state) = reading;
    }
}

impl Adc for SimAdc {
    fn read(&mut self) -> Result<AdcReading, Error> {
        Ok(*lock(&self.state))
    }
}

#[derive(Debug)]
struct SimEnvState {
    fitted: bool,
    reading: (u32, i16, u8),
    fail: bool,
}

/// Deterministic BME280 stand-in.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimEnvState>>,
}

impl SimEnv {
    /// Creates a fitted sensor returning `press`/`temp`/`hum`.
    pub fn new(press: u32, temp: i16, hum: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimEnvState {
                fitted: true,
                reading: (press, temp, hum),
                fail: false,
            })),
        }
    }

    /// Creates an empty slot.
    pub fn not_fitted() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimEnvState {
                fitted: false,
                reading: (0, 0, 0),
                fail: false,
            })),
        }
    }

    /// Makes every subsequent read fail.
    pub fn set_fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }
}

impl EnvironmentSensor for SimEnv {
    fn fitted(&self) -> bool {
        lock(&self.state).fitted
    }

    fn read(&mut self) -> Result<(u32, i16, u8), Error> {
        let state = lock(&self.state);
        if state.fail || !state.fitted {
            bail!(error::Collector::SensorBus { sensor: "bme280" });
        }
        Ok(state.reading)
    }
}

/// Deterministic die thermometer stand-in.
#[derive(Clone)]
pub struct SimTemps {
    mcu: i16,
    radio: i16,
}

impl SimTemps {
    /// Creates thermometers returning fixed temperatures.
    pub fn new(mcu: i16, radio: i16) -> Self {
        Self { mcu, radio }
    }
}

impl ChipTemps for SimTemps {
    fn read(&mut self) -> Result<(i16, i16), Error> {
        Ok((self.mcu, self.radio))
    }
}

/// Fixed GPIO snapshot stand-in.
#[derive(Clone, Copy)]
pub struct SimGpio(pub u8);

impl GpioLines for SimGpio {
    fn snapshot(&mut self) -> u8 {
        self.0
    }
}

/// Deterministic camera stand-in producing a synthetic JPEG byte stream.
#[derive(Clone, Copy)]
pub struct SimCamera;

impl Camera for SimCamera {
    fn capture(&mut self, width: u16, height: u16, quality: u8) -> Result<Vec<u8>, Error> {
        // A JPEG-shaped pattern: SOI marker, deterministic body, EOI marker.
        let body = usize::from(width) * usize::from(height) / (16 * usize::from(quality) + 16);
        let mut jpeg = vec![0xFF, 0xD8];
        let mut x = 0x2Fu8;
        jpeg.extend((0..body).map(|i| {
            x = x.rotate_left(1) ^ (i as u8);
            x
        }));
        jpeg.extend([0xFF, 0xD9]);
        Ok(jpeg)
    }
}

/// Builds a complete simulated sensor suite with sane bench defaults.
pub fn bench_suite() -> (SensorSuite, SimGps, SimPower, SimAdc) {
    let gps = SimGps::new(
        Some(GpsFix {
            time: 1_700_000_000,
            lat: 377_749_000,
            lon: -1_224_194_000,
            alt: 1200,
            sats: 9,
            pdop: 28,
        }),
        3,
    );
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

    let suite = SensorSuite {
        gps: Box::new(gps.clone()),
        power: Box::new(power.clone()),
        adc: Box::new(adc.clone()),
        env: [
            Box::new(SimEnv::new(1_013_250, 2150, 40)),
            Box::new(SimEnv::not_fitted()),
            Box::new(SimEnv::not_fitted()),
        ],
        temps: Box::new(SimTemps::new(2400, 2600)),
        gpio: Box::new(SimGpio(0)),
    };
    (suite, gps, power, adc)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The simulated GPS needs its scripted number of polls to lock.
    #[test]
    fn sim_gps_locks_after_polls() {
        let mut gps = SimGps::new(
            Some(GpsFix {
                time: 1,
                lat: 2,
                lon: 3,
                alt: 4,
                sats: 5,
                pdop: 6,
            }),
            3,
        );
        gps.power_on().unwrap();
        assert!(gps.poll_fix().unwrap().is_none());
        assert!(gps.poll_fix().unwrap().is_none());
        assert!(gps.poll_fix().unwrap().is_some());
    }

    /// A failed GPS reports an error instead of a fix.
    #[test]
    fn sim_gps_failure() {
        let mut gps = SimGps::new(None, 1);
        gps.set_fail(true);
        assert!(gps.power_on().is_err());
    }

    /// The simulated camera produces a JPEG-delimited stream.
    #[test]
    fn sim_camera_jpeg_markers() {
        let jpeg = SimCamera.capture(320, 240, 4).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        // Deterministic output for identical parameters.
        assert_eq!(jpeg, SimCamera.capture(320, 240, 4).unwrap());
    }
}
