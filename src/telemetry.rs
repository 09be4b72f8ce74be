//! Telemetry data model.
//!
//! A [`DataPoint`] is one timestamped snapshot of everything the tracker
//! knows: position, power budget, environment and error flags. Snapshots are
//! immutable once published by the collector and are shared behind an `Arc`.

use std::fmt;

use bitflags::bitflags;

/// Sentinel id marking an erased log slot.
pub const ERASED_ID: u32 = 0xFFFF_FFFF;

/// Width of one BME280 status field inside [`SysError`], in bits.
pub const BME_STATUS_BITS: u32 = 2;
/// Shift of the on-board BME280 status inside [`SysError`].
pub const BMEI1_STATUS_SHIFT: u32 = 4;
/// Shift of the first external BME280 status inside [`SysError`].
pub const BMEE1_STATUS_SHIFT: u32 = BMEI1_STATUS_SHIFT + BME_STATUS_BITS;
/// Shift of the second external BME280 status inside [`SysError`].
pub const BMEE2_STATUS_SHIFT: u32 = BMEI1_STATUS_SHIFT + 2 * BME_STATUS_BITS;

/// State of the GPS at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsState {
    /// Fix acquired, receiver switched off afterwards.
    LockedOff,
    /// Fix acquired, receiver kept running.
    LockedOn,
    /// Receiver ran but no fix arrived within the window.
    Loss,
    /// Battery too low to ever switch the receiver on.
    LowBattNeverOn,
    /// Battery collapsed while acquiring, receiver switched off early.
    LowBattEarlyOff,
    /// Position recovered from the log ring.
    FromLog,
    /// Receiver off, nobody asked for a fix.
    Off,
    /// Receiver did not answer on its serial link.
    Error,
    /// Position taken from a received APRS frame.
    FromAprsFix,
}

impl GpsState {
    /// Packs the state into a single byte for storage.
    pub fn to_u8(self) -> u8 {
        match self {
            GpsState::LockedOff => 0,
            GpsState::LockedOn => 1,
            GpsState::Loss => 2,
            GpsState::LowBattNeverOn => 3,
            GpsState::LowBattEarlyOff => 4,
            GpsState::FromLog => 5,
            GpsState::Off => 6,
            GpsState::Error => 7,
            GpsState::FromAprsFix => 8,
        }
    }

    /// Unpacks a stored state byte. Unknown values read as [`GpsState::Error`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => GpsState::LockedOff,
            1 => GpsState::LockedOn,
            2 => GpsState::Loss,
            3 => GpsState::LowBattNeverOn,
            4 => GpsState::LowBattEarlyOff,
            5 => GpsState::FromLog,
            6 => GpsState::Off,
            8 => GpsState::FromAprsFix,
            _ => GpsState::Error,
        }
    }

    /// Checks whether the snapshot position comes from a live fix.
    pub fn has_fix(self) -> bool {
        matches!(self, GpsState::LockedOff | GpsState::LockedOn)
    }
}

impl fmt::Display for GpsState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            GpsState::LockedOff => "LOCKED_OFF",
            GpsState::LockedOn => "LOCKED_ON",
            GpsState::Loss => "LOSS",
            GpsState::LowBattNeverOn => "LOWBATT_NEVER_ON",
            GpsState::LowBattEarlyOff => "LOWBATT_EARLY_OFF",
            GpsState::FromLog => "FROM_LOG",
            GpsState::Off => "OFF",
            GpsState::Error => "ERROR",
            GpsState::FromAprsFix => "FROM_APRS_FIX",
        };
        write!(f, "{s}")
    }
}

/// Per-slot BME280 measurement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BmeStatus {
    /// Measurement valid.
    Ok,
    /// Sensor fitted but the read failed.
    Fail,
    /// No sensor in this slot.
    #[default]
    NotFitted,
}

impl BmeStatus {
    /// Packs the status into its two-bit field value.
    pub fn to_bits(self) -> u16 {
        match self {
            BmeStatus::Ok => 0,
            BmeStatus::Fail => 1,
            BmeStatus::NotFitted => 2,
        }
    }

    /// Unpacks a two-bit field value.
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => BmeStatus::Ok,
            1 => BmeStatus::Fail,
            _ => BmeStatus::NotFitted,
        }
    }
}

/// BME280 slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmeSlot {
    /// On-board sensor.
    I1,
    /// First external sensor.
    E1,
    /// Second external sensor.
    E2,
}

impl BmeSlot {
    fn status_shift(self) -> u32 {
        match self {
            BmeSlot::I1 => BMEI1_STATUS_SHIFT,
            BmeSlot::E1 => BMEE1_STATUS_SHIFT,
            BmeSlot::E2 => BMEE2_STATUS_SHIFT,
        }
    }
}

bitflags! {
    /// Packed system error flags.
    ///
    /// The low four bits are single-bit failure flags; bits 4-9 carry the
    /// three two-bit BME280 statuses (i1, e1, e2 in ascending shifts).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SysError: u16 {
        /// I²C bus failure.
        const I2C = 1 << 0;
        /// GPS communication failure.
        const GPS = 1 << 1;
        /// Power meter failure.
        const POWER_METER = 1 << 2;
        /// Camera failure.
        const CAMERA = 1 << 3;
        // BME status fields live in bits 4-9.
        const _ = !0;
    }
}

impl SysError {
    /// Stores a BME280 slot status into its two-bit field.
    pub fn set_bme_status(&mut self, slot: BmeSlot, status: BmeStatus) {
        let shift = slot.status_shift();
        let cleared = self.bits() & !(0b11 << shift);
        *self = SysError::from_bits_retain(cleared | (status.to_bits() << shift));
    }

    /// Reads a BME280 slot status from its two-bit field.
    pub fn bme_status(&self, slot: BmeSlot) -> BmeStatus {
        BmeStatus::from_bits(self.bits() >> slot.status_shift())
    }
}

/// One BME280 measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BmeReading {
    /// Air pressure, in 0.1 Pa.
    pub press: u32,
    /// Temperature, in 0.01 °C.
    pub temp: i16,
    /// Relative humidity, in %.
    pub hum: u8,
    /// Measurement status. `press`, `temp` and `hum` are only valid when
    /// this is [`BmeStatus::Ok`].
    pub status: BmeStatus,
}

/// One telemetry snapshot. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    /// Monotonically increasing snapshot id.
    pub id: u32,
    /// Number of resets since the log ring was pristine.
    pub reset_count: u16,
    /// Seconds since boot.
    pub sys_time: u32,
    /// Epoch seconds from the GPS, 0 if no time is known.
    pub gps_time: u32,
    /// State of the GPS at snapshot time.
    pub gps_state: GpsState,
    /// Number of satellites used in the fix.
    pub gps_sats: u8,
    /// Time to first fix, in seconds.
    pub gps_ttff: u8,
    /// Position dilution of precision, in 0.05 units.
    pub gps_pdop: u8,
    /// Altitude, in meters.
    pub gps_alt: u16,
    /// Latitude, in 1e-7 degrees.
    pub gps_lat: i32,
    /// Longitude, in 1e-7 degrees.
    pub gps_lon: i32,
    /// Battery voltage from the ADC, in mV.
    pub adc_vbat: u16,
    /// Solar voltage from the ADC, in mV.
    pub adc_vsol: u16,
    /// Battery voltage from the power meter, in mV.
    pub pac_vbat: u16,
    /// Solar voltage from the power meter, in mV.
    pub pac_vsol: u16,
    /// Battery power, in mW. Negative while discharging.
    pub pac_pbat: i16,
    /// Solar power, in mW.
    pub pac_psol: i16,
    /// Light sensor reading.
    pub light_intensity: u16,
    /// On-board BME280.
    pub bme_i1: BmeReading,
    /// First external BME280.
    pub bme_e1: BmeReading,
    /// Second external BME280.
    pub bme_e2: BmeReading,
    /// MCU die temperature, in 0.01 °C.
    pub stm32_temp: i16,
    /// Transceiver die temperature, in 0.01 °C.
    pub si446x_temp: i16,
    /// Packed system error flags.
    pub sys_error: SysError,
    /// GPIO line snapshot.
    pub gpio: u8,
}

impl DataPoint {
    /// Creates an empty snapshot with the given id.
    pub fn empty(id: u32) -> Self {
        Self {
            id,
            reset_count: 0,
            sys_time: 0,
            gps_time: 0,
            gps_state: GpsState::Off,
            gps_sats: 0,
            gps_ttff: 0,
            gps_pdop: 0,
            gps_alt: 0,
            gps_lat: 0,
            gps_lon: 0,
            adc_vbat: 0,
            adc_vsol: 0,
            pac_vbat: 0,
            pac_vsol: 0,
            pac_pbat: 0,
            pac_psol: 0,
            light_intensity: 0,
            bme_i1: BmeReading::default(),
            bme_e1: BmeReading::default(),
            bme_e2: BmeReading::default(),
            stm32_temp: 0,
            si446x_temp: 0,
            sys_error: SysError::default(),
            gpio: 0,
        }
    }

    /// Checks whether the snapshot carries a usable position, live or
    /// recovered.
    pub fn has_position(&self) -> bool {
        match self.gps_state {
            GpsState::LockedOff | GpsState::LockedOn | GpsState::FromLog | GpsState::FromAprsFix => {
                true
            }
            _ => self.gps_lat != 0 || self.gps_lon != 0,
        }
    }

    /// Gets the best available battery voltage, in mV. Prefers the power
    /// meter and falls back to the ADC.
    pub fn vbat_mv(&self) -> u16 {
        if self.sys_error.contains(SysError::POWER_METER) || self.pac_vbat == 0 {
            self.adc_vbat
        } else {
            self.pac_vbat
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks the GPS state byte round-trip.
    #[test]
    fn gps_state_round_trip() {
        for state in [
            GpsState::LockedOff,
            GpsState::LockedOn,
            GpsState::Loss,
            GpsState::LowBattNeverOn,
            GpsState::LowBattEarlyOff,
            GpsState::FromLog,
            GpsState::Off,
            GpsState::Error,
            GpsState::FromAprsFix,
        ] {
            assert_eq!(GpsState::from_u8(state.to_u8()), state);
        }
        assert_eq!(GpsState::from_u8(0xAA), GpsState::Error);
    }

    /// Checks the documented BME status field layout: e2 sits two fields
    /// above i1.
    #[test]
    fn bme_status_shifts() {
        assert_eq!(BMEI1_STATUS_SHIFT, 4);
        assert_eq!(BMEE1_STATUS_SHIFT, 6);
        assert_eq!(BMEE2_STATUS_SHIFT, BMEI1_STATUS_SHIFT + 2 * BME_STATUS_BITS);
    }

    /// Checks that BME statuses pack independently per slot.
    #[test]
    fn sys_error_bme_fields() {
        let mut flags = SysError::I2C;
        flags.set_bme_status(BmeSlot::I1, BmeStatus::Ok);
        flags.set_bme_status(BmeSlot::E1, BmeStatus::Fail);
        flags.set_bme_status(BmeSlot::E2, BmeStatus::NotFitted);

        assert!(flags.contains(SysError::I2C));
        assert_eq!(flags.bme_status(BmeSlot::I1), BmeStatus::Ok);
        assert_eq!(flags.bme_status(BmeSlot::E1), BmeStatus::Fail);
        assert_eq!(flags.bme_status(BmeSlot::E2), BmeStatus::NotFitted);

        flags.set_bme_status(BmeSlot::E1, BmeStatus::Ok);
        assert_eq!(flags.bme_status(BmeSlot::E1), BmeStatus::Ok);
        assert_eq!(flags.bme_status(BmeSlot::E2), BmeStatus::NotFitted);
    }

    /// Checks the battery voltage fallback to the ADC.
    #[test]
    fn vbat_prefers_power_meter() {
        let mut point = DataPoint::empty(1);
        point.adc_vbat = 3100;
        point.pac_vbat = 3300;
        assert_eq!(point.vbat_mv(), 3300);

        point.sys_error.insert(SysError::POWER_METER);
        assert_eq!(point.vbat_mv(), 3100);
    }
}
