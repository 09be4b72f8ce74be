//! Position beacon thread.
//!
//! Every cycle: telemetry configuration group when due (the group always
//! precedes the first position packet of a boot), then the position packet
//! with embedded telemetry, then the APRSD summary addressed to the base
//! call or to ourselves.

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    aprs::{self, TelemetryConfig, TELEMETRY_SEQ_MODULUS},
    collector::{CallerIntent, CollectorHandle},
    config::Config,
    dispatch::HeardList,
    packet::PacketPool,
    radio::{Priority, RadioHandle},
    threads::{duty_allowed, own_addressee, pause, transmit_info},
    watchdog::Heartbeat,
};

/// Beacon thread context.
pub struct Beacon {
    /// Tracker configuration.
    pub config: Arc<Config>,
    /// Collector handle.
    pub collector: CollectorHandle,
    /// Radio manager handle.
    pub radio: RadioHandle,
    /// Packet pool.
    pub pool: PacketPool,
    /// Directly heard stations for the APRSD summary.
    pub heard: Arc<HeardList>,
    /// Watchdog heartbeat.
    pub heartbeat: Heartbeat,
    /// Shutdown flag.
    pub shutdown: Arc<AtomicBool>,
    /// Beacon cycle.
    pub cycle: Duration,
    /// Telemetry configuration cycle.
    pub tel_enc_cycle: Duration,
    /// Spacing between the four configuration PDUs.
    pub config_spacing: Duration,
}

/// Beacon thread body.
pub fn run(beacon: Beacon) {
    let own = own_addressee(&beacon.config);
    let mut seq: u16 = 0;
    let mut last_config: Option<Instant> = None;

    loop {
        if !pause(&beacon.shutdown, &beacon.heartbeat, beacon.cycle) {
            return;
        }

        let point = match beacon
            .collector
            .request_snapshot(CallerIntent { needs_gps: true })
        {
            Ok(point) => point,
            Err(e) => {
                warn!("beacon could not get a snapshot: {e}");
                continue;
            }
        };

        if !duty_allowed(beacon.config.beacon().sleep_vbat_mv(), &point) {
            debug!("beacon skipping cycle, battery at {} mV", point.vbat_mv());
            continue;
        }

        // The scaling advertisement must precede any position that uses it.
        if last_config.map_or(true, |at| at.elapsed() >= beacon.tel_enc_cycle) {
            for kind in [
                TelemetryConfig::Parm,
                TelemetryConfig::Unit,
                TelemetryConfig::Eqns,
                TelemetryConfig::Bits,
            ] {
                let info = aprs::encode_telemetry_config(
                    &own,
                    kind,
                    beacon.config.aprs().telemetry_title(),
                );
                if let Err(e) = transmit_info(
                    &beacon.config,
                    &beacon.pool,
                    &beacon.radio,
                    info,
                    Priority::Beacon,
                ) {
                    warn!("telemetry config transmission failed: {e:#}");
                }
                if !pause(&beacon.shutdown, &beacon.heartbeat, beacon.config_spacing) {
                    return;
                }
            }
            last_config = Some(Instant::now());
        }

        let info = aprs::encode_position(
            &point,
            beacon.config.symbol_table(),
            beacon.config.symbol_code(),
            seq,
        );
        match transmit_info(
            &beacon.config,
            &beacon.pool,
            &beacon.radio,
            info,
            Priority::Beacon,
        ) {
            Ok(()) => {
                seq = (seq + 1) % TELEMETRY_SEQ_MODULUS;
                info!(
                    "beacon sent position for snapshot {} ({})",
                    point.id, point.gps_state
                );
            }
            Err(e) => warn!("position transmission failed: {e:#}"),
        }

        let base = beacon.config.beacon().base_call();
        let addressee = if base.is_empty() { own.as_str() } else { base };
        let summary = aprs::encode_aprsd_response(addressee, &beacon.heard.list());
        if let Err(e) = transmit_info(
            &beacon.config,
            &beacon.pool,
            &beacon.radio,
            summary,
            Priority::Beacon,
        ) {
            warn!("APRSD summary transmission failed: {e:#}");
        }
    }
}
