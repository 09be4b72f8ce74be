//! Image thread.
//!
//! Captures a JPEG, runs it through the SSDV packetiser and transmits each
//! packet as one UI frame. Radio failures are retried per packet; an
//! exhausted retry budget abandons the rest of the frame until the next
//! cycle.

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    collector::{CallerIntent, CollectorHandle},
    config::Config,
    packet::PacketPool,
    radio::{Priority, RadioHandle},
    sensors::Camera,
    ssdv,
    threads::{duty_allowed, pause, transmit_info},
    watchdog::Heartbeat,
};

/// Pause between cycles in continuous mode.
const CONTINUOUS_PAUSE: Duration = Duration::from_millis(100);

/// Image thread context.
pub struct Image {
    /// Tracker configuration.
    pub config: Arc<Config>,
    /// Collector handle.
    pub collector: CollectorHandle,
    /// Radio manager handle.
    pub radio: RadioHandle,
    /// Packet pool.
    pub pool: PacketPool,
    /// The camera.
    pub camera: Box<dyn Camera>,
    /// Watchdog heartbeat.
    pub heartbeat: Heartbeat,
    /// Shutdown flag.
    pub shutdown: Arc<AtomicBool>,
    /// Image cycle.
    pub cycle: Duration,
}

/// Image thread body.
pub fn run(mut image: Image) {
    let mut image_id: u8 = 0;

    loop {
        let wait = if image.config.image().continuous() {
            CONTINUOUS_PAUSE
        } else {
            image.cycle
        };
        if !pause(&image.shutdown, &image.heartbeat, wait) {
            return;
        }

        let point = match image
            .collector
            .request_snapshot(CallerIntent { needs_gps: false })
        {
            Ok(point) => point,
            Err(e) => {
                warn!("image thread could not get a snapshot: {e}");
                continue;
            }
        };
        if !duty_allowed(image.config.image().sleep_vbat_mv(), &point) {
            debug!("image skipping cycle, battery at {} mV", point.vbat_mv());
            continue;
        }

        let image_config = image.config.image();
        let jpeg = match image.camera.capture(
            image_config.width(),
            image_config.height(),
            image_config.quality(),
        ) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("camera capture failed: {e:#}");
                continue;
            }
        };

        let packets = ssdv::packetise(
            image.config.callsign(),
            image_id,
            image_config.quality(),
            image_config.width(),
            image_config.height(),
            &jpeg,
        );
        info!(
            "transmitting image {} as {} SSDV packets ({} JPEG bytes)",
            image_id,
            packets.len(),
            jpeg.len()
        );

        'frame: for packet in &packets {
            image.heartbeat.beat();

            // The sync byte never rides along; the info field starts at the
            // packet type.
            let info = packet[1..].to_vec();
            let mut delivered = false;
            for attempt in 0..=image_config.retries() {
                match transmit_info(
                    &image.config,
                    &image.pool,
                    &image.radio,
                    info.clone(),
                    Priority::Image,
                ) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        warn!("SSDV packet attempt {} failed: {e:#}", attempt + 1);
                        if !pause(
                            &image.shutdown,
                            &image.heartbeat,
                            Duration::from_millis(250),
                        ) {
                            return;
                        }
                    }
                }
            }
            if !delivered {
                warn!("abandoning image {image_id} after retry budget");
                break 'frame;
            }
        }

        image_id = image_id.wrapping_add(1);
    }
}
