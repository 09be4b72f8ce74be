//! Receive dispatcher module.
//!
//! Routes decoded frames: tracks directly heard stations, acks and answers
//! messages addressed to us (with duplicate suppression), feeds received
//! positions to the collector as a fix of last resort, and digipeats frames
//! whose next unused path entry names us or a `WIDEn-n` alias.

#![allow(missing_debug_implementations)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    aprs::{self, Pdu},
    ax25::{Address, Packet},
    collector::CollectorHandle,
    config::Config,
    geofence::Frequency,
    packet::PacketPool,
    radio::{Priority, RadioHandle, RadioTask},
};

/// Directly heard stations with their last-heard time. Written by the
/// dispatcher, read by the beacon for the APRSD summary.
pub struct HeardList {
    window: Duration,
    inner: Mutex<HashMap<String, Instant>>,
}

impl HeardList {
    /// Creates a list whose entries expire after `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a station as heard now.
    pub fn insert(&self, call: String) {
        let _ = self.lock().insert(call, Instant::now());
    }

    /// Current list, oldest entries evicted, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut guard = self.lock();
        guard.retain(|_, at| at.elapsed() <= self.window);
        let mut calls: Vec<String> = guard.keys().cloned().collect();
        calls.sort();
        calls
    }
}

/// The receive-side dispatcher.
pub struct Dispatcher {
    config: Arc<Config>,
    own: Address,
    pool: PacketPool,
    radio: RadioHandle,
    collector: CollectorHandle,
    heard: Arc<HeardList>,
    dedup: HashMap<(String, String), Instant>,
    dedup_window: Duration,
    reboot: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        config: Arc<Config>,
        pool: PacketPool,
        radio: RadioHandle,
        collector: CollectorHandle,
        heard: Arc<HeardList>,
    ) -> Self {
        let own = Address::new(config.callsign(), config.ssid())
            .unwrap_or_else(|_| Address::new("N0CALL", 0).unwrap());
        let dedup_window = Duration::from_secs(config.aprs().msg_dedup_window_s());
        Self {
            config,
            own,
            pool,
            radio,
            collector,
            heard,
            dedup: HashMap::new(),
            dedup_window,
            reboot: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised by a received `REBOOT` command.
    pub fn reboot_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reboot)
    }

    fn addressee_of(address: &Address) -> String {
        if address.ssid() == 0 {
            address.call().to_owned()
        } else {
            format!("{}-{}", address.call(), address.ssid())
        }
    }

    /// Routes one decoded frame.
    pub fn handle(&mut self, packet: &Packet) {
        if Self::addressee_of(&packet.source) == Self::addressee_of(&self.own) {
            // Our own transmission coming back, nothing to do.
            return;
        }

        if packet.heard_direct() {
            self.heard.insert(Self::addressee_of(&packet.source));
        }

        match aprs::decode_info(&packet.info) {
            Pdu::Message {
                addressee,
                text,
                number,
            } if addressee == Self::addressee_of(&self.own) => {
                self.handle_message(&packet.source, &text, number.as_deref());
            }
            Pdu::Position { lat, lon } => {
                self.collector.offer_aprs_fix(lat, lon);
            }
            Pdu::Ack { number, .. } => {
                debug!("message {number} acked by {}", packet.source);
            }
            _ => {}
        }

        if self.config.digipeater_enabled() {
            self.digipeat(packet);
        }
    }

    fn handle_message(&mut self, source: &Address, text: &str, number: Option<&str>) {
        let requester = Self::addressee_of(source);

        if let Some(number) = number {
            let key = (requester.clone(), number.to_owned());
            self.dedup
                .retain(|_, at| at.elapsed() <= self.dedup_window);
            let duplicate = self.dedup.contains_key(&key);
            let _ = self.dedup.insert(key, Instant::now());

            // Duplicates are acked again but not re-dispatched.
            self.reply(aprs::encode_ack(&requester, number));
            if duplicate {
                debug!("duplicate message {number} from {requester}");
                return;
            }
        }

        match text.trim().to_ascii_uppercase().as_str() {
            "APRSD" => {
                let heard = self.heard.list();
                self.reply(aprs::encode_aprsd_response(&requester, &heard));
            }
            "APRST" | "?APRSP" => {
                let position = self.collector.latest();
                let text = match position {
                    Some(point) => format!(
                        "lat={} lon={} alt={}m ({})",
                        point.gps_lat, point.gps_lon, point.gps_alt, point.gps_state
                    ),
                    None => "no position".to_owned(),
                };
                if let Ok(info) = aprs::encode_message(&requester, &text, None) {
                    self.reply(info);
                }
            }
            "PING" => {
                if let Ok(info) = aprs::encode_message(&requester, "pong", None) {
                    self.reply(info);
                }
            }
            "SAT" => {
                let sats = self.collector.latest().map_or(0, |p| p.gps_sats);
                if let Ok(info) = aprs::encode_message(&requester, &format!("sats={sats}"), None)
                {
                    self.reply(info);
                }
            }
            "REBOOT" => {
                info!("reboot requested over the air by {requester}");
                self.reboot.store(true, Ordering::Release);
                if let Ok(info) = aprs::encode_message(&requester, "rebooting", None) {
                    self.reply(info);
                }
            }
            _ => {}
        }
    }

    /// Sends a reply frame at ack priority. Pool exhaustion drops the reply.
    fn reply(&self, info: Vec<u8>) {
        let destination = match Address::new(self.config.destination(), 0) {
            Ok(address) => address,
            Err(e) => {
                warn!("invalid destination configured: {e}");
                return;
            }
        };
        let path: Vec<Address> = self
            .config
            .path_entries()
            .iter()
            .filter_map(|entry| entry.parse().ok())
            .collect();

        let packet = match Packet::new(self.own.clone(), destination, path, info) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("could not build reply: {e}");
                return;
            }
        };
        let Some(handle) = self.pool.allocate(packet) else {
            warn!("packet pool exhausted, dropping reply");
            return;
        };

        let radio_config = self.config.radio();
        let task = RadioTask {
            packet: handle,
            frequency: Frequency::Dynamic,
            power: radio_config.power(),
            modulation: radio_config.modulation(),
            cca_rssi_dbm: radio_config.cca_rssi_dbm(),
            preamble: radio_config.preamble(),
            priority: Priority::Ack,
            timeout: Duration::from_secs(radio_config.tx_timeout_s()),
            done: None,
            cancel: None,
        };
        if let Err(e) = self.radio.submit(task) {
            warn!("could not enqueue reply: {e}");
        }
    }

    /// Digipeats a frame once when the next unused path entry names us or a
    /// `WIDEn-n` alias: the matched entry gets its H bit, a following
    /// `WIDEn-n` hop is decremented.
    fn digipeat(&self, packet: &Packet) {
        let Some(index) = packet.path.iter().position(|digi| !digi.repeated()) else {
            return;
        };

        let mut path = packet.path.clone();
        let entry = &mut path[index];
        let own_match = entry.call() == self.own.call() && entry.ssid() == self.own.ssid();
        let fill_in = entry.call() == "WIDE1" && entry.ssid() == 1;

        if own_match || fill_in {
            entry.set_repeated(true);
            if let Some(next) = path.get_mut(index + 1) {
                if let Some(decremented) = decrement_wide(next) {
                    *next = decremented;
                }
            }
        } else if let Some(decremented) = decrement_wide(entry) {
            *entry = decremented;
        } else {
            return;
        }

        let repeated = match Packet::new(
            packet.source.clone(),
            packet.destination.clone(),
            path,
            packet.info.clone(),
        ) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("could not rebuild digipeated frame: {e}");
                return;
            }
        };

        let Some(handle) = self.pool.allocate(repeated) else {
            warn!("packet pool exhausted, dropping digipeat");
            return;
        };
        let radio_config = self.config.radio();
        let task = RadioTask {
            packet: handle,
            frequency: Frequency::Dynamic,
            power: radio_config.power(),
            modulation: radio_config.modulation(),
            cca_rssi_dbm: radio_config.cca_rssi_dbm(),
            preamble: radio_config.preamble(),
            priority: Priority::Digipeat,
            timeout: Duration::from_secs(radio_config.tx_timeout_s()),
            done: None,
            cancel: None,
        };
        if let Err(e) = self.radio.submit(task) {
            warn!("could not enqueue digipeat: {e}");
        }
    }
}

/// Decrements a `WIDEn-n` hop. The entry is consumed (H bit) when its hop
/// count runs out.
fn decrement_wide(entry: &Address) -> Option<Address> {
    let n: u8 = entry.call().strip_prefix("WIDE")?.parse().ok()?;
    if !(2..=7).contains(&n) || entry.ssid() == 0 || entry.repeated() {
        return None;
    }
    let mut decremented = Address::new(entry.call(), entry.ssid() - 1).ok()?;
    if decremented.ssid() == 0 {
        decremented.set_repeated(true);
    }
    Some(decremented)
}
