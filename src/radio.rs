//! Radio manager module.
//!
//! The radio manager exclusively owns the transceiver. Application threads
//! enqueue [`RadioTask`]s; a worker thread serves them in priority order
//! (ack > digipeat > beacon > image, FIFO within a class), runs the clear
//! channel assessment, keys the transmitter and returns to receive on the
//! last listening frequency. Frames received between transmissions are
//! decoded and forwarded to the receiver thread.

#![allow(missing_debug_implementations)]

use std::{
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{bail, Error};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    ax25::{self, Packet},
    error,
    geofence::{self, Frequency},
    packet::PacketHandle,
    telemetry::DataPoint,
};

/// Default per-task timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between the end of data and unkeying.
const TAIL: Duration = Duration::from_millis(10);

/// How often the idle worker polls the receiver.
const RX_POLL: Duration = Duration::from_millis(50);

/// Flag octets preceding a scrambled 9600 baud frame.
const FSK_HDLC_PREAMBLE: u16 = 8;

/// Supported modulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    /// AFSK 1200 baud, 1200/2200 Hz, NRZI.
    Afsk1200,
    /// 2FSK 9600 baud, G3RUH scrambled.
    Fsk9600,
}

impl Modulation {
    /// Parses a configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "afsk1200" => Some(Modulation::Afsk1200),
            "fsk9600" => Some(Modulation::Fsk9600),
            _ => None,
        }
    }

    /// The configuration name.
    pub fn name(self) -> &'static str {
        match self {
            Modulation::Afsk1200 => "afsk1200",
            Modulation::Fsk9600 => "fsk9600",
        }
    }
}

/// Transceiver driver contract (Si446x class).
pub trait Transceiver: Send {
    /// Tunes the synthesizer, in Hz.
    fn set_frequency(&mut self, hz: u32) -> Result<(), Error>;
    /// Sets the PA level (0-127).
    fn set_power(&mut self, level: u8) -> Result<(), Error>;
    /// Selects the modulation.
    fn set_modulation(&mut self, modulation: Modulation) -> Result<(), Error>;
    /// Samples the current RSSI, in dBm.
    fn rssi_dbm(&mut self) -> Result<i16, Error>;
    /// Keys the transmitter and emits one modulated bitstream.
    fn transmit(&mut self, bits: &[u8]) -> Result<(), Error>;
    /// Polls for one received frame (bytes including FCS).
    fn receive(&mut self) -> Option<Vec<u8>>;
    /// Hard-resets the chip after a failure.
    fn reset(&mut self) -> Result<(), Error>;
}

/// Task priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Replies to incoming messages.
    Ack,
    /// Digipeated frames.
    Digipeat,
    /// Position and telemetry beacons.
    Beacon,
    /// SSDV image frames.
    Image,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Ack => 3,
            Priority::Digipeat => 2,
            Priority::Beacon => 1,
            Priority::Image => 0,
        }
    }
}

/// One transmission request.
pub struct RadioTask {
    /// The frame to send.
    pub packet: PacketHandle,
    /// Frequency request, resolved against the geofence at serve time.
    pub frequency: Frequency,
    /// PA level (0-127).
    pub power: u8,
    /// Modulation to use.
    pub modulation: Modulation,
    /// CCA threshold in dBm; 0 disables the assessment.
    pub cca_rssi_dbm: i16,
    /// Preamble length: flag octets for AFSK, 0x33 sync octets for 2FSK.
    pub preamble: u16,
    /// Priority class.
    pub priority: Priority,
    /// Deadline relative to submission.
    pub timeout: Duration,
    /// Completion notifier.
    pub done: Option<mpsc::Sender<Result<(), error::Radio>>>,
    /// Cooperative cancel flag, honoured until transmission preparation
    /// starts.
    pub cancel: Option<Arc<AtomicBool>>,
}

struct QueuedTask {
    rank: u8,
    seq: u64,
    deadline: Instant,
    task: RadioTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher rank first, then FIFO within the class.
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    seq: u64,
    shutdown: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Source of the last published snapshot, used for dynamic frequency
/// resolution.
pub type PositionSource = Arc<dyn Fn() -> Option<Arc<DataPoint>> + Send + Sync>;

/// Radio manager tuning knobs.
#[derive(Debug, Clone)]
pub struct RadioParams {
    /// Maximum CCA attempts before `ChannelBusy`.
    pub cca_max_retries: u8,
    /// Cooldown after a hardware failure.
    pub cooldown: Duration,
    /// Fallback frequency when no region matches.
    pub default_frequency_hz: u32,
    /// Initial (and fallback) receive frequency.
    pub rx_frequency_hz: u32,
}

/// Cloneable handle used by application threads to reach the worker.
#[derive(Clone)]
pub struct RadioHandle {
    queue: Arc<Queue>,
}

impl RadioHandle {
    /// Enqueues a task without waiting for completion.
    pub fn submit(&self, task: RadioTask) -> Result<(), error::Radio> {
        let mut state = match self.queue.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.shutdown {
            return Err(error::Radio::NotRunning);
        }
        let seq = state.seq;
        state.seq += 1;
        let deadline = Instant::now() + task.timeout;
        state.heap.push(QueuedTask {
            rank: task.priority.rank(),
            seq,
            deadline,
            task,
        });
        self.queue.cond.notify_one();
        Ok(())
    }

    /// Enqueues a task and blocks until it completes or times out. On
    /// timeout the task is cancelled so the worker skips it if it has not
    /// entered preparation yet.
    pub fn transmit_blocking(&self, mut task: RadioTask) -> Result<(), error::Radio> {
        let (done_tx, done_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        task.done = Some(done_tx);
        task.cancel = Some(Arc::clone(&cancel));
        let timeout = task.timeout;

        self.submit(task)?;
        match done_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                cancel.store(true, Ordering::Release);
                Err(error::Radio::Timeout)
            }
        }
    }

    /// Asks the worker to drain its queue and stop.
    pub fn shutdown(&self) {
        let mut state = match self.queue.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.shutdown = true;
        self.queue.cond.notify_all();
    }
}

/// Spawns the radio manager worker.
pub fn spawn(
    mut transceiver: Box<dyn Transceiver>,
    params: RadioParams,
    position: PositionSource,
    rx_out: mpsc::Sender<Packet>,
) -> (RadioHandle, JoinHandle<()>) {
    let queue = Arc::new(Queue {
        state: Mutex::new(QueueState {
            heap: BinaryHeap::new(),
            seq: 0,
            shutdown: false,
        }),
        cond: Condvar::new(),
    });
    let handle = RadioHandle {
        queue: Arc::clone(&queue),
    };

    let worker = thread::Builder::new()
        .name("radio".to_owned())
        .spawn(move || {
            let mut last_rx_hz = params.rx_frequency_hz;
            if let Err(e) = transceiver.set_frequency(last_rx_hz) {
                warn!("could not tune initial receive frequency: {e:#}");
            }

            loop {
                let next = {
                    let mut state = match queue.state.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if state.heap.is_empty() {
                        if state.shutdown {
                            break;
                        }
                        let (guard, _) = match queue.cond.wait_timeout(state, RX_POLL) {
                            Ok(r) => r,
                            Err(poisoned) => {
                                let r = poisoned.into_inner();
                                (r.0, r.1)
                            }
                        };
                        state = guard;
                    }
                    state.heap.pop()
                };

                match next {
                    Some(queued) => {
                        let result = serve(
                            transceiver.as_mut(),
                            &params,
                            &position,
                            &mut last_rx_hz,
                            queued,
                        );
                        if let Err(e) = &result {
                            debug!("radio task failed: {e}");
                        }
                    }
                    None => poll_rx(transceiver.as_mut(), &rx_out),
                }
            }
            info!("radio manager stopped");
        })
        .expect("spawning the radio worker cannot fail");

    (handle, worker)
}

fn notify(task: &RadioTask, result: Result<(), error::Radio>) -> Result<(), error::Radio> {
    if let Some(done) = &task.done {
        let _ = done.send(result);
    }
    result
}

fn serve(
    trx: &mut dyn Transceiver,
    params: &RadioParams,
    position: &PositionSource,
    last_rx_hz: &mut u32,
    queued: QueuedTask,
) -> Result<(), error::Radio> {
    let task = queued.task;

    if Instant::now() >= queued.deadline {
        return notify(&task, Err(error::Radio::Timeout));
    }
    if let Some(cancel) = &task.cancel {
        if cancel.load(Ordering::Acquire) {
            return notify(&task, Err(error::Radio::Cancelled));
        }
    }

    // PREP: from here the transmission runs to completion.
    let band = match task.frequency {
        Frequency::Static(hz) => geofence::band_for(hz).unwrap_or(&geofence::BAND_2M),
        Frequency::Dynamic => &geofence::BAND_2M,
    };
    let snapshot = position();
    let hz = geofence::resolve(
        task.frequency,
        snapshot.as_deref(),
        params.default_frequency_hz,
        band,
    );

    let result = transmit(trx, params, &task, hz);
    match &result {
        Ok(()) => {
            debug!(
                "transmitted {} byte frame on {} Hz ({})",
                task.packet.with(|p| p.info.len()),
                hz,
                task.modulation.name()
            );
        }
        Err(error::Radio::Hardware) => {
            warn!("transceiver failure, resetting driver");
            if let Err(e) = trx.reset() {
                warn!("transceiver reset failed: {e:#}");
            }
            thread::sleep(params.cooldown);
        }
        Err(_) => {}
    }

    // Back to listening on the last receive frequency.
    if trx.set_frequency(*last_rx_hz).is_err() {
        *last_rx_hz = params.rx_frequency_hz;
    }

    notify(&task, result)
}

fn transmit(
    trx: &mut dyn Transceiver,
    params: &RadioParams,
    task: &RadioTask,
    hz: u32,
) -> Result<(), error::Radio> {
    if trx.set_frequency(hz).is_err()
        || trx.set_power(task.power & 0x7F).is_err()
        || trx.set_modulation(task.modulation).is_err()
    {
        return Err(error::Radio::Hardware);
    }

    if task.cca_rssi_dbm != 0 {
        clear_channel(trx, task.cca_rssi_dbm, params.cca_max_retries)?;
    }

    let frame = task.packet.with(Packet::encode_with_fcs);
    let airstream = match task.modulation {
        Modulation::Afsk1200 => ax25::nrzi_encode(&ax25::hdlc_bits(&frame, task.preamble)),
        Modulation::Fsk9600 => {
            let sync = vec![0x33u8; usize::from(task.preamble)];
            let mut bits = ax25::bytes_to_bits(&sync);
            bits.extend(ax25::scramble(&ax25::hdlc_bits(&frame, FSK_HDLC_PREAMBLE)));
            bits
        }
    };

    if trx.transmit(&airstream).is_err() {
        return Err(error::Radio::Hardware);
    }
    thread::sleep(TAIL);
    Ok(())
}

fn clear_channel(
    trx: &mut dyn Transceiver,
    threshold_dbm: i16,
    max_retries: u8,
) -> Result<(), error::Radio> {
    let mut rng = rand::thread_rng();
    for attempt in 0..max_retries {
        let rssi = trx.rssi_dbm().map_err(|_| error::Radio::Hardware)?;
        if rssi < threshold_dbm {
            return Ok(());
        }
        // Randomised backoff, widening with every busy attempt.
        let upper = u64::min(500, 100u64 << u32::from(attempt).min(4));
        let backoff = rng.gen_range(50..=upper.max(51));
        debug!(
            "channel busy ({rssi} dBm >= {threshold_dbm} dBm), attempt {}, backing off {backoff} ms",
            attempt + 1
        );
        thread::sleep(Duration::from_millis(backoff));
    }
    Err(error::Radio::ChannelBusy)
}

fn poll_rx(trx: &mut dyn Transceiver, rx_out: &mpsc::Sender<Packet>) {
    while let Some(bytes) = trx.receive() {
        match Packet::decode(&bytes) {
            Ok(packet) => {
                if rx_out.send(packet).is_err() {
                    return;
                }
            }
            Err(e) => debug!("dropped received frame: {e}"),
        }
    }
}

/// One transmission as recorded by the bench transceiver.
#[derive(Debug, Clone)]
pub struct SimTx {
    /// Frequency at key-up, in Hz.
    pub hz: u32,
    /// PA level.
    pub power: u8,
    /// Modulation.
    pub modulation: Modulation,
    /// Start of transmission.
    pub started: Instant,
    /// End of transmission.
    pub finished: Instant,
    /// The modulated bitstream.
    pub bits: Vec<u8>,
}

#[derive(Debug, Default)]
struct SimTrxState {
    hz: u32,
    power: u8,
    modulation: Option<Modulation>,
    rssi_dbm: i16,
    fail_transmit: bool,
    resets: u32,
    sent: Vec<SimTx>,
    rx_queue: Vec<Vec<u8>>,
}

/// Deterministic transceiver stand-in used by the bench launcher and the
/// tests. Records every transmission and replays injected receive frames.
#[derive(Clone)]
pub struct SimTransceiver {
    state: Arc<Mutex<SimTrxState>>,
    /// Simulated on-air time per transmission.
    tx_duration: Duration,
}

impl SimTransceiver {
    /// Creates a quiet-channel transceiver.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimTrxState {
                rssi_dbm: -120,
                ..SimTrxState::default()
            })),
            tx_duration: Duration::from_millis(20),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimTrxState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Sets the ambient RSSI seen by the CCA.
    pub fn set_rssi(&self, dbm: i16) {
        self.lock().rssi_dbm = dbm;
    }

    /// Makes transmissions fail like a dead PA.
    pub fn set_fail_transmit(&self, fail: bool) {
        self.lock().fail_transmit = fail;
    }

    /// Injects a received frame (bytes including FCS).
    pub fn push_rx(&self, bytes: Vec<u8>) {
        self.lock().rx_queue.insert(0, bytes);
    }

    /// All recorded transmissions.
    pub fn transmissions(&self) -> Vec<SimTx> {
        self.lock().sent.clone()
    }

    /// Number of driver resets seen.
    pub fn resets(&self) -> u32 {
        self.lock().resets
    }
}

impl Default for SimTransceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Transceiver for SimTransceiver {
    fn set_frequency(&mut self, hz: u32) -> Result<(), Error> {
        self.lock().hz = hz;
        Ok(())
    }

    fn set_power(&mut self, level: u8) -> Result<(), Error> {
        self.lock().power = level;
        Ok(())
    }

    fn set_modulation(&mut self, modulation: Modulation) -> Result<(), Error> {
        self.lock().modulation = Some(modulation);
        Ok(())
    }

    fn rssi_dbm(&mut self) -> Result<i16, Error> {
        Ok(self.lock().rssi_dbm)
    }

    fn transmit(&mut self, bits: &[u8]) -> Result<(), Error> {
        let started = Instant::now();
        thread::sleep(self.tx_duration);
        let mut state = self.lock();
        if state.fail_transmit {
            bail!(error::Radio::Hardware);
        }
        let tx = SimTx {
            hz: state.hz,
            power: state.power,
            modulation: state.modulation.unwrap_or(Modulation::Afsk1200),
            started,
            finished: Instant::now(),
            bits: bits.to_vec(),
        };
        state.sent.push(tx);
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.lock().rx_queue.pop()
    }

    fn reset(&mut self) -> Result<(), Error> {
        let mut state = self.lock();
        state.resets += 1;
        state.fail_transmit = false;
        Ok(())
    }
}

/// Decodes a recorded AFSK airstream back into the frame it carried.
#[cfg(test)]
pub(crate) fn decode_afsk_airstream(bits: &[u8]) -> Packet {
    let nrz = ax25::nrzi_decode(bits);
    let flag = ax25::bytes_to_bits(&[ax25::FLAG]);
    let mut start = 0;
    while nrz[start..].starts_with(&flag) {
        start += 8;
    }
    let end = nrz.len() - 8;
    assert_eq!(&nrz[end..], flag.as_slice());
    let body = ax25::unstuff_bits(&nrz[start..end]);
    Packet::decode(&ax25::bits_to_bytes(&body)).expect("airstream carried a valid frame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ax25::Address,
        packet::PacketPool,
    };

    fn params() -> RadioParams {
        RadioParams {
            cca_max_retries: 5,
            cooldown: Duration::from_millis(1),
            default_frequency_hz: 144_800_000,
            rx_frequency_hz: 144_800_000,
        }
    }

    fn no_position() -> PositionSource {
        Arc::new(|| None)
    }

    fn task(pool: &PacketPool, priority: Priority, text: &str) -> RadioTask {
        let packet = Packet::new(
            Address::new("DL7AD", 12).unwrap(),
            Address::new("APECAN", 0).unwrap(),
            Vec::new(),
            text.as_bytes().to_vec(),
        )
        .unwrap();
        RadioTask {
            packet: pool.allocate(packet).unwrap(),
            frequency: Frequency::Static(144_800_000),
            power: 0x7F,
            modulation: Modulation::Afsk1200,
            cca_rssi_dbm: 0,
            preamble: 4,
            priority,
            timeout: Duration::from_secs(5),
            done: None,
            cancel: None,
        }
    }

    /// A busy channel fails with `ChannelBusy` after exactly the configured
    /// number of CCA attempts, and the packet slot returns to the pool.
    #[test]
    fn cca_busy_after_retries() {
        let trx = SimTransceiver::new();
        trx.set_rssi(-70);
        let (rx_tx, _rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);

        let pool = PacketPool::new(4);
        let mut t = task(&pool, Priority::Beacon, "busy");
        t.cca_rssi_dbm = -90;
        let result = handle.transmit_blocking(t);
        assert_eq!(result, Err(error::Radio::ChannelBusy));
        assert!(trx.transmissions().is_empty());
        // The worker drops its task reference right after notifying.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.available(), 4);

        handle.shutdown();
        worker.join().unwrap();
    }

    /// A quiet channel transmits despite a CCA threshold.
    #[test]
    fn cca_passes_on_quiet_channel() {
        let trx = SimTransceiver::new();
        trx.set_rssi(-120);
        let (rx_tx, _rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);

        let pool = PacketPool::new(4);
        let mut t = task(&pool, Priority::Beacon, "quiet");
        t.cca_rssi_dbm = -90;
        handle.transmit_blocking(t).unwrap();
        assert_eq!(trx.transmissions().len(), 1);

        handle.shutdown();
        worker.join().unwrap();
    }

    /// Transmissions from concurrent submitters never overlap in time.
    #[test]
    fn transmissions_serialised() {
        let trx = SimTransceiver::new();
        let (rx_tx, _rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);

        let pool = PacketPool::new(16);
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let handle = handle.clone();
                let pool = pool.clone();
                thread::spawn(move || {
                    for j in 0..3 {
                        let t = task(&pool, Priority::Beacon, &format!("t{i}-{j}"));
                        handle.transmit_blocking(t).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut sent = trx.transmissions();
        assert_eq!(sent.len(), 12);
        sent.sort_by_key(|tx| tx.started);
        for pair in sent.windows(2) {
            assert!(
                pair[1].started >= pair[0].finished,
                "overlapping transmissions"
            );
        }

        handle.shutdown();
        worker.join().unwrap();
    }

    /// Higher priority classes preempt queued lower ones; equal priorities
    /// stay FIFO.
    #[test]
    fn priority_order() {
        let trx = SimTransceiver::new();
        let (rx_tx, _rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);
        let pool = PacketPool::new(16);

        // Fill the worker with one long task so the rest queue behind it.
        let first = task(&pool, Priority::Image, "first");
        handle.submit(first).unwrap();

        handle.submit(task(&pool, Priority::Image, "img1")).unwrap();
        handle.submit(task(&pool, Priority::Image, "img2")).unwrap();
        handle.submit(task(&pool, Priority::Beacon, "beacon")).unwrap();
        handle.submit(task(&pool, Priority::Ack, "ack")).unwrap();

        handle.shutdown();
        worker.join().unwrap();

        let texts: Vec<Vec<u8>> = trx
            .transmissions()
            .iter()
            .map(|tx| decode_afsk_airstream(&tx.bits).info)
            .collect();
        assert_eq!(texts[1], b"ack");
        assert_eq!(texts[2], b"beacon");
        assert_eq!(texts[3], b"img1");
        assert_eq!(texts[4], b"img2");
    }

    /// A hardware failure resets the driver and surfaces `Hardware`; the
    /// next task goes through again.
    #[test]
    fn hardware_failure_resets_driver() {
        let trx = SimTransceiver::new();
        trx.set_fail_transmit(true);
        let (rx_tx, _rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);
        let pool = PacketPool::new(4);

        let result = handle.transmit_blocking(task(&pool, Priority::Beacon, "fail"));
        assert_eq!(result, Err(error::Radio::Hardware));
        assert_eq!(trx.resets(), 1);

        // The reset cleared the fault.
        handle
            .transmit_blocking(task(&pool, Priority::Beacon, "retry"))
            .unwrap();

        handle.shutdown();
        worker.join().unwrap();
    }

    /// Injected receive frames come back decoded.
    #[test]
    fn receive_path_decodes_frames() {
        let trx = SimTransceiver::new();
        let (rx_tx, rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);

        let packet = Packet::new(
            Address::new("DK3SB", 0).unwrap(),
            Address::new("APRS", 0).unwrap(),
            Vec::new(),
            b":DL7AD-12 :hello{001".to_vec(),
        )
        .unwrap();
        trx.push_rx(packet.encode_with_fcs());
        // A frame with a broken FCS is dropped silently.
        let mut bad = packet.encode_with_fcs();
        bad[3] ^= 0xFF;
        trx.push_rx(bad);

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, packet);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        handle.shutdown();
        worker.join().unwrap();
    }

    /// The dynamic frequency follows the snapshot position.
    #[test]
    fn dynamic_frequency_resolution() {
        let trx = SimTransceiver::new();
        let (rx_tx, _rx) = mpsc::channel();
        let position: PositionSource = Arc::new(|| {
            let mut point = DataPoint::empty(1);
            point.gps_state = crate::telemetry::GpsState::LockedOn;
            point.gps_lat = 377_749_000;
            point.gps_lon = -1_224_194_000;
            Some(Arc::new(point))
        });
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), position, rx_tx);
        let pool = PacketPool::new(4);

        let mut t = task(&pool, Priority::Beacon, "dynamic");
        t.frequency = Frequency::Dynamic;
        handle.transmit_blocking(t).unwrap();
        assert_eq!(trx.transmissions()[0].hz, 144_390_000);

        handle.shutdown();
        worker.join().unwrap();
    }

    /// The AFSK airstream decodes back to the submitted frame.
    #[test]
    fn afsk_airstream_round_trip() {
        let trx = SimTransceiver::new();
        let (rx_tx, _rx) = mpsc::channel();
        let (handle, worker) = spawn(Box::new(trx.clone()), params(), no_position(), rx_tx);
        let pool = PacketPool::new(4);

        handle
            .transmit_blocking(task(&pool, Priority::Beacon, "!4903.50N/07201.75WO"))
            .unwrap();
        let sent = trx.transmissions();
        let decoded = decode_afsk_airstream(&sent[0].bits);
        assert_eq!(decoded.info, b"!4903.50N/07201.75WO");
        assert_eq!(decoded.source.to_string(), "DL7AD-12");

        handle.shutdown();
        worker.join().unwrap();
    }
}
