//! Receiver thread.
//!
//! Drains decoded frames from the radio manager and routes them through the
//! dispatcher.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use tracing::debug;

use crate::{ax25::Packet, dispatch::Dispatcher, watchdog::Heartbeat};

/// Receiver thread context.
pub struct Receiver {
    /// Decoded frames from the radio manager.
    pub frames: mpsc::Receiver<Packet>,
    /// The dispatcher.
    pub dispatcher: Dispatcher,
    /// Watchdog heartbeat.
    pub heartbeat: Heartbeat,
    /// Shutdown flag.
    pub shutdown: Arc<AtomicBool>,
}

/// Receiver thread body.
pub fn run(mut receiver: Receiver) {
    loop {
        receiver.heartbeat.beat();
        match receiver.frames.recv_timeout(Duration::from_millis(200)) {
            Ok(packet) => {
                debug!("received frame from {}", packet.source);
                receiver.dispatcher.handle(&packet);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if receiver.shutdown.load(Ordering::Acquire) {
                    return;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}
