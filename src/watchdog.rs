//! Watchdog module.
//!
//! Every application thread registers a heartbeat. A monitor thread checks
//! the registry and fires the reset action when any thread goes quiet for
//! longer than the timeout, standing in for the hardware watchdog reset.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::error;

use crate::error;

#[derive(Debug)]
struct Inner {
    timeout: Duration,
    beats: Mutex<HashMap<&'static str, Instant>>,
    stop: AtomicBool,
}

/// Heartbeat registry.
#[derive(Debug, Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

/// One thread's heartbeat handle.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    inner: Arc<Inner>,
    name: &'static str,
}

impl Heartbeat {
    /// Marks the owning thread alive.
    pub fn beat(&self) {
        let mut beats = match self.inner.beats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = beats.insert(self.name, Instant::now());
    }
}

impl Watchdog {
    /// Creates a registry with the given heartbeat timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout,
                beats: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a thread and returns its heartbeat handle, already beaten
    /// once.
    pub fn register(&self, name: &'static str) -> Heartbeat {
        let heartbeat = Heartbeat {
            inner: Arc::clone(&self.inner),
            name,
        };
        heartbeat.beat();
        heartbeat
    }

    /// Stops the monitor thread.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// Spawns the monitor. `on_reset` runs once for the first thread found
    /// stale; the monitor exits afterwards, like a one-shot hardware reset.
    pub fn spawn<F>(&self, mut on_reset: F) -> JoinHandle<()>
    where
        F: FnMut(&'static str) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("watchdog".to_owned())
            .spawn(move || loop {
                if inner.stop.load(Ordering::Acquire) {
                    return;
                }

                let stale = {
                    let beats = match inner.beats.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    beats
                        .iter()
                        .find(|(_, at)| at.elapsed() > inner.timeout)
                        .map(|(name, _)| *name)
                };

                if let Some(name) = stale {
                    error!(
                        "{}",
                        error::Watchdog::MissedHeartbeat {
                            name: name.to_owned()
                        }
                    );
                    on_reset(name);
                    return;
                }

                thread::sleep(inner.timeout.min(Duration::from_millis(100)) / 4);
            })
            .expect("spawning the watchdog cannot fail")
    }
}
