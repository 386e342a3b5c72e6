// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transaction arbiter: a single worker thread that owns the kernel
//! adapter and the busy line, draining a bounded FIFO of requests.
//!
//! Every piece of bus traffic in the process funnels through the worker;
//! the kernel I²C handle is never touched off-worker. Callers block on a
//! single-use reply slot, which the worker resolves exactly once. A caller
//! that gives up and drops its slot does not cancel anything; the worker
//! finishes the transaction and the bytes fall on the floor.
//!
//! Per request the worker:
//!
//! 1. polls `try_claim` every 2 ms until it owns the busy line, bounded by
//!    the caller's timeout measured from the start of processing;
//! 2. drives the line high across the kernel transaction, retrying the
//!    transaction itself up to 2 times on I/O error, 20 ms apart;
//! 3. resolves the reply slot and releases the line on *every* exit
//!    path, success or not.
//!
//! A claim timeout additionally launches the one-shot busy-duration
//! diagnostic, which watches how long the peer holds the line and reports
//! it as an `i2cBusyPinTimeout` event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use drv_event_api::{Event, EventKind, EventSink, Severity};
use drv_i2c_api::{validate, Bus, I2cError};

use crate::bus::BusHardware;
use crate::busy::ArbitrationPin;

/// Enqueue blocks when the queue is full; there is no shedding.
const QUEUE_DEPTH: usize = 32;
const CLAIM_POLL: Duration = Duration::from_millis(2);
const IO_RETRIES: u32 = 2;
const IO_RETRY_SPACING: Duration = Duration::from_millis(20);

/// Busy-duration diagnostic: sample cadence and how long we are willing
/// to watch a wedged line before reporting it as never released.
const DIAG_POLL: Duration = Duration::from_millis(50);
const DIAG_OBSERVATION_CAP: Duration = Duration::from_secs(60);

pub struct TxRequest {
    addr: u8,
    write: Vec<u8>,
    read_len: usize,
    timeout: Duration,
    id: u64,
    admitted: Instant,
    reply: Sender<Result<Vec<u8>, I2cError>>,
}

/// Cloneable submission handle. Inside the service process this doubles
/// as the [`Bus`] implementation, so the EEPROM store reaches the bus
/// through the same serialization point as every RPC caller.
#[derive(Clone)]
pub struct ArbiterHandle {
    queue: SyncSender<TxRequest>,
    next_id: Arc<AtomicU64>,
}

impl ArbiterHandle {
    pub fn submit(
        &self,
        addr: u8,
        write: Vec<u8>,
        read_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, I2cError> {
        let (reply, slot) = mpsc::channel();
        let request = TxRequest {
            addr,
            write,
            read_len,
            timeout,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            admitted: Instant::now(),
            reply,
        };
        self.queue
            .send(request)
            .map_err(|_| I2cError::Rpc("i2c worker exited".to_string()))?;
        slot.recv()
            .map_err(|_| I2cError::Rpc("i2c worker dropped a reply slot".to_string()))?
    }
}

impl Bus for ArbiterHandle {
    fn tx(
        &mut self,
        addr: u8,
        write: &[u8],
        read_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, I2cError> {
        validate(write, read_len)?;
        self.submit(addr, write.to_vec(), read_len, timeout)
    }
}

pub fn spawn<B, P>(bus: B, pin: P, events: Arc<dyn EventSink>) -> ArbiterHandle
where
    B: BusHardware + 'static,
    P: ArbitrationPin + 'static,
{
    let (queue, requests) = mpsc::sync_channel(QUEUE_DEPTH);
    let worker = Worker {
        bus,
        pin: Arc::new(Mutex::new(pin)),
        events,
        diag_started: Arc::new(AtomicBool::new(false)),
        requests,
    };
    std::thread::Builder::new()
        .name("i2c-worker".to_string())
        .spawn(move || worker.run())
        .expect("failed to spawn i2c worker thread");
    ArbiterHandle {
        queue,
        next_id: Arc::new(AtomicU64::new(0)),
    }
}

struct Worker<B, P> {
    bus: B,
    // Shared with the busy-duration diagnostic, which only ever reads.
    pin: Arc<Mutex<P>>,
    events: Arc<dyn EventSink>,
    diag_started: Arc<AtomicBool>,
    requests: Receiver<TxRequest>,
}

impl<B: BusHardware, P: ArbitrationPin + 'static> Worker<B, P> {
    fn run(mut self) {
        while let Ok(request) = self.requests.recv() {
            let result = self.process(&request);
            // The caller may have abandoned its slot; that is its problem.
            let _ = request.reply.send(result);
        }
        log::info!("i2c worker: all handles dropped, exiting");
    }

    fn process(&mut self, request: &TxRequest) -> Result<Vec<u8>, I2cError> {
        let queued = request.admitted.elapsed();
        if queued > Duration::from_millis(50) {
            log::debug!(
                "tx {}: spent {}ms in queue before processing",
                request.id,
                queued.as_millis()
            );
        }

        self.claim(request)?;
        let result = self.transact_claimed(request);
        match self.with_pin(|pin| pin.release()) {
            Ok(()) => result,
            Err(e) => {
                log::error!("tx {}: busy line release failed: {}", request.id, e.0);
                Err(I2cError::Lock)
            }
        }
    }

    /// Poll for the busy line until claimed or the caller's timeout runs
    /// out. The timeout clock starts when processing starts, so time spent
    /// behind other requests in the queue does not count against it.
    fn claim(&mut self, request: &TxRequest) -> Result<(), I2cError> {
        let deadline = Instant::now() + request.timeout;
        loop {
            if self.with_pin(|pin| pin.try_claim()).map_err(|e| {
                log::error!("tx {}: busy line claim failed: {}", request.id, e.0);
                I2cError::Lock
            })? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "tx {}: busy line not free within {}ms",
                    request.id,
                    request.timeout.as_millis()
                );
                self.spawn_busy_diagnostic();
                // Leave the pin as we found it; it was never ours. The
                // release in `process` would be a no-op but we short out
                // here so the error is unambiguous.
                return Err(I2cError::BusyTimeout);
            }
            std::thread::sleep(CLAIM_POLL);
        }
    }

    fn transact_claimed(&mut self, request: &TxRequest) -> Result<Vec<u8>, I2cError> {
        self.with_pin(|pin| pin.drive_high()).map_err(|e| {
            log::error!("tx {}: could not mark bus owned: {}", request.id, e.0);
            I2cError::Lock
        })?;

        let mut attempt = 0;
        loop {
            match self.bus.transact(request.addr, &request.write, request.read_len) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    attempt += 1;
                    if attempt > IO_RETRIES {
                        log::warn!(
                            "tx {}: addr {:#04x} failed after {} attempts: {}",
                            request.id,
                            request.addr,
                            attempt,
                            e
                        );
                        return Err(I2cError::Io);
                    }
                    log::debug!(
                        "tx {}: addr {:#04x} attempt {} failed: {}",
                        request.id,
                        request.addr,
                        attempt,
                        e
                    );
                    std::thread::sleep(IO_RETRY_SPACING);
                }
            }
        }
    }

    fn with_pin<T>(
        &self,
        f: impl FnOnce(&mut P) -> Result<T, crate::busy::PinError>,
    ) -> Result<T, crate::busy::PinError> {
        let mut pin = self
            .pin
            .lock()
            .map_err(|_| crate::busy::PinError("busy pin mutex poisoned".to_string()))?;
        f(&mut pin)
    }

    /// Started at most once per process. Watches the line after a claim
    /// timeout and reports how long the peer held it.
    fn spawn_busy_diagnostic(&self) {
        if self.diag_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pin = Arc::clone(&self.pin);
        let events = Arc::clone(&self.events);
        let spawned = std::thread::Builder::new()
            .name("busy-diag".to_string())
            .spawn(move || {
                let started = Instant::now();
                let released = loop {
                    if started.elapsed() >= DIAG_OBSERVATION_CAP {
                        break false;
                    }
                    std::thread::sleep(DIAG_POLL);
                    let free = pin
                        .lock()
                        .ok()
                        .and_then(|mut p| p.is_free().ok());
                    match free {
                        Some(true) => break true,
                        Some(false) => {}
                        None => break false,
                    }
                };
                let held = started.elapsed();
                log::warn!(
                    "busy line held by peer for {}ms after a claim timeout (released: {})",
                    held.as_millis(),
                    released
                );
                events.publish(Event::new(
                    EventKind::I2cBusyPinTimeout,
                    Severity::Warn,
                    serde_json::json!({
                        "heldMs": held.as_millis() as u64,
                        "released": released,
                    }),
                ));
            });
        if let Err(e) = spawned {
            log::error!("could not spawn busy-line diagnostic: {}", e);
        }
    }
}
