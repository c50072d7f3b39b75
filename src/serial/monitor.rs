//! Event monitoring loop.
//!
//! One thread per open port waits on the device event mask, decodes each
//! completed wait and hands typed notifications to the dispatcher. Within a
//! cycle the order is fixed: line errors, received data, transmit empty,
//! then one aggregated pin change.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::control::StatusReporter;
use super::dispatch::NotificationSender;
use super::overlapped::begin_wait;
use super::types::{Counters, SerialEvent};
use crate::device::native::{HardwareEvent, ERROR_GEN_FAILURE};
use crate::device::{CancelScope, DeviceError, DeviceHandle};

/// How often a stop request re-issues the wait cancellation while the loop
/// has not acknowledged it.
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Waiting,
    Dispatching,
    Stopped,
}

/// Fault recorded by the loop, surfaced by the facade until close.
pub(crate) type FaultLatch = Arc<Mutex<Option<String>>>;

pub(crate) struct MonitorContext {
    pub handle: Arc<DeviceHandle>,
    pub reporter: Arc<StatusReporter>,
    pub notifications: NotificationSender,
    pub counters: Arc<Counters>,
    pub fault: FaultLatch,
    pub received_bytes_threshold: usize,
}

pub(crate) struct EventMonitor {
    handle: Arc<DeviceHandle>,
    shutdown: Option<oneshot::Sender<()>>,
    ended: std_mpsc::Receiver<()>,
    state: Arc<Mutex<LoopState>>,
    join: Option<JoinHandle<()>>,
}

impl EventMonitor {
    /// Arms the event mask before returning, so nothing raised after open
    /// is missed, then runs the loop on its own thread.
    pub fn start(context: MonitorContext) -> Result<Self, DeviceError> {
        context.handle.device().set_event_mask(HardwareEvent::all())?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (ended_tx, ended) = std_mpsc::sync_channel(1);
        let state = Arc::new(Mutex::new(LoopState::Idle));
        let handle = Arc::clone(&context.handle);
        let loop_state = Arc::clone(&state);

        let join = thread::Builder::new()
            .name(format!("comport-events-{}", handle.name()).to_lowercase())
            .spawn(move || {
                let event_loop = EventLoop {
                    context,
                    shutdown: shutdown_rx,
                    state: loop_state,
                };
                event_loop.run();
                let _ = ended_tx.send(());
            })
            .map_err(|e| {
                DeviceError::new(ERROR_GEN_FAILURE, format!("failed to start event loop: {}", e))
            })?;

        Ok(Self {
            handle,
            shutdown: Some(shutdown),
            ended,
            state,
            join: Some(join),
        })
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals shutdown, unblocks the pending wait and waits for the loop to
    /// acknowledge. Returns false if it did not stop within `timeout`.
    pub fn stop(mut self, timeout: Duration) -> bool {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            // A wait issued just after the previous cancel would miss it.
            self.handle.device().cancel(CancelScope::Wait);
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "{}: event loop did not stop within {:?}",
                    self.handle.name(),
                    timeout
                );
                return false;
            }
            match self.ended.recv_timeout(STOP_POLL.min(deadline - now)) {
                Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            }
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        true
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            self.handle.device().cancel(CancelScope::Wait);
        }
    }
}

struct EventLoop {
    context: MonitorContext,
    shutdown: oneshot::Receiver<()>,
    state: Arc<Mutex<LoopState>>,
}

impl EventLoop {
    fn set_state(&self, state: LoopState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn shutdown_requested(&mut self) -> bool {
        !matches!(
            self.shutdown.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }

    fn run(mut self) {
        let name = self.context.handle.name().to_string();
        log::debug!("{}: event loop started", name);

        loop {
            if self.shutdown_requested() || self.context.handle.is_released() {
                break;
            }

            self.set_state(LoopState::Waiting);
            let waited = self
                .context
                .handle
                .device()
                .set_event_mask(HardwareEvent::all())
                .and_then(|_| begin_wait(&self.context.handle))
                .and_then(|wait| wait.end());

            let events = match waited {
                Ok(events) => events,
                Err(e) if e.is_aborted() => continue,
                Err(e) => {
                    self.record_fault(&e);
                    break;
                }
            };
            if events.is_empty() {
                continue;
            }

            self.set_state(LoopState::Dispatching);
            log::trace!("{}: events {:?}", name, events);
            if let Err(e) = self.dispatch(events) {
                if e.is_fatal() {
                    self.record_fault(&e);
                    break;
                }
                log::warn!("{}: dispatching {:?} failed: {}", name, events, e);
            }
        }

        self.set_state(LoopState::Stopped);
        log::debug!("{}: event loop stopped", name);
    }

    fn record_fault(&self, error: &DeviceError) {
        let fault = error.to_string();
        log::error!("{}: event loop stopping on fault: {}", self.context.handle.name(), fault);
        self.context.counters.record_fault(&fault);
        *self
            .context
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    fn dispatch(&self, events: HardwareEvent) -> Result<(), DeviceError> {
        if events.contains(HardwareEvent::LINE_ERROR) {
            if let Err(e) = self.context.reporter.clear_and_snapshot() {
                if e.is_fatal() {
                    return Err(e);
                }
                log::warn!("{}: reading line errors failed: {}", self.context.handle.name(), e);
            }
        }

        if events.intersects(HardwareEvent::RECEIVE_EVENTS) {
            self.data_received(events.contains(HardwareEvent::EVENT_CHAR))?;
        }

        if events.contains(HardwareEvent::TRANSMIT_EMPTY) {
            self.context.notifications.send(SerialEvent::TransmitEmpty);
        }

        let changed = events & HardwareEvent::PIN_EVENTS;
        if !changed.is_empty() {
            let pins = self.context.handle.device().modem_status()?;
            self.context
                .notifications
                .send(SerialEvent::PinChanged { changed, pins });
        }
        Ok(())
    }

    /// Coalesces arrivals: re-reads the queue depth until it stops growing so
    /// a burst yields one notification. Bytes stay queued for `read`.
    fn data_received(&self, event_char: bool) -> Result<(), DeviceError> {
        // Bytes move into the receive buffer; reads are served from there.
        let available = self.context.handle.drain_input()?;

        let due = available >= self.context.received_bytes_threshold
            || (event_char && available > 0);
        if due {
            self.context.notifications.send(SerialEvent::DataReceived {
                available,
                event_char,
            });
        }
        Ok(())
    }
}
