use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::receive::{pull, Received};
use super::{Backend, CancelScope, DeviceError, SerialDevice};

/// Grace period for in-flight requests when a handle is dropped without an
/// explicit release.
const DROP_GRACE: Duration = Duration::from_millis(500);

const CANCEL_RETRY: Duration = Duration::from_millis(50);

/// Kind of request occupying a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
    Wait,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
            Direction::Wait => 2,
        }
    }

    pub fn scope(self) -> CancelScope {
        match self {
            Direction::Read => CancelScope::Read,
            Direction::Write => CancelScope::Write,
            Direction::Wait => CancelScope::Wait,
        }
    }
}

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Long-lived thread carrying the blocking device calls of one direction.
struct Worker {
    jobs: Sender<Job>,
    thread: ThreadId,
}

#[derive(Default)]
struct Slots {
    active: [Option<u64>; 3],
    in_flight: usize,
}

/// Exclusive owner of an opened device.
///
/// Configuration changes take the config lock exclusively while request
/// submission takes it shared, so a DCB write never interleaves with a
/// request being issued. At most one request per direction is outstanding.
pub struct DeviceHandle {
    device: Box<dyn SerialDevice>,
    released: AtomicBool,
    config_lock: RwLock<()>,
    slots: Mutex<Slots>,
    idle: Condvar,
    next_ticket: AtomicU64,
    received: Mutex<Received>,
    workers: Mutex<[Option<Worker>; 3]>,
}

impl DeviceHandle {
    pub fn open(backend: &dyn Backend, name: &str) -> Result<Self, DeviceError> {
        let device = backend.open(name)?;
        Ok(Self::new(device))
    }

    pub fn new(device: Box<dyn SerialDevice>) -> Self {
        Self {
            device,
            released: AtomicBool::new(false),
            config_lock: RwLock::new(()),
            slots: Mutex::new(Slots::default()),
            idle: Condvar::new(),
            next_ticket: AtomicU64::new(1),
            received: Mutex::new(Received::default()),
            workers: Mutex::new([None, None, None]),
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn device(&self) -> &dyn SerialDevice {
        self.device.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn ensure_live(&self) -> Result<(), DeviceError> {
        if self.is_released() {
            Err(DeviceError::invalid_handle(format!(
                "{} has been closed",
                self.name()
            )))
        } else {
            Ok(())
        }
    }

    pub(crate) fn configure(&self) -> RwLockWriteGuard<'_, ()> {
        self.config_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn submit(&self) -> RwLockReadGuard<'_, ()> {
        self.config_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn received(&self) -> MutexGuard<'_, Received> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves queued input into the receive buffer unless a read is waiting
    /// on the device, which then takes the bytes itself. Returns the bytes
    /// available to the next read.
    pub(crate) fn drain_input(&self) -> Result<usize, DeviceError> {
        let _submit = self.submit();
        self.ensure_live()?;
        let mut received = self.received();
        if !self.is_busy(Direction::Read) {
            received.fill_from(self.device())?;
        }
        let queued = self.device.comm_status()?.in_queue as usize;
        Ok(received.len() + queued)
    }

    /// Buffered plus device-queued input.
    pub fn bytes_available(&self) -> Result<usize, DeviceError> {
        self.ensure_live()?;
        let received = self.received();
        Ok(received.len() + self.device.comm_status()?.in_queue as usize)
    }

    /// Takes buffered bytes first, then tops up from the device without
    /// blocking. Returns the count placed in `out`.
    pub(crate) fn take_available(&self, out: &mut [u8]) -> Result<usize, (usize, DeviceError)> {
        let mut received = self.received();
        let taken = received.take(out);
        match pull(self.device(), &mut out[taken..]) {
            Ok(n) => Ok(taken + n),
            Err((n, e)) => Err((taken + n, e)),
        }
    }

    /// Runs `job` on the direction's worker thread, starting it on first
    /// use. A job submitted from the worker itself, for instance by a
    /// completion callback, gets a thread of its own so it cannot queue
    /// behind the job that submitted it.
    pub(crate) fn execute(&self, direction: Direction, job: Job) -> io::Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let index = direction.index();
        let on_worker = workers[index]
            .as_ref()
            .is_some_and(|worker| worker.thread == thread::current().id());
        if on_worker {
            drop(workers);
            let name = format!("comport-{:?}-{}-extra", direction, self.name()).to_lowercase();
            thread::Builder::new().name(name).spawn(job)?;
            return Ok(());
        }
        let job = match workers[index].as_ref() {
            Some(worker) => match worker.jobs.send(job) {
                Ok(()) => return Ok(()),
                Err(SendError(job)) => job,
            },
            None => job,
        };

        let (jobs, queue) = mpsc::channel::<Job>();
        let name = format!("comport-{:?}-{}", direction, self.name()).to_lowercase();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            for job in queue {
                job();
            }
        })?;
        let thread = spawned.thread().id();
        jobs.send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker exited"))?;
        log::debug!("{}: started {:?} worker", self.name(), direction);
        workers[index] = Some(Worker { jobs, thread });
        Ok(())
    }

    fn is_busy(&self, direction: Direction) -> bool {
        self.slots().active[direction.index()].is_some()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the direction for one request. `None` if one is outstanding.
    pub(crate) fn claim(self: &Arc<Self>, direction: Direction) -> Option<InFlight> {
        let mut slots = self.slots();
        let slot = &mut slots.active[direction.index()];
        if slot.is_some() {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        *slot = Some(ticket);
        slots.in_flight += 1;
        Some(InFlight {
            handle: Arc::clone(self),
            direction,
            ticket,
        })
    }

    /// Cancels the request identified by `ticket` if it still owns its
    /// direction. Requests issued later are never hit.
    pub(crate) fn cancel_ticket(&self, direction: Direction, ticket: u64) -> bool {
        let slots = self.slots();
        if slots.active[direction.index()] == Some(ticket) {
            self.device.cancel(direction.scope());
            true
        } else {
            false
        }
    }

    /// Aborts any outstanding read and write.
    pub fn cancel_io(&self) {
        self.device.cancel(CancelScope::Read);
        self.device.cancel(CancelScope::Write);
    }

    /// Waits until no request is in flight. Returns false on timeout.
    pub fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut slots = self.slots();
        while slots.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slots = match self.idle.wait_timeout(slots, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Cancels `scope` until nothing is in flight or `grace` passes. The
    /// cancel is repeated because one issued before a worker reaches the
    /// device does not reach its request.
    pub fn cancel_and_drain(&self, scope: CancelScope, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            self.device.cancel(scope);
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.wait_idle(CANCEL_RETRY.min(deadline - now)) {
                return true;
            }
        }
    }

    /// Cancels everything outstanding and closes the device. Idempotent.
    pub fn release(&self, grace: Duration) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.cancel_and_drain(CancelScope::All, grace) {
            log::warn!(
                "{}: requests still in flight after {:?}, closing anyway",
                self.name(),
                grace
            );
        }
        self.device.close();
        self.received().clear();
        // Workers exit once their queues close.
        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = [None, None, None];
        log::debug!("Released device handle {}", self.name());
    }

    fn finish(&self, direction: Direction, ticket: u64) {
        let mut slots = self.slots();
        let slot = &mut slots.active[direction.index()];
        if *slot == Some(ticket) {
            *slot = None;
        }
        slots.in_flight = slots.in_flight.saturating_sub(1);
        if slots.in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release(DROP_GRACE);
    }
}

/// Reservation of one direction on a handle, released on drop.
pub(crate) struct InFlight {
    handle: Arc<DeviceHandle>,
    direction: Direction,
    ticket: u64,
}

impl InFlight {
    pub fn handle(&self) -> &Arc<DeviceHandle> {
        &self.handle
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.handle.finish(self.direction, self.ticket);
    }
}
