//! Overlapped-style asynchronous I/O.
//!
//! Each read, write or event wait is an operation whose completion record is
//! shared between the submitter and the thread performing the blocking
//! device call. The record and the transfer buffer are reference counted and
//! owned by the operation, so a completion that arrives after the submitter
//! has given up still lands in live memory.
//!
//! Reads complete synchronously when input is already at hand, either in
//! the receive buffer or queued by the device, or when the timeouts say to
//! return immediately. Empty transfers complete synchronously too. Anything
//! else goes to the handle's worker for its direction, which signals the
//! record when the device finishes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::IoError;
use crate::device::handle::{Direction, InFlight, Job};
use crate::device::native::{HardwareEvent, ERROR_GEN_FAILURE};
use crate::device::{DeviceError, DeviceErrorKind, DeviceHandle, IoStatus, SerialDevice};

/// How long a cancelled operation may take to acknowledge it.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

const CANCEL_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Completed,
    Cancelled,
}

pub(crate) trait Outcome: Send + 'static {
    fn aborted(&self) -> bool;
}

pub(crate) struct Transfer {
    status: IoStatus,
    buffer: Vec<u8>,
}

impl Outcome for Transfer {
    fn aborted(&self) -> bool {
        matches!(&self.status.status, Err(e) if e.is_aborted())
    }
}

impl Outcome for Result<HardwareEvent, DeviceError> {
    fn aborted(&self) -> bool {
        matches!(self, Err(e) if e.is_aborted())
    }
}

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct Slot<T> {
    state: CompletionState,
    outcome: Option<T>,
    callback: Option<Callback<T>>,
}

/// Completion record: written once by whoever finishes the device call.
pub(crate) struct Record<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
    notify: Notify,
}

impl<T: Outcome> Record<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                state: CompletionState::Pending,
                outcome: None,
                callback: None,
            }),
            done: Condvar::new(),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, outcome: T) {
        let mut slot = self.lock();
        slot.state = if outcome.aborted() {
            CompletionState::Cancelled
        } else {
            CompletionState::Completed
        };
        let callback = slot.callback.take();
        if callback.is_none() {
            slot.outcome = Some(outcome);
            drop(slot);
            self.done.notify_all();
            self.notify.notify_one();
            return;
        }
        drop(slot);
        self.done.notify_all();
        self.notify.notify_one();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    fn state(&self) -> CompletionState {
        self.lock().state
    }

    /// Blocks until the record completes or `deadline` passes.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut slot = self.lock();
        while slot.state == CompletionState::Pending {
            slot = match deadline {
                None => self.done.wait(slot).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.done.wait_timeout(slot, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
        true
    }

    async fn completed(&self) {
        while self.state() == CompletionState::Pending {
            self.notify.notified().await;
        }
    }

    fn take(&self) -> Option<T> {
        self.lock().outcome.take()
    }

    /// Installs the completion callback. If the record already completed,
    /// the outcome and callback are handed back for the caller to run.
    fn set_callback(&self, callback: Callback<T>) -> Option<(T, Callback<T>)> {
        let mut slot = self.lock();
        match slot.outcome.take() {
            Some(outcome) => Some((outcome, callback)),
            None => {
                slot.callback = Some(callback);
                None
            }
        }
    }
}

/// Turns a raw transfer into the caller-facing result.
#[derive(Clone)]
struct Settle {
    direction: Direction,
    requested: usize,
    immediate: bool,
    timed_out: Arc<AtomicBool>,
}

impl Settle {
    fn settle(&self, transfer: Transfer) -> (Result<usize, IoError>, Vec<u8>) {
        let Transfer { status, mut buffer } = transfer;
        let transferred = status.information;
        if self.direction == Direction::Read {
            buffer.truncate(transferred);
        }
        let result = match status.status {
            Ok(()) => match self.direction {
                Direction::Read if transferred == 0 && self.requested > 0 && !self.immediate => {
                    Err(IoError::TimedOut { transferred })
                }
                Direction::Write if transferred < self.requested => {
                    Err(IoError::TimedOut { transferred })
                }
                _ => Ok(transferred),
            },
            Err(e) if e.is_aborted() && self.timed_out.load(Ordering::Acquire) => {
                Err(IoError::TimedOut { transferred })
            }
            Err(e) if e.is_aborted() => Err(IoError::Cancelled { transferred }),
            Err(e) if e.kind() == DeviceErrorKind::TimedOut => {
                Err(IoError::TimedOut { transferred })
            }
            Err(e) => Err(IoError::from(e)),
        };
        (result, buffer)
    }
}

/// Drives cancellation of one request.
///
/// A cancel issued before the worker reaches the device call is lost, so
/// once requested it is re-issued every `CANCEL_RETRY` until the request
/// completes or `CANCEL_GRACE` runs out. The ticket keeps repeats from
/// touching a later request.
#[derive(Clone)]
struct Canceller {
    handle: Arc<DeviceHandle>,
    direction: Direction,
    ticket: u64,
    deadline: Option<Instant>,
    timed_out: Arc<AtomicBool>,
    requested_at: Arc<Mutex<Option<Instant>>>,
}

impl Canceller {
    fn requested_at(&self) -> Option<Instant> {
        *self
            .requested_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        self.requested_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now);
        self.handle.cancel_ticket(self.direction, self.ticket);
    }

    /// Called each time a wait slice ends without completion. Expires the
    /// deadline or repeats a pending cancel, then returns the end of the next
    /// slice. `None` once the grace period is exhausted.
    fn next(&self) -> Option<Instant> {
        let now = Instant::now();
        match self.requested_at() {
            Some(first) => {
                if now.duration_since(first) >= CANCEL_GRACE {
                    return None;
                }
                self.handle.cancel_ticket(self.direction, self.ticket);
                Some(now + CANCEL_RETRY)
            }
            None => match self.deadline {
                Some(deadline) if now >= deadline => {
                    self.timed_out.store(true, Ordering::Release);
                    self.cancel();
                    Some(now + CANCEL_RETRY)
                }
                Some(deadline) => Some(deadline.min(now + CANCEL_RETRY)),
                None => Some(now + CANCEL_RETRY),
            },
        }
    }

    fn abandoned(&self) {
        log::warn!(
            "{}: {:?} did not acknowledge cancellation within {:?}, abandoning it",
            self.handle.name(),
            self.direction,
            CANCEL_GRACE
        );
    }
}

/// A submitted read or write.
///
/// Exactly one of `end`, `wait` or `on_complete` consumes the result; a
/// second attempt fails with `IoError::AlreadyCompleted`. Dropping a pending
/// operation without consuming it cancels the device request.
pub struct AsyncOperation {
    settle: Settle,
    canceller: Canceller,
    record: Arc<Record<Transfer>>,
    ended: AtomicBool,
    buffer: Mutex<Option<Vec<u8>>>,
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("direction", &self.settle.direction)
            .field("requested", &self.settle.requested)
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncOperation {
    pub fn direction(&self) -> Direction {
        self.settle.direction
    }

    pub fn requested(&self) -> usize {
        self.settle.requested
    }

    pub fn state(&self) -> CompletionState {
        self.record.state()
    }

    pub fn is_complete(&self) -> bool {
        self.state() != CompletionState::Pending
    }

    fn claim_end(&self) -> Result<(), IoError> {
        if self.ended.swap(true, Ordering::AcqRel) {
            Err(IoError::AlreadyCompleted)
        } else {
            Ok(())
        }
    }

    fn abandoned(&self) -> Result<usize, IoError> {
        self.canceller.abandoned();
        Err(IoError::TimedOut { transferred: 0 })
    }

    fn finish(&self) -> Result<usize, IoError> {
        let transfer = self.record.take().ok_or(IoError::AlreadyCompleted)?;
        let (result, buffer) = self.settle.settle(transfer);
        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = Some(buffer);
        result
    }

    /// Blocks until the operation completes or its deadline passes. On
    /// expiry the device request is cancelled and its acknowledgement
    /// awaited before returning `TimedOut` with the bytes moved so far.
    pub fn end(&self) -> Result<usize, IoError> {
        self.claim_end()?;
        while let Some(limit) = self.canceller.next() {
            if self.record.wait_until(Some(limit)) {
                return self.finish();
            }
        }
        self.abandoned()
    }

    /// `end` for async callers: suspends instead of blocking the thread.
    pub async fn wait(&self) -> Result<usize, IoError> {
        self.claim_end()?;
        while let Some(limit) = self.canceller.next() {
            let slice = tokio::time::timeout_at(
                tokio::time::Instant::from_std(limit),
                self.record.completed(),
            );
            if slice.await.is_ok() {
                return self.finish();
            }
        }
        self.abandoned()
    }

    /// Delivers the result to `callback` on the completing thread, or right
    /// away if the operation is already done.
    pub fn on_complete<F>(&self, callback: F) -> Result<(), IoError>
    where
        F: FnOnce(Result<usize, IoError>, Vec<u8>) + Send + 'static,
    {
        self.claim_end()?;
        let settle = self.settle.clone();
        let handler: Callback<Transfer> = Box::new(move |transfer| {
            let (result, buffer) = settle.settle(transfer);
            callback(result, buffer);
        });

        match self.record.set_callback(handler) {
            Some((transfer, handler)) => handler(transfer),
            None => self.spawn_watchdog(),
        }
        Ok(())
    }

    /// Enforces the deadline and repeats cancellation for an operation
    /// nobody is blocked on.
    fn spawn_watchdog(&self) {
        let record = Arc::clone(&self.record);
        let canceller = self.canceller.clone();
        let spawned = thread::Builder::new()
            .name("comport-watchdog".into())
            .spawn(move || {
                while let Some(limit) = canceller.next() {
                    if record.wait_until(Some(limit)) {
                        return;
                    }
                }
                canceller.abandoned();
            });
        if let Err(e) = spawned {
            log::error!("Failed to start operation watchdog: {}", e);
        }
    }

    /// Cancels the device request. The operation then completes with
    /// `Cancelled` and the bytes moved so far.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// The operation's buffer once its result has been consumed: received
    /// bytes for reads, the submitted data for writes.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for AsyncOperation {
    fn drop(&mut self) {
        if !self.ended.load(Ordering::Acquire) && self.state() == CompletionState::Pending {
            log::debug!(
                "{}: dropping pending {:?}, cancelling it",
                self.canceller.handle.name(),
                self.settle.direction
            );
            self.canceller.cancel();
            self.spawn_watchdog();
        }
    }
}

fn trace_transfer(name: &str, direction: Direction, buffer: &[u8], moved: usize) {
    if log::log_enabled!(log::Level::Trace) {
        let moved = moved.min(buffer.len());
        log::trace!("{} {:?} {}", name, direction, hex::encode(&buffer[..moved]));
    }
}

fn run(device: &dyn SerialDevice, direction: Direction, mut buffer: Vec<u8>) -> Transfer {
    let status = match direction {
        Direction::Read => device.read(&mut buffer),
        _ => device.write(&buffer),
    };
    trace_transfer(device.name(), direction, &buffer, status.information);
    Transfer { status, buffer }
}

/// Serves a read from the receive buffer, then from what the device has
/// queued, without blocking.
fn read_available(handle: &DeviceHandle, mut buffer: Vec<u8>) -> Transfer {
    let status = match handle.take_available(&mut buffer) {
        Ok(n) => IoStatus::ok(n),
        Err((n, e)) => IoStatus::failed(n, e),
    };
    trace_transfer(handle.name(), Direction::Read, &buffer, status.information);
    Transfer { status, buffer }
}

fn begin(
    handle: &Arc<DeviceHandle>,
    direction: Direction,
    buffer: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<AsyncOperation, IoError> {
    handle.ensure_live()?;
    let _submit = handle.submit();
    let guard = handle.claim(direction).ok_or(IoError::OperationInProgress)?;
    let device = handle.device();

    let requested = buffer.len();
    let immediate = device.get_timeouts()?.returns_immediately();
    let synchronous = match direction {
        // Bytes already in the receive buffer complete the read on their own.
        Direction::Read => {
            let buffered = handle.received().len();
            requested == 0
                || buffered > 0
                || immediate
                || device.comm_status()?.in_queue as usize >= requested
        }
        _ => requested == 0,
    };

    let record = Record::new();
    let timed_out = Arc::new(AtomicBool::new(false));
    let operation = AsyncOperation {
        settle: Settle {
            direction,
            requested,
            immediate,
            timed_out: Arc::clone(&timed_out),
        },
        canceller: Canceller {
            handle: Arc::clone(handle),
            direction,
            ticket: guard.ticket(),
            deadline: timeout.map(|t| Instant::now() + t),
            timed_out,
            requested_at: Arc::new(Mutex::new(None)),
        },
        record: Arc::clone(&record),
        ended: AtomicBool::new(false),
        buffer: Mutex::new(None),
    };

    if synchronous {
        let transfer = match direction {
            Direction::Read => read_available(handle, buffer),
            _ => run(device, direction, buffer),
        };
        drop(guard);
        record.complete(transfer);
    } else {
        spawn_transfer(guard, record, buffer);
    }
    Ok(operation)
}

fn worker_failed(e: std::io::Error) -> DeviceError {
    DeviceError::new(ERROR_GEN_FAILURE, format!("failed to start worker: {}", e))
}

fn spawn_transfer(guard: InFlight, record: Arc<Record<Transfer>>, buffer: Vec<u8>) {
    let direction = guard.direction();
    let handle = Arc::clone(guard.handle());
    let worker_record = Arc::clone(&record);
    let job: Job = Box::new(move || {
        let transfer = run(guard.handle().device(), direction, buffer);
        drop(guard);
        worker_record.complete(transfer);
    });
    if let Err(e) = handle.execute(direction, job) {
        record.complete(Transfer {
            status: IoStatus::failed(0, worker_failed(e)),
            buffer: Vec::new(),
        });
    }
}

/// Starts a read of up to `len` bytes.
pub fn begin_read(
    handle: &Arc<DeviceHandle>,
    len: usize,
    timeout: Option<Duration>,
) -> Result<AsyncOperation, IoError> {
    begin(handle, Direction::Read, vec![0; len], timeout)
}

/// Starts a write of `data`, which the operation owns until it completes.
pub fn begin_write(
    handle: &Arc<DeviceHandle>,
    data: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<AsyncOperation, IoError> {
    begin(handle, Direction::Write, data, timeout)
}

/// Blocking read into `buf`. On a timeout after partial data the bytes are
/// still copied into `buf` and their count is carried by the error.
pub fn read(
    handle: &Arc<DeviceHandle>,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize, IoError> {
    let operation = begin_read(handle, buf.len(), timeout)?;
    let result = operation.end();
    if let Some(data) = operation.take_buffer() {
        buf[..data.len()].copy_from_slice(&data);
    }
    result
}

pub fn write(
    handle: &Arc<DeviceHandle>,
    data: &[u8],
    timeout: Option<Duration>,
) -> Result<usize, IoError> {
    begin_write(handle, data.to_vec(), timeout)?.end()
}

/// A pending wait on the device event mask.
pub(crate) struct EventWait {
    record: Arc<Record<Result<HardwareEvent, DeviceError>>>,
}

impl EventWait {
    /// Blocks until an event arrives or the wait is cancelled.
    pub fn end(self) -> Result<HardwareEvent, DeviceError> {
        self.record.wait_until(None);
        self.record
            .take()
            .unwrap_or_else(|| Err(DeviceError::aborted("event wait result already taken")))
    }
}

pub(crate) fn begin_wait(handle: &Arc<DeviceHandle>) -> Result<EventWait, DeviceError> {
    handle.ensure_live()?;
    let guard = {
        let _submit = handle.submit();
        handle.claim(Direction::Wait).ok_or_else(|| {
            DeviceError::new(ERROR_GEN_FAILURE, "an event wait is already outstanding")
        })?
    };
    let record = Record::new();
    let worker_record = Arc::clone(&record);
    let job: Job = Box::new(move || {
        let outcome = guard.handle().device().wait_event();
        drop(guard);
        worker_record.complete(outcome);
    });
    handle
        .execute(Direction::Wait, job)
        .map_err(worker_failed)?;
    Ok(EventWait { record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{apply_timeouts, TimeoutSettings};
    use crate::device::{Backend, VirtualBus};
    use std::sync::mpsc;

    fn open_pair() -> (VirtualBus, Arc<DeviceHandle>, Arc<DeviceHandle>) {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        let a = Arc::new(DeviceHandle::new(bus.open("COM1").unwrap()));
        let b = Arc::new(DeviceHandle::new(bus.open("COM2").unwrap()));
        (bus, a, b)
    }

    #[test]
    fn test_buffered_read_completes_synchronously() {
        let (_bus, a, b) = open_pair();
        assert_eq!(write(&a, b"abc", Some(Duration::from_secs(1))), Ok(3));
        let op = begin_read(&b, 3, Some(Duration::from_secs(1))).unwrap();
        assert!(op.is_complete());
        assert_eq!(op.end(), Ok(3));
        assert_eq!(op.take_buffer().unwrap(), b"abc");
    }

    #[test]
    fn test_second_end_is_rejected() {
        let (_bus, a, b) = open_pair();
        write(&a, b"x", None).unwrap();
        let op = begin_read(&b, 1, None).unwrap();
        assert_eq!(op.end(), Ok(1));
        assert_eq!(op.end(), Err(IoError::AlreadyCompleted));
        assert_eq!(
            op.on_complete(|_, _| {}),
            Err(IoError::AlreadyCompleted)
        );
    }

    #[test]
    fn test_read_deadline_reports_timeout() {
        let (_bus, _a, b) = open_pair();
        let started = Instant::now();
        let mut buf = [0u8; 8];
        let result = read(&b, &mut buf, Some(Duration::from_millis(50)));
        assert_eq!(result, Err(IoError::TimedOut { transferred: 0 }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_immediate_read_of_nothing_succeeds() {
        let (_bus, _a, b) = open_pair();
        apply_timeouts(&b, &TimeoutSettings::return_immediately()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read(&b, &mut buf, Some(Duration::from_millis(50))), Ok(0));
    }

    #[test]
    fn test_concurrent_read_is_rejected() {
        let (_bus, _a, b) = open_pair();
        let first = begin_read(&b, 4, None).unwrap();
        assert!(!first.is_complete());
        let second = begin_read(&b, 4, None);
        assert_eq!(second.err(), Some(IoError::OperationInProgress));
        first.cancel();
        assert_eq!(first.end(), Err(IoError::Cancelled { transferred: 0 }));
    }

    #[test]
    fn test_callback_receives_data() {
        let (_bus, a, b) = open_pair();
        let op = begin_read(&b, 5, Some(Duration::from_secs(2))).unwrap();
        let (tx, rx) = mpsc::channel();
        op.on_complete(move |result, data| {
            let _ = tx.send((result, data));
        })
        .unwrap();
        write(&a, b"hello", None).unwrap();
        let (result, data) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result, Ok(5));
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_callback_deadline_cancels() {
        let (_bus, _a, b) = open_pair();
        let op = begin_read(&b, 5, Some(Duration::from_millis(30))).unwrap();
        let (tx, rx) = mpsc::channel();
        op.on_complete(move |result, _| {
            let _ = tx.send(result);
        })
        .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result, Err(IoError::TimedOut { transferred: 0 }));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let (_bus, a, b) = open_pair();
        let op = begin_read(&b, 2, Some(Duration::from_secs(2))).unwrap();
        let writer = tokio::task::spawn_blocking(move || write(&a, b"ok", None));
        assert_eq!(op.wait().await, Ok(2));
        assert_eq!(op.take_buffer().unwrap(), b"ok");
        assert_eq!(writer.await.unwrap(), Ok(2));
    }

    #[test]
    fn test_buffered_bytes_precede_queued_bytes() {
        let (_bus, a, b) = open_pair();
        write(&a, b"abc", None).unwrap();
        assert_eq!(b.drain_input().unwrap(), 3);
        assert_eq!(b.device().comm_status().unwrap().in_queue, 0);
        write(&a, b"def", None).unwrap();
        assert_eq!(b.bytes_available().unwrap(), 6);

        let mut buf = [0u8; 6];
        assert_eq!(read(&b, &mut buf, Some(Duration::from_secs(1))), Ok(6));
        assert_eq!(&buf, b"abcdef");
        assert_eq!(b.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_drain_leaves_bytes_for_pending_read() {
        let (_bus, a, b) = open_pair();
        let op = begin_read(&b, 4, Some(Duration::from_secs(2))).unwrap();
        assert!(!op.is_complete());
        write(&a, b"wxyz", None).unwrap();
        assert_eq!(op.end(), Ok(4));
        assert_eq!(op.take_buffer().unwrap(), b"wxyz");
        assert_eq!(b.drain_input().unwrap(), 0);
    }

    #[test]
    fn test_pending_requests_share_one_worker() {
        let (_bus, a, b) = open_pair();
        let mut threads = Vec::new();
        for payload in [&b"one"[..], b"two", b"six"] {
            let op = begin_read(&b, 3, Some(Duration::from_secs(2))).unwrap();
            assert!(!op.is_complete());
            let (tx, rx) = mpsc::channel();
            op.on_complete(move |result, data| {
                let _ = tx.send((result, data, thread::current().id()));
            })
            .unwrap();
            write(&a, payload, None).unwrap();
            let (result, data, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(result, Ok(3));
            assert_eq!(data, payload);
            threads.push(thread);
        }
        assert!(threads.iter().all(|t| *t == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn test_release_cancels_pending_wait() {
        let (_bus, a, _b) = open_pair();
        a.device().set_event_mask(HardwareEvent::all()).unwrap();
        let wait = begin_wait(&a).unwrap();
        a.release(Duration::from_secs(1));
        assert!(wait.end().is_err());
    }
}
