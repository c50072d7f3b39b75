use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::broadcast;

use super::control::{PinController, StatusReporter};
use super::discovery::list_ports;
use super::dispatch::{Dispatcher, EventHandler, Subscribers, SubscriptionId};
use super::monitor::{EventMonitor, FaultLatch, LoopState, MonitorContext};
use super::overlapped::{self, AsyncOperation};
use super::types::{Counters, EventKind, Notification, PortState, PortStatistics, QueueStatus};
use super::{ConfigError, IoError, OpenError};
use crate::config::{
    apply_configuration, apply_timeouts, read_configuration, LineConfiguration, PortSettings,
    TimeoutSettings,
};
use crate::device::native::{LineErrorSet, PinState, PurgeFlags, ERROR_GEN_FAILURE};
use crate::device::{
    Backend, CancelScope, DeviceError, DeviceHandle, NativeBackend, SerialDevice,
    SerialDeviceInfo,
};

/// Pushes line and timeout changes made while `open` was running to the new
/// session. A change the device rejects is dropped, so the stored settings
/// keep describing the device.
fn reconcile(
    current: &mut PortSettings,
    opened_with: &PortSettings,
    handle: &Arc<DeviceHandle>,
    port_name: &str,
) {
    if current.line != opened_with.line {
        if let Err(e) = apply_configuration(handle, &current.line) {
            log::warn!("{}: configuration changed during open was rejected: {}", port_name, e);
            current.line = opened_with.line.clone();
        }
    }
    if current.timeouts != opened_with.timeouts {
        if let Err(e) = apply_timeouts(handle, &current.timeouts) {
            log::warn!("{}: timeouts changed during open were rejected: {}", port_name, e);
            current.timeouts = opened_with.timeouts;
        }
    }
}

/// Everything that exists only while the port is open. Torn down in a fixed
/// order: event loop, outstanding I/O, device, dispatcher.
struct Session {
    handle: Arc<DeviceHandle>,
    reporter: Arc<StatusReporter>,
    monitor: EventMonitor,
    dispatcher: Dispatcher,
    fault: FaultLatch,
    break_active: bool,
}

impl Session {
    fn shutdown(self, timeout: Duration) {
        let Session {
            handle,
            reporter,
            monitor,
            dispatcher,
            ..
        } = self;

        monitor.stop(timeout);
        if !handle.cancel_and_drain(CancelScope::All, timeout) {
            log::warn!("{}: I/O still outstanding after {:?}", handle.name(), timeout);
        }
        handle.release(timeout);
        // Last notification sender; the dispatcher drains and exits.
        drop(reporter);
        dispatcher.finish(timeout);
    }
}

struct Inner {
    state: PortState,
    port_name: Option<String>,
    settings: PortSettings,
    session: Option<Session>,
}

/// Handles to an open session, cloned out so no lock is held during I/O.
struct Live {
    handle: Arc<DeviceHandle>,
    reporter: Arc<StatusReporter>,
}

/// A serial port: lifecycle, configuration, I/O and event subscription.
///
/// Settings may be changed while closed and take effect on the next `open`;
/// while open they are pushed to the device immediately. Subscriptions
/// survive close and reopen.
pub struct SerialPort {
    backend: Arc<dyn Backend>,
    inner: Mutex<Inner>,
    subscribers: Arc<Subscribers>,
    counters: Arc<Counters>,
}

impl Default for SerialPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(NativeBackend))
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self::with_settings(backend, PortSettings::default())
    }

    pub fn with_settings(backend: Arc<dyn Backend>, settings: PortSettings) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner {
                state: PortState::Closed,
                port_name: None,
                settings,
                session: None,
            }),
            subscribers: Arc::new(Subscribers::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PortState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == PortState::Open
    }

    pub fn port_name(&self) -> Option<String> {
        self.lock().port_name.clone()
    }

    pub fn settings(&self) -> PortSettings {
        self.lock().settings.clone()
    }

    pub fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>, DeviceError> {
        list_ports(self.backend.as_ref())
    }

    pub fn open(&self, port_name: &str) -> Result<(), OpenError> {
        let settings = {
            let mut inner = self.lock();
            if inner.state != PortState::Closed {
                return Err(OpenError::AlreadyOpen);
            }
            inner.settings.validate()?;
            inner.state = PortState::Opening;
            inner.settings.clone()
        };

        log::info!("Opening serial port {}", port_name);
        let established = self.establish(port_name, &settings);

        let mut inner = self.lock();
        match established {
            Ok(session) => {
                reconcile(&mut inner.settings, &settings, &session.handle, port_name);
                inner.state = PortState::Open;
                inner.port_name = Some(port_name.to_string());
                inner.session = Some(session);
                log::info!(
                    "Opened {} at {} baud",
                    port_name,
                    inner.settings.line.baud_rate
                );
                Ok(())
            }
            Err(e) => {
                inner.state = PortState::Closed;
                log::error!("Failed to open {}: {}", port_name, e);
                Err(e)
            }
        }
    }

    fn open_device(
        &self,
        port_name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn SerialDevice>, OpenError> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        let backend = Arc::clone(&self.backend);
        let name = port_name.to_string();
        thread::Builder::new()
            .name(format!("comport-open-{}", port_name).to_lowercase())
            .spawn(move || {
                // A late result is dropped here, closing the device again.
                let _ = tx.send(backend.open(&name));
            })
            .map_err(|e| {
                OpenError::Device(DeviceError::new(
                    ERROR_GEN_FAILURE,
                    format!("failed to start opener: {}", e),
                ))
            })?;

        match rx.recv_timeout(timeout) {
            Ok(opened) => Ok(opened?),
            Err(_) => Err(OpenError::TimedOut(port_name.to_string())),
        }
    }

    fn establish(&self, port_name: &str, settings: &PortSettings) -> Result<Session, OpenError> {
        let device = self.open_device(port_name, settings.open_timeout())?;
        let handle = Arc::new(DeviceHandle::new(device));
        let started = self.start_session(&handle, port_name, settings);
        if started.is_err() {
            handle.release(settings.close_timeout());
        }
        started
    }

    fn start_session(
        &self,
        handle: &Arc<DeviceHandle>,
        port_name: &str,
        settings: &PortSettings,
    ) -> Result<Session, OpenError> {
        let device = handle.device();
        device.setup_queues(settings.rx_queue_size, settings.tx_queue_size)?;
        handle
            .received()
            .set_capacity(settings.rx_queue_size as usize);
        apply_configuration(handle, &settings.line)?;
        apply_timeouts(handle, &settings.timeouts)?;
        device.purge(PurgeFlags::RX_CLEAR | PurgeFlags::TX_CLEAR)?;
        // Stale errors from before we owned the port.
        device.clear_error()?;

        let (notifications, dispatcher) = Dispatcher::start(
            port_name,
            Arc::clone(&self.subscribers),
            Arc::clone(&self.counters),
        )
        .map_err(|e| {
            OpenError::Device(DeviceError::new(
                ERROR_GEN_FAILURE,
                format!("failed to start dispatcher: {}", e),
            ))
        })?;
        let reporter = Arc::new(StatusReporter::new(
            Arc::clone(handle),
            notifications.clone(),
        ));
        let fault = FaultLatch::default();
        let monitor = EventMonitor::start(MonitorContext {
            handle: Arc::clone(handle),
            reporter: Arc::clone(&reporter),
            notifications,
            counters: Arc::clone(&self.counters),
            fault: Arc::clone(&fault),
            received_bytes_threshold: settings.received_bytes_threshold,
        })?;

        Ok(Session {
            handle: Arc::clone(handle),
            reporter,
            monitor,
            dispatcher,
            fault,
            break_active: false,
        })
    }

    /// Stops the event loop, cancels outstanding I/O and releases the
    /// device. Safe to call at any time, any number of times.
    pub fn close(&self) {
        let (session, timeout, name) = {
            let mut inner = self.lock();
            if inner.state != PortState::Open {
                return;
            }
            inner.state = PortState::Closing;
            (
                inner.session.take(),
                inner.settings.close_timeout(),
                inner.port_name.clone().unwrap_or_default(),
            )
        };

        log::info!("Closing serial port {}", name);
        if let Some(session) = session {
            session.shutdown(timeout);
        }
        self.lock().state = PortState::Closed;
        log::info!("Closed serial port {}", name);
    }

    fn live(&self) -> Result<Live, IoError> {
        let inner = self.lock();
        let session = match (&inner.state, &inner.session) {
            (PortState::Open, Some(session)) => session,
            _ => return Err(IoError::NotOpen),
        };
        if let Some(fault) = session
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(IoError::DeviceFault(fault));
        }
        Ok(Live {
            handle: Arc::clone(&session.handle),
            reporter: Arc::clone(&session.reporter),
        })
    }

    fn count(&self, read: bool, result: &Result<usize, IoError>) {
        let moved = match result {
            Ok(n) => *n,
            Err(e) => e.transferred(),
        };
        let counter = if read {
            &self.counters.bytes_read
        } else {
            &self.counters.bytes_written
        };
        Counters::add(counter, moved as u64);
    }

    /// Reads up to `buf.len()` bytes. Zero bytes before `timeout` is
    /// `TimedOut`, unless the timeouts say to return immediately.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, IoError> {
        let live = self.live()?;
        let result = overlapped::read(&live.handle, buf, Some(timeout));
        self.count(true, &result);
        result
    }

    /// Writes all of `data`; a short write is `TimedOut` with the count.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, IoError> {
        let live = self.live()?;
        let result = overlapped::write(&live.handle, data, Some(timeout));
        self.count(false, &result);
        result
    }

    pub async fn read_async(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, IoError> {
        let live = self.live()?;
        let operation = overlapped::begin_read(&live.handle, buf.len(), Some(timeout))?;
        let result = operation.wait().await;
        if let Some(data) = operation.take_buffer() {
            buf[..data.len()].copy_from_slice(&data);
        }
        self.count(true, &result);
        result
    }

    pub async fn write_async(&self, data: &[u8], timeout: Duration) -> Result<usize, IoError> {
        let live = self.live()?;
        let operation = overlapped::begin_write(&live.handle, data.to_vec(), Some(timeout))?;
        let result = operation.wait().await;
        self.count(false, &result);
        result
    }

    pub fn begin_read(
        &self,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<AsyncOperation, IoError> {
        let live = self.live()?;
        overlapped::begin_read(&live.handle, len, timeout)
    }

    pub fn begin_write(
        &self,
        data: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<AsyncOperation, IoError> {
        let live = self.live()?;
        overlapped::begin_write(&live.handle, data, timeout)
    }

    /// Aborts the outstanding read and write, which complete as `Cancelled`.
    pub fn cancel_io(&self) -> Result<(), IoError> {
        self.live()?.handle.cancel_io();
        Ok(())
    }

    pub fn configuration(&self) -> LineConfiguration {
        self.lock().settings.line.clone()
    }

    /// The configuration as currently programmed into the device.
    pub fn applied_configuration(&self) -> Result<LineConfiguration, ConfigError> {
        let live = self.live().map_err(|_| ConfigError::NotOpen)?;
        Ok(read_configuration(&live.handle)?)
    }

    /// Applies `config` to the open device, or stores it for the next open.
    /// On failure neither the device nor the stored settings change.
    pub fn set_configuration(&self, config: LineConfiguration) -> Result<(), ConfigError> {
        config.validate()?;
        let mut inner = self.lock();
        if let Some(session) = &inner.session {
            apply_configuration(&session.handle, &config)?;
        }
        inner.settings.line = config;
        Ok(())
    }

    pub fn timeouts(&self) -> TimeoutSettings {
        self.lock().settings.timeouts
    }

    pub fn set_timeouts(&self, timeouts: TimeoutSettings) -> Result<(), ConfigError> {
        self.update_timeouts(|current| *current = timeouts)
    }

    /// Read-modify-write of the whole timeout record.
    pub fn update_timeouts<F>(&self, update: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut TimeoutSettings),
    {
        let mut inner = self.lock();
        let mut timeouts = inner.settings.timeouts;
        update(&mut timeouts);
        if let Some(session) = &inner.session {
            apply_timeouts(&session.handle, &timeouts)?;
        }
        inner.settings.timeouts = timeouts;
        Ok(())
    }

    /// Replaces all settings. Line and timeouts apply immediately when open;
    /// queue sizes and the received-bytes threshold wait for the next open.
    pub fn set_settings(&self, settings: PortSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        let mut inner = self.lock();
        if let Some(session) = &inner.session {
            apply_configuration(&session.handle, &settings.line)?;
            apply_timeouts(&session.handle, &settings.timeouts)?;
        }
        inner.settings = settings;
        Ok(())
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.subscribers.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Every notification, in dispatch order. Receivers that fall behind
    /// observe `RecvError::Lagged`.
    pub fn event_stream(&self) -> broadcast::Receiver<Notification> {
        self.subscribers.stream()
    }

    pub fn set_dtr(&self, asserted: bool) -> Result<(), IoError> {
        PinController::new(&self.live()?.handle).set_dtr(asserted)
    }

    pub fn set_rts(&self, asserted: bool) -> Result<(), IoError> {
        PinController::new(&self.live()?.handle).set_rts(asserted)
    }

    pub fn set_break(&self, active: bool) -> Result<(), IoError> {
        PinController::new(&self.live()?.handle).set_break(active)?;
        if let Some(session) = self.lock().session.as_mut() {
            session.break_active = active;
        }
        Ok(())
    }

    pub fn break_state(&self) -> Result<bool, IoError> {
        self.live()?;
        Ok(self
            .lock()
            .session
            .as_ref()
            .map(|s| s.break_active)
            .unwrap_or(false))
    }

    pub fn send_xon(&self) -> Result<(), IoError> {
        PinController::new(&self.live()?.handle).send_xon()
    }

    pub fn send_xoff(&self) -> Result<(), IoError> {
        PinController::new(&self.live()?.handle).send_xoff()
    }

    /// Current CTS, DSR, RLSD and ring state, read from the device.
    pub fn pins(&self) -> Result<PinState, IoError> {
        PinController::new(&self.live()?.handle).pins()
    }

    /// Returns and clears the device error latch. Errors found here are
    /// also delivered to ErrorReceived subscribers.
    pub fn clear_and_snapshot(&self) -> Result<(LineErrorSet, QueueStatus), IoError> {
        Ok(self.live()?.reporter.clear_and_snapshot()?)
    }

    pub fn bytes_to_read(&self) -> Result<usize, IoError> {
        Ok(self.live()?.reporter.queue_status()?.in_queue as usize)
    }

    pub fn bytes_to_write(&self) -> Result<usize, IoError> {
        Ok(self.live()?.reporter.queue_status()?.out_queue as usize)
    }

    pub fn discard_in_buffer(&self) -> Result<(), IoError> {
        self.purge(PurgeFlags::RX_CLEAR)
    }

    pub fn discard_out_buffer(&self) -> Result<(), IoError> {
        self.purge(PurgeFlags::TX_CLEAR)
    }

    fn purge(&self, flags: PurgeFlags) -> Result<(), IoError> {
        let live = self.live()?;
        let _submit = live.handle.submit();
        if flags.contains(PurgeFlags::RX_CLEAR) {
            live.handle.received().clear();
        }
        live.handle.device().purge(flags)?;
        log::debug!("{}: purged {:?}", live.handle.name(), flags);
        Ok(())
    }

    pub fn statistics(&self) -> PortStatistics {
        self.counters.snapshot()
    }

    pub fn event_loop_state(&self) -> Option<LoopState> {
        self.lock().session.as_ref().map(|s| s.monitor.state())
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualBus;

    fn bus_port() -> (VirtualBus, SerialPort) {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        let port = SerialPort::with_backend(Arc::new(bus.clone()));
        (bus, port)
    }

    #[test]
    fn test_lifecycle_states() {
        let (_bus, port) = bus_port();
        assert_eq!(port.state(), PortState::Closed);
        port.open("COM1").unwrap();
        assert_eq!(port.state(), PortState::Open);
        assert_eq!(port.port_name().as_deref(), Some("COM1"));
        assert_eq!(port.open("COM1"), Err(OpenError::AlreadyOpen));
        port.close();
        assert_eq!(port.state(), PortState::Closed);
        port.close();
        assert_eq!(port.event_loop_state(), None);
    }

    #[test]
    fn test_reopen_after_close() {
        let (_bus, port) = bus_port();
        port.open("COM1").unwrap();
        port.close();
        port.open("COM1").unwrap();
        assert!(port.event_loop_state().is_some());
    }

    #[test]
    fn test_closed_settings_are_buffered() {
        let (bus, port) = bus_port();
        port.set_configuration(LineConfiguration::new(57_600)).unwrap();
        port.open("COM1").unwrap();
        assert_eq!(bus.line("COM1").unwrap().dcb().baud_rate, 57_600);
        assert_eq!(port.applied_configuration().unwrap().baud_rate, 57_600);
    }

    #[test]
    fn test_failed_open_returns_to_closed() {
        let (_bus, port) = bus_port();
        assert!(matches!(port.open("COM7"), Err(OpenError::NotFound(_))));
        assert_eq!(port.state(), PortState::Closed);
        port.open("COM1").unwrap();
    }

    #[test]
    fn test_operations_need_open_port() {
        let (_bus, port) = bus_port();
        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf, Duration::from_millis(10)), Err(IoError::NotOpen));
        assert_eq!(port.pins(), Err(IoError::NotOpen));
        assert_eq!(port.cancel_io(), Err(IoError::NotOpen));
        assert!(matches!(port.applied_configuration(), Err(ConfigError::NotOpen)));
    }
}
