//! Platform serial devices through the `serialport` crate.
//!
//! `serialport` exposes synchronous handles with a per-handle timeout, so
//! blocking requests run as short timed slices that check for cancellation
//! in between. Event waits are emulated by polling queue depths and the modem
//! lines on the same cadence. Devices without modem lines, pseudo terminals
//! among them, report every line deasserted.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPortType, StopBits};

use super::native::*;
use super::{
    Backend, CancelScope, DeviceError, DeviceErrorKind, Generations, IoStatus, PortKind,
    SerialDevice, SerialDeviceInfo,
};

const POLL_SLICE: Duration = Duration::from_millis(10);
const OPEN_BAUD: u32 = 9600;

type Port = Box<dyn serialport::SerialPort>;

/// Devices provided by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl Backend for NativeBackend {
    fn open(&self, name: &str) -> Result<Box<dyn SerialDevice>, DeviceError> {
        check_device_node(name)?;
        let port = serialport::new(name, OPEN_BAUD)
            .timeout(POLL_SLICE)
            .open()
            .map_err(|e| open_error(name, e))?;
        log::info!("Opened serial device {}", name);
        Ok(Box::new(NativePort::new(name, port)?))
    }

    fn enumerate(&self) -> Result<Vec<SerialDeviceInfo>, DeviceError> {
        let ports = serialport::available_ports()
            .map_err(|e| port_error("available ports", "enumerate", e))?;
        Ok(ports.into_iter().map(describe).collect())
    }
}

fn describe(info: serialport::SerialPortInfo) -> SerialDeviceInfo {
    let port_name = info.port_name;
    match info.port_type {
        SerialPortType::UsbPort(usb) => SerialDeviceInfo {
            id: format!(
                "USB\\VID_{:04X}&PID_{:04X}\\{}",
                usb.vid,
                usb.pid,
                usb.serial_number.as_deref().unwrap_or(&port_name)
            ),
            port_name,
            kind: PortKind::Usb,
            vid: Some(usb.vid),
            pid: Some(usb.pid),
            serial_number: usb.serial_number,
            manufacturer: usb.manufacturer,
            product: usb.product,
        },
        other => {
            let (kind, prefix) = match other {
                SerialPortType::PciPort => (PortKind::Pci, "PCI"),
                SerialPortType::BluetoothPort => (PortKind::Bluetooth, "BTHENUM"),
                _ => (PortKind::Unknown, "SERIAL"),
            };
            SerialDeviceInfo {
                id: format!("{}\\{}", prefix, port_name),
                port_name,
                kind,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            }
        }
    }
}

#[cfg(unix)]
fn check_device_node(name: &str) -> Result<(), DeviceError> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(name) {
        Ok(meta) if meta.file_type().is_char_device() => Ok(()),
        Ok(_) => Err(DeviceError::new(
            ERROR_BAD_DEV_TYPE,
            format!("{} is not a character device", name),
        )),
        Err(e) => Err(DeviceError::new(io_code(&e), format!("{}: {}", name, e))),
    }
}

#[cfg(not(unix))]
fn check_device_node(_name: &str) -> Result<(), DeviceError> {
    Ok(())
}

fn io_code(e: &io::Error) -> u32 {
    #[cfg(unix)]
    {
        // ENXIO, ENODEV and EIO show up once a USB adapter is pulled.
        if matches!(e.raw_os_error(), Some(5) | Some(6) | Some(19)) {
            return ERROR_DEVICE_REMOVED;
        }
    }
    match e.kind() {
        io::ErrorKind::NotFound => ERROR_FILE_NOT_FOUND,
        io::ErrorKind::PermissionDenied => ERROR_ACCESS_DENIED,
        io::ErrorKind::InvalidInput => ERROR_INVALID_PARAMETER,
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => ERROR_DEVICE_REMOVED,
        _ => ERROR_GEN_FAILURE,
    }
}

fn open_error(name: &str, e: serialport::Error) -> DeviceError {
    let code = match e.kind() {
        serialport::ErrorKind::NoDevice => ERROR_FILE_NOT_FOUND,
        serialport::ErrorKind::InvalidInput => ERROR_INVALID_PARAMETER,
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => ERROR_FILE_NOT_FOUND,
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => ERROR_ACCESS_DENIED,
        _ if e.description.to_lowercase().contains("busy") => ERROR_ACCESS_DENIED,
        _ => ERROR_GEN_FAILURE,
    };
    DeviceError::new(code, format!("{}: {}", name, e))
}

fn port_error(name: &str, what: &str, e: serialport::Error) -> DeviceError {
    let code = match e.kind() {
        serialport::ErrorKind::NoDevice => ERROR_DEVICE_REMOVED,
        serialport::ErrorKind::InvalidInput => ERROR_INVALID_PARAMETER,
        serialport::ErrorKind::Io(kind) => io_code(&io::Error::from(kind)),
        _ => ERROR_GEN_FAILURE,
    };
    DeviceError::new(code, format!("{}: {} failed: {}", name, what, e))
}

fn io_failure(name: &str, what: &str, e: io::Error) -> DeviceError {
    DeviceError::new(io_code(&e), format!("{}: {} failed: {}", name, what, e))
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Sorts a failed modem-line ioctl: removal propagates, anything else means
/// the device has no modem lines.
fn unsupported_lines(name: &str, e: serialport::Error) -> Result<(), DeviceError> {
    let error = port_error(name, "modem line access", e);
    if error.kind() == DeviceErrorKind::Removed {
        return Err(error);
    }
    log::debug!("{}: no modem lines, reporting them deasserted ({})", name, error);
    Ok(())
}

fn not_supported(what: &str) -> DeviceError {
    DeviceError::new(ERROR_NOT_SUPPORTED, format!("{} is not supported by this driver", what))
}

/// Settings `serialport` can express for a DCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DriverSettings {
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    flow_control: FlowControl,
}

fn port_settings(dcb: &Dcb) -> Result<DriverSettings, DeviceError> {
    let data_bits = match dcb.byte_size {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        _ => return Err(DeviceError::new(ERROR_INVALID_PARAMETER, "byte size out of range")),
    };
    let parity = match dcb.parity {
        NOPARITY => Parity::None,
        ODDPARITY => Parity::Odd,
        EVENPARITY => Parity::Even,
        MARKPARITY | SPACEPARITY => return Err(not_supported("mark/space parity")),
        _ => return Err(DeviceError::new(ERROR_INVALID_PARAMETER, "unknown parity")),
    };
    let stop_bits = match dcb.stop_bits {
        ONESTOPBIT => StopBits::One,
        TWOSTOPBITS => StopBits::Two,
        ONE5STOPBITS => return Err(not_supported("1.5 stop bits")),
        _ => return Err(DeviceError::new(ERROR_INVALID_PARAMETER, "unknown stop bits")),
    };
    if dcb.has(DCB_F_OUTX_DSR_FLOW) || dcb.dtr_control() == DTR_CONTROL_HANDSHAKE {
        return Err(not_supported("DSR/DTR flow control"));
    }
    if dcb.rts_control() == RTS_CONTROL_TOGGLE {
        return Err(not_supported("RTS toggle"));
    }
    let hardware = dcb.has(DCB_F_OUTX_CTS_FLOW) || dcb.rts_control() == RTS_CONTROL_HANDSHAKE;
    let software = dcb.has(DCB_F_OUTX) || dcb.has(DCB_F_INX);
    let flow_control = match (hardware, software) {
        (true, true) => {
            log::warn!("RTS/CTS and XON/XOFF requested together, using RTS/CTS only");
            FlowControl::Hardware
        }
        (true, false) => FlowControl::Hardware,
        (false, true) => FlowControl::Software,
        (false, false) => FlowControl::None,
    };
    Ok(DriverSettings {
        data_bits,
        parity,
        stop_bits,
        flow_control,
    })
}

fn initial_dcb(port: &Port) -> Dcb {
    let byte_size = match port.data_bits() {
        Ok(DataBits::Five) => 5,
        Ok(DataBits::Six) => 6,
        Ok(DataBits::Seven) => 7,
        _ => 8,
    };
    let parity = match port.parity() {
        Ok(Parity::Odd) => ODDPARITY,
        Ok(Parity::Even) => EVENPARITY,
        _ => NOPARITY,
    };
    let stop_bits = match port.stop_bits() {
        Ok(StopBits::Two) => TWOSTOPBITS,
        _ => ONESTOPBIT,
    };
    let mut flags = DCB_F_BINARY
        | (DTR_CONTROL_ENABLE << DCB_DTR_CONTROL_SHIFT)
        | (RTS_CONTROL_ENABLE << DCB_RTS_CONTROL_SHIFT);
    match port.flow_control() {
        Ok(FlowControl::Hardware) => {
            flags = (flags & !DCB_RTS_CONTROL_MASK)
                | DCB_F_OUTX_CTS_FLOW
                | (RTS_CONTROL_HANDSHAKE << DCB_RTS_CONTROL_SHIFT)
        }
        Ok(FlowControl::Software) => flags |= DCB_F_OUTX | DCB_F_INX,
        _ => {}
    }
    Dcb {
        baud_rate: port.baud_rate().unwrap_or(OPEN_BAUD),
        flags,
        xon_lim: 2048,
        xoff_lim: 512,
        byte_size,
        parity,
        stop_bits,
        xon_char: 0x11,
        xoff_char: 0x13,
        error_char: 0,
        eof_char: 0x1A,
        evt_char: 0x1A,
    }
}

struct PolledState {
    dcb: Dcb,
    timeouts: CommTimeouts,
    event_mask: HardwareEvent,
    mask_generation: u64,
    gens: Generations,
    last_in: u32,
    last_pins: PinState,
    tx_pending: bool,
}

/// A `serialport` handle split into independent reader, writer and control
/// clones so reads, writes and event polling never wait on each other.
/// Closing drops all three, releasing the descriptors.
pub struct NativePort {
    name: String,
    reader: Mutex<Option<Port>>,
    writer: Mutex<Option<Port>>,
    control: Mutex<Option<Port>>,
    state: Mutex<PolledState>,
    wake: Condvar,
    closed: AtomicBool,
    modem_lines: AtomicBool,
}

impl NativePort {
    fn new(name: &str, mut control: Port) -> Result<Self, DeviceError> {
        let mut reader = control
            .try_clone()
            .map_err(|e| port_error(name, "clone reader", e))?;
        let mut writer = control
            .try_clone()
            .map_err(|e| port_error(name, "clone writer", e))?;
        reader
            .set_timeout(POLL_SLICE)
            .map_err(|e| port_error(name, "set timeout", e))?;
        writer
            .set_timeout(POLL_SLICE)
            .map_err(|e| port_error(name, "set timeout", e))?;

        let dcb = initial_dcb(&control);
        let (last_pins, modem_lines) = match sample_pins(&mut control) {
            Ok(pins) => (pins, true),
            Err(e) => {
                unsupported_lines(name, e)?;
                (PinState::empty(), false)
            }
        };
        Ok(Self {
            name: name.to_string(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            control: Mutex::new(Some(control)),
            state: Mutex::new(PolledState {
                dcb,
                timeouts: CommTimeouts::default(),
                event_mask: HardwareEvent::empty(),
                mask_generation: 0,
                gens: Generations::default(),
                last_in: 0,
                last_pins,
                tx_pending: false,
            }),
            wake: Condvar::new(),
            closed: AtomicBool::new(false),
            modem_lines: AtomicBool::new(modem_lines),
        })
    }

    fn state(&self) -> MutexGuard<'_, PolledState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> DeviceError {
        DeviceError::invalid_handle(format!("{} is closed", self.name))
    }

    fn with_control<R>(
        &self,
        f: impl FnOnce(&mut Port) -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        match control.as_mut() {
            Some(port) => f(port),
            None => Err(self.closed_error()),
        }
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    fn has_modem_lines(&self) -> bool {
        self.modem_lines.load(Ordering::Acquire)
    }

    fn read_pins(&self, port: &mut Port) -> Result<PinState, DeviceError> {
        if !self.has_modem_lines() {
            return Ok(PinState::empty());
        }
        match sample_pins(port) {
            Ok(pins) => Ok(pins),
            Err(e) => {
                unsupported_lines(&self.name, e)?;
                self.modem_lines.store(false, Ordering::Release);
                Ok(PinState::empty())
            }
        }
    }

    fn drive_line(
        &self,
        what: &str,
        result: serialport::Result<()>,
    ) -> Result<(), DeviceError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                log::debug!("{}: {} failed", self.name, what);
                unsupported_lines(&self.name, e)?;
                self.modem_lines.store(false, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Samples queues and modem lines, returning every event since the last
    /// sample regardless of the mask.
    fn poll_events(&self) -> Result<HardwareEvent, DeviceError> {
        let (in_queue, out_queue, pins) = self.with_control(|port| {
            let in_queue = port
                .bytes_to_read()
                .map_err(|e| port_error(&self.name, "query input queue", e))?;
            let out_queue = port
                .bytes_to_write()
                .map_err(|e| port_error(&self.name, "query output queue", e))?;
            let pins = self.read_pins(port)?;
            Ok((in_queue, out_queue, pins))
        })?;

        let mut state = self.state();
        let mut events = HardwareEvent::from_pin_changes(state.last_pins ^ pins);
        state.last_pins = pins;
        if in_queue > 0 && in_queue != state.last_in {
            events |= HardwareEvent::DATA_RECEIVED;
        }
        state.last_in = in_queue;
        if state.tx_pending && out_queue == 0 {
            state.tx_pending = false;
            events |= HardwareEvent::TRANSMIT_EMPTY;
        }
        Ok(events)
    }

    fn pause<'a>(&self, guard: MutexGuard<'a, PolledState>) -> MutexGuard<'a, PolledState> {
        match self.wake.wait_timeout(guard, POLL_SLICE) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

fn sample_pins(port: &mut Port) -> serialport::Result<PinState> {
    let mut pins = PinState::empty();
    pins.set(PinState::CTS, port.read_clear_to_send()?);
    pins.set(PinState::DSR, port.read_data_set_ready()?);
    pins.set(PinState::RING, port.read_ring_indicator()?);
    pins.set(PinState::RLSD, port.read_carrier_detect()?);
    Ok(pins)
}

impl SerialDevice for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> Result<CommProperties, DeviceError> {
        self.check()?;
        // serialport reports neither a baud ceiling nor queue sizes.
        Ok(CommProperties::default())
    }

    fn setup_queues(&self, rx_size: u32, tx_size: u32) -> Result<(), DeviceError> {
        self.check()?;
        log::debug!(
            "{}: driver manages its own queues, ignoring rx={} tx={}",
            self.name,
            rx_size,
            tx_size
        );
        Ok(())
    }

    fn get_dcb(&self) -> Result<Dcb, DeviceError> {
        self.check()?;
        Ok(self.state().dcb)
    }

    fn set_dcb(&self, dcb: &Dcb) -> Result<(), DeviceError> {
        self.check()?;
        if dcb.baud_rate == 0 {
            return Err(DeviceError::new(ERROR_INVALID_PARAMETER, "baud rate must be positive"));
        }
        let settings = port_settings(dcb)?;
        self.with_control(|port| {
            let name = &self.name;
            port.set_baud_rate(dcb.baud_rate)
                .map_err(|e| port_error(name, "set baud rate", e))?;
            port.set_data_bits(settings.data_bits)
                .map_err(|e| port_error(name, "set data bits", e))?;
            port.set_parity(settings.parity)
                .map_err(|e| port_error(name, "set parity", e))?;
            port.set_stop_bits(settings.stop_bits)
                .map_err(|e| port_error(name, "set stop bits", e))?;
            port.set_flow_control(settings.flow_control)
                .map_err(|e| port_error(name, "set flow control", e))?;
            if !self.has_modem_lines() {
                return Ok(());
            }
            self.drive_line(
                "drive DTR",
                port.write_data_terminal_ready(dcb.dtr_control() != DTR_CONTROL_DISABLE),
            )?;
            let rts = match dcb.rts_control() {
                RTS_CONTROL_DISABLE => Some(false),
                RTS_CONTROL_ENABLE => Some(true),
                _ => None,
            };
            match rts {
                Some(level) if self.has_modem_lines() => {
                    self.drive_line("drive RTS", port.write_request_to_send(level))
                }
                _ => Ok(()),
            }
        })?;
        self.state().dcb = *dcb;
        Ok(())
    }

    fn get_timeouts(&self) -> Result<CommTimeouts, DeviceError> {
        self.check()?;
        Ok(self.state().timeouts)
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> Result<(), DeviceError> {
        self.check()?;
        self.state().timeouts = *timeouts;
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> IoStatus {
        if let Err(e) = self.check() {
            return IoStatus::failed(0, e);
        }
        if buf.is_empty() {
            return IoStatus::ok(0);
        }
        let start = Instant::now();
        let (generation, timeouts) = {
            let state = self.state();
            (state.gens.read, state.timeouts)
        };
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(reader) = reader.as_mut() else {
            return IoStatus::failed(0, self.closed_error());
        };

        if timeouts.returns_immediately() {
            let available = match reader.bytes_to_read() {
                Ok(n) => n as usize,
                Err(e) => return IoStatus::failed(0, port_error(&self.name, "read", e)),
            };
            if available == 0 {
                return IoStatus::ok(0);
            }
            let want = available.min(buf.len());
            return match reader.read(&mut buf[..want]) {
                Ok(n) => IoStatus::ok(n),
                Err(e) if is_transient(&e) => IoStatus::ok(0),
                Err(e) => IoStatus::failed(0, io_failure(&self.name, "read", e)),
            };
        }

        let total = timeouts.read_deadline(buf.len(), start);
        let mut count = 0;
        let mut last_byte: Option<Instant> = None;
        loop {
            if let Err(e) = self.check() {
                return IoStatus::failed(count, e);
            }
            if self.state().gens.read != generation {
                return IoStatus::failed(count, DeviceError::aborted("read cancelled"));
            }
            match reader.read(&mut buf[count..]) {
                Ok(n) if n > 0 => {
                    count += n;
                    last_byte = Some(Instant::now());
                    self.state().last_in = 0;
                }
                Ok(_) => {}
                Err(e) if is_transient(&e) => {}
                Err(e) => return IoStatus::failed(count, io_failure(&self.name, "read", e)),
            }
            if timeouts.read_satisfied(count, buf.len()) {
                return IoStatus::ok(count);
            }
            let gap = match (timeouts.interval_gap(), last_byte) {
                (Some(gap), Some(at)) => Some(at + gap),
                _ => None,
            };
            let deadline = match (total, gap) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return IoStatus::ok(count);
            }
        }
    }

    fn write(&self, data: &[u8]) -> IoStatus {
        if let Err(e) = self.check() {
            return IoStatus::failed(0, e);
        }
        let start = Instant::now();
        let (generation, deadline) = {
            let state = self.state();
            (state.gens.write, state.timeouts.write_deadline(data.len(), start))
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = writer.as_mut() else {
            return IoStatus::failed(0, self.closed_error());
        };
        let mut sent = 0;
        while sent < data.len() {
            if let Err(e) = self.check() {
                return IoStatus::failed(sent, e);
            }
            if self.state().gens.write != generation {
                return IoStatus::failed(sent, DeviceError::aborted("write cancelled"));
            }
            match writer.write(&data[sent..]) {
                Ok(n) => sent += n,
                Err(e) if is_transient(&e) => {}
                Err(e) => return IoStatus::failed(sent, io_failure(&self.name, "write", e)),
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                break;
            }
        }
        if sent > 0 {
            self.state().tx_pending = true;
        }
        IoStatus::ok(sent)
    }

    fn set_event_mask(&self, mask: HardwareEvent) -> Result<(), DeviceError> {
        self.check()?;
        let mut state = self.state();
        state.event_mask = mask;
        state.mask_generation += 1;
        self.wake.notify_all();
        Ok(())
    }

    fn wait_event(&self) -> Result<HardwareEvent, DeviceError> {
        let mut state = self.state();
        let generation = state.gens.wait;
        let mask_generation = state.mask_generation;
        loop {
            self.check()?;
            if state.gens.wait != generation {
                return Err(DeviceError::aborted("event wait cancelled"));
            }
            if state.mask_generation != mask_generation {
                return Ok(HardwareEvent::empty());
            }
            drop(state);
            let observed = self.poll_events();
            state = self.state();
            let events = observed? & state.event_mask;
            if !events.is_empty() {
                return Ok(events);
            }
            state = self.pause(state);
        }
    }

    fn cancel(&self, scope: CancelScope) {
        self.state().gens.bump(scope);
        self.wake.notify_all();
    }

    fn purge(&self, flags: PurgeFlags) -> Result<(), DeviceError> {
        self.check()?;
        self.with_control(|port| {
            if flags.contains(PurgeFlags::RX_CLEAR) {
                port.clear(ClearBuffer::Input)
                    .map_err(|e| port_error(&self.name, "purge input", e))?;
            }
            if flags.contains(PurgeFlags::TX_CLEAR) {
                port.clear(ClearBuffer::Output)
                    .map_err(|e| port_error(&self.name, "purge output", e))?;
            }
            Ok(())
        })?;
        let mut state = self.state();
        if flags.contains(PurgeFlags::RX_CLEAR) {
            state.last_in = 0;
        }
        if flags.contains(PurgeFlags::RX_ABORT) {
            state.gens.bump(CancelScope::Read);
        }
        if flags.contains(PurgeFlags::TX_ABORT) {
            state.gens.bump(CancelScope::Write);
        }
        self.wake.notify_all();
        Ok(())
    }

    fn escape(&self, function: EscapeFunction) -> Result<(), DeviceError> {
        self.check()?;
        let line = matches!(
            function,
            EscapeFunction::SetRts
                | EscapeFunction::ClrRts
                | EscapeFunction::SetDtr
                | EscapeFunction::ClrDtr
        );
        if line && !self.has_modem_lines() {
            return Err(not_supported("modem control lines"));
        }
        self.with_control(|port| {
            let result = match function {
                EscapeFunction::SetRts => port.write_request_to_send(true),
                EscapeFunction::ClrRts => port.write_request_to_send(false),
                EscapeFunction::SetDtr => port.write_data_terminal_ready(true),
                EscapeFunction::ClrDtr => port.write_data_terminal_ready(false),
                EscapeFunction::SetBreak => port.set_break(),
                EscapeFunction::ClrBreak => port.clear_break(),
                EscapeFunction::SetXon | EscapeFunction::SetXoff => {
                    return Err(not_supported("manual XON/XOFF"))
                }
            };
            result.map_err(|e| port_error(&self.name, "escape", e))
        })
    }

    fn modem_status(&self) -> Result<PinState, DeviceError> {
        self.check()?;
        self.with_control(|port| self.read_pins(port))
    }

    fn clear_error(&self) -> Result<(LineErrorSet, ComStat), DeviceError> {
        // serialport has no access to the driver's error latch.
        Ok((LineErrorSet::empty(), self.comm_status()?))
    }

    fn comm_status(&self) -> Result<ComStat, DeviceError> {
        self.check()?;
        self.with_control(|port| {
            Ok(ComStat {
                hold: HoldReasons::empty(),
                in_queue: port
                    .bytes_to_read()
                    .map_err(|e| port_error(&self.name, "query input queue", e))?,
                out_queue: port
                    .bytes_to_write()
                    .map_err(|e| port_error(&self.name, "query output queue", e))?,
            })
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state().gens.bump(CancelScope::All);
        self.wake.notify_all();
        // Blocked requests see the flag within one slice and let go.
        for slot in [&self.reader, &self.writer, &self.control] {
            drop(slot.lock().unwrap_or_else(PoisonError::into_inner).take());
        }
        log::info!("Closed serial device {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dcb() -> Dcb {
        Dcb {
            baud_rate: 115_200,
            flags: DCB_F_BINARY
                | (DTR_CONTROL_ENABLE << DCB_DTR_CONTROL_SHIFT)
                | (RTS_CONTROL_ENABLE << DCB_RTS_CONTROL_SHIFT),
            byte_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_settings() {
        let settings = port_settings(&dcb()).unwrap();
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.flow_control, FlowControl::None);
    }

    #[test]
    fn test_flow_control_mapping() {
        let mut hw = dcb();
        hw.flags = (hw.flags & !DCB_RTS_CONTROL_MASK)
            | DCB_F_OUTX_CTS_FLOW
            | (RTS_CONTROL_HANDSHAKE << DCB_RTS_CONTROL_SHIFT);
        assert_eq!(port_settings(&hw).unwrap().flow_control, FlowControl::Hardware);

        let mut sw = dcb();
        sw.flags |= DCB_F_OUTX | DCB_F_INX;
        assert_eq!(port_settings(&sw).unwrap().flow_control, FlowControl::Software);
    }

    #[test]
    fn test_unsupported_framing() {
        let mut mark = dcb();
        mark.parity = MARKPARITY;
        assert_eq!(port_settings(&mark).unwrap_err().code, ERROR_NOT_SUPPORTED);

        let mut one_half = dcb();
        one_half.byte_size = 5;
        one_half.stop_bits = ONE5STOPBITS;
        assert_eq!(port_settings(&one_half).unwrap_err().code, ERROR_NOT_SUPPORTED);

        let mut toggle = dcb();
        toggle.flags |= RTS_CONTROL_TOGGLE << DCB_RTS_CONTROL_SHIFT;
        assert_eq!(port_settings(&toggle).unwrap_err().code, ERROR_NOT_SUPPORTED);
    }

    #[test]
    fn test_error_codes() {
        let gone = || serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert_eq!(open_error("COM3", gone()).code, ERROR_FILE_NOT_FOUND);
        assert_eq!(port_error("COM3", "read", gone()).code, ERROR_DEVICE_REMOVED);

        let denied = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "denied",
        );
        assert_eq!(open_error("COM3", denied).code, ERROR_ACCESS_DENIED);

        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(io_failure("COM3", "write", pipe).code, ERROR_DEVICE_REMOVED);
    }

    #[test]
    fn test_missing_modem_lines_are_not_fatal() {
        let enotty = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::Other),
            "Inappropriate ioctl for device",
        );
        assert!(unsupported_lines("/dev/pts/3", enotty).is_ok());

        let gone = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert_eq!(
            unsupported_lines("/dev/ttyUSB0", gone).unwrap_err().code,
            ERROR_DEVICE_REMOVED
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pseudo_terminal_opens_and_closes_cleanly() {
        use serialport::SerialPort as _;

        let (_master, slave) = serialport::TTYPort::pair().unwrap();
        let name = slave.name().unwrap();
        drop(slave);

        let device = NativeBackend.open(&name).unwrap();
        assert_eq!(device.modem_status().unwrap(), PinState::empty());
        let mut dcb = device.get_dcb().unwrap();
        dcb.baud_rate = 57_600;
        device.set_dcb(&dcb).unwrap();
        assert_eq!(device.get_dcb().unwrap().baud_rate, 57_600);

        device.close();
        assert_eq!(device.comm_status().unwrap_err().code, ERROR_INVALID_HANDLE);
        assert!(device.read(&mut [0u8; 4]).status.is_err());

        // The descriptors are gone even though the device value is alive.
        let reopened = NativeBackend.open(&name).unwrap();
        reopened.close();
        drop(device);
    }

    #[cfg(unix)]
    #[test]
    fn test_regular_file_is_not_a_serial_device() {
        let path = std::env::temp_dir().join("comport-not-a-tty");
        std::fs::write(&path, b"x").unwrap();
        let err = NativeBackend
            .open(path.to_str().unwrap())
            .err()
            .unwrap();
        assert_eq!(err.code, ERROR_BAD_DEV_TYPE);
        let _ = std::fs::remove_file(path);

        let missing = NativeBackend.open("/dev/comport-missing").err().unwrap();
        assert_eq!(missing.code, ERROR_FILE_NOT_FOUND);
    }
}
