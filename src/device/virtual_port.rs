//! In-process null-modem bus.
//!
//! A `VirtualBus` holds named endpoint pairs wired back to back: bytes
//! written on one side land in the other side's receive queue, RTS drives the
//! peer's CTS, and DTR drives the peer's DSR and carrier detect. Devices opened
//! from the bus follow the same DCB, timeout and event-mask rules as a driver,
//! so the whole engine can run without hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::native::*;
use super::{
    Backend, CancelScope, DeviceError, Generations, IoStatus, PortKind, SerialDevice,
    SerialDeviceInfo,
};

const DEFAULT_MAX_BAUD: u32 = 921_600;
const DEFAULT_QUEUE_SIZE: u32 = 4096;

struct Side {
    name: String,
    claimed: bool,
    removed: bool,
    dcb: Dcb,
    timeouts: CommTimeouts,
    rx: VecDeque<u8>,
    rx_capacity: usize,
    tx_capacity: u32,
    rts: bool,
    dtr: bool,
    breaking: bool,
    xoff_hold: bool,
    ring: bool,
    errors: LineErrorSet,
    mask: HardwareEvent,
    pending: HardwareEvent,
    gens: Generations,
    mask_generation: u64,
    max_baud: u32,
    error_query_fault: Option<u32>,
}

impl Side {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            claimed: false,
            removed: false,
            dcb: default_dcb(),
            timeouts: CommTimeouts::default(),
            rx: VecDeque::new(),
            rx_capacity: DEFAULT_QUEUE_SIZE as usize,
            tx_capacity: DEFAULT_QUEUE_SIZE,
            rts: false,
            dtr: false,
            breaking: false,
            xoff_hold: false,
            ring: false,
            errors: LineErrorSet::empty(),
            mask: HardwareEvent::empty(),
            pending: HardwareEvent::empty(),
            gens: Generations::default(),
            mask_generation: 0,
            max_baud: DEFAULT_MAX_BAUD,
            error_query_fault: None,
        }
    }

    fn raise(&mut self, events: HardwareEvent) {
        self.pending |= events & self.mask;
    }

    fn latch(&mut self, errors: LineErrorSet) {
        self.errors |= errors;
        self.raise(HardwareEvent::LINE_ERROR);
    }

    /// Whether this side throttles its peer instead of overflowing.
    fn throttles_peer(&self) -> bool {
        self.dcb.rts_control() == RTS_CONTROL_HANDSHAKE
            || self.dcb.dtr_control() == DTR_CONTROL_HANDSHAKE
            || self.dcb.has(DCB_F_INX)
    }

    fn receive(&mut self, mut byte: u8, garbled: bool) {
        if garbled {
            let mut errors = LineErrorSet::FRAMING;
            if self.dcb.has(DCB_F_PARITY) {
                errors |= LineErrorSet::PARITY;
                if self.dcb.has(DCB_F_ERROR_CHAR) {
                    byte = self.dcb.error_char;
                }
            }
            self.latch(errors);
        }
        if byte == 0 && self.dcb.has(DCB_F_NULL) {
            return;
        }
        if self.rx.len() >= self.rx_capacity {
            self.latch(LineErrorSet::RECEIVE_OVERFLOW);
            return;
        }
        self.rx.push_back(byte);
        self.raise(HardwareEvent::DATA_RECEIVED);
        if byte == self.dcb.evt_char {
            self.raise(HardwareEvent::EVENT_CHAR);
        }
    }
}

fn default_dcb() -> Dcb {
    Dcb {
        baud_rate: 9600,
        flags: DCB_F_BINARY
            | (DTR_CONTROL_ENABLE << DCB_DTR_CONTROL_SHIFT)
            | (RTS_CONTROL_ENABLE << DCB_RTS_CONTROL_SHIFT),
        xon_lim: 2048,
        xoff_lim: 512,
        byte_size: 8,
        parity: NOPARITY,
        stop_bits: ONESTOPBIT,
        xon_char: 0x11,
        xoff_char: 0x13,
        error_char: 0,
        eof_char: 0x1A,
        evt_char: 0x1A,
    }
}

type Sides = [Side; 2];

fn pins(sides: &Sides, me: usize) -> PinState {
    let peer = &sides[1 - me];
    let mut pins = PinState::empty();
    pins.set(PinState::CTS, peer.rts);
    pins.set(PinState::DSR, peer.dtr);
    pins.set(PinState::RLSD, peer.dtr);
    pins.set(PinState::RING, sides[me].ring);
    pins
}

/// Drives this side's output lines and raises the resulting pin events on
/// the peer.
fn set_lines(sides: &mut Sides, me: usize, rts: Option<bool>, dtr: Option<bool>) {
    let peer = 1 - me;
    let before = pins(sides, peer);
    if let Some(rts) = rts {
        sides[me].rts = rts;
    }
    if let Some(dtr) = dtr {
        sides[me].dtr = dtr;
    }
    let after = pins(sides, peer);
    sides[peer].raise(HardwareEvent::from_pin_changes(before ^ after));
}

fn lines_for(dcb: &Dcb) -> (bool, bool) {
    let rts = matches!(
        dcb.rts_control(),
        RTS_CONTROL_ENABLE | RTS_CONTROL_HANDSHAKE
    );
    let dtr = dcb.dtr_control() != DTR_CONTROL_DISABLE;
    (rts, dtr)
}

fn hold_reasons(sides: &Sides, me: usize) -> HoldReasons {
    let side = &sides[me];
    let peer = &sides[1 - me];
    let mut hold = HoldReasons::empty();
    hold.set(HoldReasons::XOFF, side.xoff_hold);
    hold.set(
        HoldReasons::CTS,
        side.dcb.has(DCB_F_OUTX_CTS_FLOW) && !peer.rts,
    );
    hold.set(
        HoldReasons::DSR,
        side.dcb.has(DCB_F_OUTX_DSR_FLOW) && !peer.dtr,
    );
    hold.set(HoldReasons::BREAK, side.breaking);
    hold
}

fn validate_dcb(dcb: &Dcb, max_baud: u32) -> Result<(), DeviceError> {
    let invalid = |what: &str| Err(DeviceError::new(ERROR_INVALID_PARAMETER, what));
    if dcb.baud_rate == 0 || (max_baud != 0 && dcb.baud_rate > max_baud) {
        return invalid("baud rate out of range");
    }
    if !(5..=8).contains(&dcb.byte_size) {
        return invalid("byte size out of range");
    }
    if dcb.parity > SPACEPARITY {
        return invalid("unknown parity");
    }
    match dcb.stop_bits {
        ONESTOPBIT => {}
        ONE5STOPBITS if dcb.byte_size == 5 => {}
        TWOSTOPBITS if dcb.byte_size != 5 => {}
        _ => return invalid("stop bits incompatible with byte size"),
    }
    if (dcb.has(DCB_F_OUTX) || dcb.has(DCB_F_INX)) && dcb.xon_char == dcb.xoff_char {
        return invalid("XON and XOFF characters must differ");
    }
    Ok(())
}

struct Wire {
    sides: Mutex<Sides>,
    changed: Condvar,
}

impl Wire {
    fn lock(&self) -> MutexGuard<'_, Sides> {
        self.sides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Sides>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, Sides> {
        match deadline {
            None => self
                .changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match self.changed.wait_timeout(guard, timeout) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
        }
    }
}

#[derive(Default)]
struct BusState {
    ports: HashMap<String, (Arc<Wire>, usize)>,
    foreign: HashSet<String>,
}

/// Registry of virtual null-modem pairs.
#[derive(Clone, Default)]
pub struct VirtualBus {
    inner: Arc<Mutex<BusState>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers two endpoints wired to each other.
    pub fn create_pair(&self, a: &str, b: &str) -> (VirtualLine, VirtualLine) {
        let wire = Arc::new(Wire {
            sides: Mutex::new([Side::new(a), Side::new(b)]),
            changed: Condvar::new(),
        });
        let mut state = self.state();
        state.ports.insert(a.to_string(), (Arc::clone(&wire), 0));
        state.ports.insert(b.to_string(), (Arc::clone(&wire), 1));
        log::debug!("Created virtual pair {} <-> {}", a, b);
        (
            VirtualLine {
                wire: Arc::clone(&wire),
                side: 0,
            },
            VirtualLine { wire, side: 1 },
        )
    }

    /// Registers a name that exists but is not a serial device.
    pub fn add_non_serial(&self, name: &str) {
        self.state().foreign.insert(name.to_string());
    }

    pub fn line(&self, name: &str) -> Option<VirtualLine> {
        self.state()
            .ports
            .get(name)
            .map(|(wire, side)| VirtualLine {
                wire: Arc::clone(wire),
                side: *side,
            })
    }
}

impl Backend for VirtualBus {
    fn open(&self, name: &str) -> Result<Box<dyn SerialDevice>, DeviceError> {
        let (wire, side) = {
            let state = self.state();
            if state.foreign.contains(name) {
                return Err(DeviceError::new(
                    ERROR_BAD_DEV_TYPE,
                    format!("{} is not a serial device", name),
                ));
            }
            match state.ports.get(name) {
                Some((wire, side)) => (Arc::clone(wire), *side),
                None => {
                    return Err(DeviceError::new(
                        ERROR_FILE_NOT_FOUND,
                        format!("{} does not exist", name),
                    ))
                }
            }
        };

        {
            let mut sides = wire.lock();
            let this = &mut sides[side];
            if this.removed {
                return Err(DeviceError::new(
                    ERROR_FILE_NOT_FOUND,
                    format!("{} has been removed", name),
                ));
            }
            if this.claimed {
                return Err(DeviceError::new(
                    ERROR_ACCESS_DENIED,
                    format!("{} is already open", name),
                ));
            }
            this.claimed = true;
            this.rx.clear();
            this.errors = LineErrorSet::empty();
            this.mask = HardwareEvent::empty();
            this.pending = HardwareEvent::empty();
            this.xoff_hold = false;
            this.breaking = false;
            let (rts, dtr) = lines_for(&this.dcb);
            set_lines(&mut sides, side, Some(rts), Some(dtr));
            wire.changed.notify_all();
        }

        log::debug!("Opened virtual port {}", name);
        Ok(Box::new(VirtualPort {
            wire,
            side,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    fn enumerate(&self) -> Result<Vec<SerialDeviceInfo>, DeviceError> {
        let state = self.state();
        let mut ports: Vec<SerialDeviceInfo> = state
            .ports
            .iter()
            .filter(|(_, (wire, side))| !wire.lock()[*side].removed)
            .map(|(name, _)| SerialDeviceInfo {
                id: format!("VIRTUAL\\{}", name),
                port_name: name.clone(),
                kind: PortKind::Virtual,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            })
            .collect();
        ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        Ok(ports)
    }
}

/// Test-side view of one endpoint: injects line conditions the peer cannot
/// produce by writing.
#[derive(Clone)]
pub struct VirtualLine {
    wire: Arc<Wire>,
    side: usize,
}

impl VirtualLine {
    pub fn name(&self) -> String {
        self.wire.lock()[self.side].name.clone()
    }

    pub fn is_open(&self) -> bool {
        self.wire.lock()[self.side].claimed
    }

    /// Delivers bytes as if they arrived on the wire.
    pub fn inject_rx(&self, data: &[u8]) {
        let mut sides = self.wire.lock();
        let side = &mut sides[self.side];
        if side.claimed {
            for &byte in data {
                side.receive(byte, false);
            }
        }
        self.wire.changed.notify_all();
    }

    /// Delivers bytes that arrived with line errors, in one wire update.
    pub fn inject_rx_with_errors(&self, data: &[u8], errors: LineErrorSet) {
        let mut sides = self.wire.lock();
        let side = &mut sides[self.side];
        if side.claimed {
            side.latch(errors);
            for &byte in data {
                side.receive(byte, false);
            }
        }
        self.wire.changed.notify_all();
    }

    /// Makes error-latch queries fail with `code` until reset with `None`.
    pub fn fail_error_queries(&self, code: Option<u32>) {
        self.wire.lock()[self.side].error_query_fault = code;
    }

    pub fn inject_line_error(&self, errors: LineErrorSet) {
        let mut sides = self.wire.lock();
        sides[self.side].latch(errors);
        self.wire.changed.notify_all();
    }

    pub fn set_ring(&self, ring: bool) {
        let mut sides = self.wire.lock();
        let side = &mut sides[self.side];
        if side.ring != ring {
            side.ring = ring;
            side.raise(HardwareEvent::RING_CHANGED);
        }
        self.wire.changed.notify_all();
    }

    pub fn set_max_baud(&self, max_baud: u32) {
        self.wire.lock()[self.side].max_baud = max_baud;
    }

    /// Sets driver-private DCB bits above the documented fields.
    pub fn set_private_dcb_bits(&self, bits: u32) {
        self.wire.lock()[self.side].dcb.flags |= bits & !0x7FFF;
    }

    pub fn dcb(&self) -> Dcb {
        self.wire.lock()[self.side].dcb
    }

    pub fn timeouts(&self) -> CommTimeouts {
        self.wire.lock()[self.side].timeouts
    }

    pub fn rts(&self) -> bool {
        self.wire.lock()[self.side].rts
    }

    pub fn dtr(&self) -> bool {
        self.wire.lock()[self.side].dtr
    }

    pub fn break_active(&self) -> bool {
        self.wire.lock()[self.side].breaking
    }

    pub fn pending_input(&self) -> usize {
        self.wire.lock()[self.side].rx.len()
    }

    /// Simulates surprise removal: every request on this side fails.
    pub fn unplug(&self) {
        let mut sides = self.wire.lock();
        let side = &mut sides[self.side];
        side.removed = true;
        side.gens.bump(CancelScope::All);
        self.wire.changed.notify_all();
    }
}

/// Device opened from a `VirtualBus`.
pub struct VirtualPort {
    wire: Arc<Wire>,
    side: usize,
    name: String,
    closed: AtomicBool,
}

impl VirtualPort {
    fn check(&self, sides: &Sides) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::invalid_handle(format!(
                "{} is closed",
                self.name
            )));
        }
        if sides[self.side].removed {
            return Err(DeviceError::new(
                ERROR_DEVICE_REMOVED,
                format!("{} was removed", self.name),
            ));
        }
        Ok(())
    }

    fn with_side<T>(
        &self,
        f: impl FnOnce(&mut Sides, usize) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let mut sides = self.wire.lock();
        self.check(&sides)?;
        let result = f(&mut sides, self.side);
        self.wire.changed.notify_all();
        result
    }

    fn comstat(sides: &Sides, me: usize) -> ComStat {
        ComStat {
            hold: hold_reasons(sides, me),
            in_queue: sides[me].rx.len() as u32,
            out_queue: 0,
        }
    }
}

impl SerialDevice for VirtualPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> Result<CommProperties, DeviceError> {
        self.with_side(|sides, me| {
            Ok(CommProperties {
                max_baud: sides[me].max_baud,
                rx_queue: sides[me].rx_capacity as u32,
                tx_queue: sides[me].tx_capacity,
            })
        })
    }

    fn setup_queues(&self, rx_size: u32, tx_size: u32) -> Result<(), DeviceError> {
        self.with_side(|sides, me| {
            sides[me].rx_capacity = rx_size.max(1) as usize;
            sides[me].tx_capacity = tx_size;
            Ok(())
        })
    }

    fn get_dcb(&self) -> Result<Dcb, DeviceError> {
        self.with_side(|sides, me| Ok(sides[me].dcb))
    }

    fn set_dcb(&self, dcb: &Dcb) -> Result<(), DeviceError> {
        self.with_side(|sides, me| {
            validate_dcb(dcb, sides[me].max_baud)?;
            sides[me].dcb = *dcb;
            let (rts, dtr) = lines_for(dcb);
            set_lines(sides, me, Some(rts), Some(dtr));
            Ok(())
        })
    }

    fn get_timeouts(&self) -> Result<CommTimeouts, DeviceError> {
        self.with_side(|sides, me| Ok(sides[me].timeouts))
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> Result<(), DeviceError> {
        self.with_side(|sides, me| {
            sides[me].timeouts = *timeouts;
            Ok(())
        })
    }

    fn read(&self, buf: &mut [u8]) -> IoStatus {
        let start = Instant::now();
        let me = self.side;
        let mut sides = self.wire.lock();
        if let Err(e) = self.check(&sides) {
            return IoStatus::failed(0, e);
        }
        if buf.is_empty() {
            return IoStatus::ok(0);
        }

        let generation = sides[me].gens.read;
        let timeouts = sides[me].timeouts;
        let total = timeouts.read_deadline(buf.len(), start);
        let mut count = 0;
        let mut last_byte: Option<Instant> = None;

        loop {
            if let Err(e) = self.check(&sides) {
                return IoStatus::failed(count, e);
            }
            if sides[me].gens.read != generation {
                return IoStatus::failed(count, DeviceError::aborted("read cancelled"));
            }

            let rx = &mut sides[me].rx;
            let take = rx.len().min(buf.len() - count);
            if take > 0 {
                for (slot, byte) in buf[count..count + take].iter_mut().zip(rx.drain(..take)) {
                    *slot = byte;
                }
                count += take;
                last_byte = Some(Instant::now());
                // Writers may be throttled on our queue.
                self.wire.changed.notify_all();
            }

            if timeouts.returns_immediately() || timeouts.read_satisfied(count, buf.len()) {
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
            sides = self.wire.wait(sides, deadline);
        }
    }

    fn write(&self, data: &[u8]) -> IoStatus {
        let start = Instant::now();
        let me = self.side;
        let peer = 1 - me;
        let mut sides = self.wire.lock();
        if let Err(e) = self.check(&sides) {
            return IoStatus::failed(0, e);
        }

        let generation = sides[me].gens.write;
        let deadline = sides[me].timeouts.write_deadline(data.len(), start);
        let mut sent = 0;

        while sent < data.len() {
            if let Err(e) = self.check(&sides) {
                return IoStatus::failed(sent, e);
            }
            if sides[me].gens.write != generation {
                return IoStatus::failed(sent, DeviceError::aborted("write cancelled"));
            }

            let throttled = sides[peer].claimed
                && sides[peer].throttles_peer()
                && sides[peer].rx.len() >= sides[peer].rx_capacity;
            if hold_reasons(&sides, me).is_empty() && !throttled {
                let byte = data[sent];
                if sides[peer].claimed {
                    let garbled = !sides[me].dcb.same_framing(&sides[peer].dcb);
                    sides[peer].receive(byte, garbled);
                }
                sent += 1;
                continue;
            }

            if matches!(deadline, Some(d) if Instant::now() >= d) {
                // Like the driver: a write timeout completes with a short count.
                break;
            }
            self.wire.changed.notify_all();
            sides = self.wire.wait(sides, deadline);
        }

        if sent == data.len() {
            sides[me].raise(HardwareEvent::TRANSMIT_EMPTY);
        }
        self.wire.changed.notify_all();
        IoStatus::ok(sent)
    }

    fn set_event_mask(&self, mask: HardwareEvent) -> Result<(), DeviceError> {
        self.with_side(|sides, me| {
            let side = &mut sides[me];
            side.mask = mask;
            side.pending &= mask;
            side.mask_generation += 1;
            Ok(())
        })
    }

    fn wait_event(&self) -> Result<HardwareEvent, DeviceError> {
        let me = self.side;
        let mut sides = self.wire.lock();
        self.check(&sides)?;
        let generation = sides[me].gens.wait;
        let mask_generation = sides[me].mask_generation;
        loop {
            self.check(&sides)?;
            if sides[me].gens.wait != generation {
                return Err(DeviceError::aborted("event wait cancelled"));
            }
            if sides[me].mask_generation != mask_generation {
                return Ok(HardwareEvent::empty());
            }
            let events = std::mem::take(&mut sides[me].pending);
            if !events.is_empty() {
                return Ok(events);
            }
            sides = self.wire.wait(sides, None);
        }
    }

    fn cancel(&self, scope: CancelScope) {
        let mut sides = self.wire.lock();
        sides[self.side].gens.bump(scope);
        self.wire.changed.notify_all();
    }

    fn purge(&self, flags: PurgeFlags) -> Result<(), DeviceError> {
        self.with_side(|sides, me| {
            let side = &mut sides[me];
            if flags.contains(PurgeFlags::RX_CLEAR) {
                side.rx.clear();
            }
            if flags.contains(PurgeFlags::RX_ABORT) {
                side.gens.bump(CancelScope::Read);
            }
            if flags.contains(PurgeFlags::TX_ABORT) {
                side.gens.bump(CancelScope::Write);
            }
            Ok(())
        })
    }

    fn escape(&self, function: EscapeFunction) -> Result<(), DeviceError> {
        self.with_side(|sides, me| {
            let peer = 1 - me;
            match function {
                EscapeFunction::SetXoff => sides[me].xoff_hold = true,
                EscapeFunction::SetXon => sides[me].xoff_hold = false,
                EscapeFunction::SetRts => set_lines(sides, me, Some(true), None),
                EscapeFunction::ClrRts => set_lines(sides, me, Some(false), None),
                EscapeFunction::SetDtr => set_lines(sides, me, None, Some(true)),
                EscapeFunction::ClrDtr => set_lines(sides, me, None, Some(false)),
                EscapeFunction::SetBreak => {
                    sides[me].breaking = true;
                    if sides[peer].claimed {
                        sides[peer].raise(HardwareEvent::BREAK);
                        sides[peer].latch(LineErrorSet::BREAK);
                    }
                }
                EscapeFunction::ClrBreak => sides[me].breaking = false,
            }
            Ok(())
        })
    }

    fn modem_status(&self) -> Result<PinState, DeviceError> {
        self.with_side(|sides, me| Ok(pins(sides, me)))
    }

    fn clear_error(&self) -> Result<(LineErrorSet, ComStat), DeviceError> {
        self.with_side(|sides, me| {
            if let Some(code) = sides[me].error_query_fault {
                return Err(DeviceError::new(code, "error query rejected"));
            }
            let errors = std::mem::take(&mut sides[me].errors);
            Ok((errors, Self::comstat(sides, me)))
        })
    }

    fn comm_status(&self) -> Result<ComStat, DeviceError> {
        self.with_side(|sides, me| Ok(Self::comstat(sides, me)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = self.side;
        let mut sides = self.wire.lock();
        set_lines(&mut sides, me, Some(false), Some(false));
        let side = &mut sides[me];
        side.claimed = false;
        side.breaking = false;
        side.xoff_hold = false;
        side.mask = HardwareEvent::empty();
        side.pending = HardwareEvent::empty();
        side.gens.bump(CancelScope::All);
        self.wire.changed.notify_all();
        log::debug!("Closed virtual port {}", self.name);
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (VirtualBus, Box<dyn SerialDevice>, Box<dyn SerialDevice>) {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        let a = bus.open("COM1").unwrap();
        let b = bus.open("COM2").unwrap();
        (bus, a, b)
    }

    #[test]
    fn test_open_rules() {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        bus.add_non_serial("NUL");

        let _held = bus.open("COM1").unwrap();
        let err = bus.open("COM1").err().unwrap();
        assert_eq!(err.code, ERROR_ACCESS_DENIED);
        assert_eq!(bus.open("COM9").err().unwrap().code, ERROR_FILE_NOT_FOUND);
        assert_eq!(bus.open("NUL").err().unwrap().code, ERROR_BAD_DEV_TYPE);
    }

    #[test]
    fn test_reopen_after_close() {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        let first = bus.open("COM1").unwrap();
        first.close();
        assert!(bus.open("COM1").is_ok());
    }

    #[test]
    fn test_bytes_cross_the_wire() {
        let (_bus, a, b) = pair();
        assert_eq!(a.write(b"hello"), IoStatus::ok(5));
        let mut buf = [0u8; 16];
        let status = b.read(&mut buf);
        assert_eq!(status, IoStatus::ok(5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_immediate_read_returns_nothing() {
        let (_bus, _a, b) = pair();
        b.set_timeouts(&CommTimeouts {
            read_interval_timeout: MAXDWORD,
            ..Default::default()
        })
        .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf), IoStatus::ok(0));
    }

    #[test]
    fn test_read_total_timeout_expires() {
        let (_bus, _a, b) = pair();
        b.set_timeouts(&CommTimeouts {
            read_total_timeout_constant: 30,
            ..Default::default()
        })
        .unwrap();
        let mut buf = [0u8; 4];
        let start = Instant::now();
        assert_eq!(b.read(&mut buf), IoStatus::ok(0));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_unblocks_read() {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        let b: Arc<dyn SerialDevice> = Arc::from(bus.open("COM2").unwrap());
        let reader = {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                b.read(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(50));
        b.cancel(CancelScope::Read);
        let status = reader.join().unwrap();
        assert!(status.status.unwrap_err().is_aborted());
    }

    #[test]
    fn test_rts_drives_peer_cts() {
        let (_bus, a, b) = pair();
        b.set_event_mask(HardwareEvent::PIN_EVENTS).unwrap();
        assert!(b.modem_status().unwrap().contains(PinState::CTS));

        a.escape(EscapeFunction::ClrRts).unwrap();
        assert!(!b.modem_status().unwrap().contains(PinState::CTS));
        assert_eq!(b.wait_event().unwrap(), HardwareEvent::CTS_CHANGED);

        a.escape(EscapeFunction::ClrDtr).unwrap();
        let pins = b.modem_status().unwrap();
        assert!(!pins.contains(PinState::DSR));
        assert!(!pins.contains(PinState::RLSD));
    }

    #[test]
    fn test_overflow_latches_error() {
        let (_bus, a, b) = pair();
        b.setup_queues(4, 4).unwrap();
        b.set_event_mask(HardwareEvent::LINE_ERROR).unwrap();
        a.write(b"0123456789");
        let (errors, stat) = b.clear_error().unwrap();
        assert!(errors.contains(LineErrorSet::RECEIVE_OVERFLOW));
        assert_eq!(stat.in_queue, 4);
        assert_eq!(b.wait_event().unwrap(), HardwareEvent::LINE_ERROR);
        let (errors, _) = b.clear_error().unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn test_mismatched_framing_reports_framing_error() {
        let (_bus, a, b) = pair();
        let mut dcb = a.get_dcb().unwrap();
        dcb.baud_rate = 19_200;
        a.set_dcb(&dcb).unwrap();
        a.write(b"x");
        let (errors, _) = b.clear_error().unwrap();
        assert!(errors.contains(LineErrorSet::FRAMING));
    }

    #[test]
    fn test_parity_errors_replaced_by_error_char() {
        let (_bus, a, b) = pair();
        let mut dcb = b.get_dcb().unwrap();
        dcb.flags |= DCB_F_PARITY | DCB_F_ERROR_CHAR;
        dcb.parity = EVENPARITY;
        dcb.error_char = b'?';
        b.set_dcb(&dcb).unwrap();
        a.write(b"ab");

        let (errors, _) = b.clear_error().unwrap();
        assert!(errors.contains(LineErrorSet::PARITY));
        let mut buf = [0u8; 2];
        assert_eq!(b.read(&mut buf).information, 2);
        assert_eq!(&buf, b"??");
    }

    #[test]
    fn test_set_dcb_rejects_excessive_baud() {
        let (_bus, a, _b) = pair();
        let mut dcb = a.get_dcb().unwrap();
        dcb.baud_rate = DEFAULT_MAX_BAUD + 1;
        let err = a.set_dcb(&dcb).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
        assert_eq!(a.get_dcb().unwrap().baud_rate, 9600);
    }

    #[test]
    fn test_unplug_fails_pending_wait() {
        let bus = VirtualBus::new();
        let (line, _) = bus.create_pair("COM1", "COM2");
        let a: Arc<dyn SerialDevice> = Arc::from(bus.open("COM1").unwrap());
        a.set_event_mask(HardwareEvent::all()).unwrap();
        let waiter = {
            let a = Arc::clone(&a);
            thread::spawn(move || a.wait_event())
        };
        thread::sleep(Duration::from_millis(50));
        line.unplug();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.code, ERROR_DEVICE_REMOVED);
    }
}
