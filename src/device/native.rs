//! Native serial control structures and constants.
//!
//! The layouts and numeric values mirror the Win32 serial communication API
//! (DCB, COMMTIMEOUTS, COMSTAT, the EV_/CE_/MS_ masks and the
//! EscapeCommFunction codes). Every backend speaks in these terms, so the core
//! never has to know which driver stack sits underneath a handle.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub const MAXDWORD: u32 = u32::MAX;

// Native status codes carried by `DeviceError`.
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_BAD_COMMAND: u32 = 22;
pub const ERROR_GEN_FAILURE: u32 = 31;
pub const ERROR_NOT_SUPPORTED: u32 = 50;
pub const ERROR_BAD_DEV_TYPE: u32 = 66;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_SEM_TIMEOUT: u32 = 121;
pub const ERROR_OPERATION_ABORTED: u32 = 995;
pub const ERROR_DEVICE_REMOVED: u32 = 1617;

// DCB bitfield layout.
pub const DCB_F_BINARY: u32 = 0x0001;
pub const DCB_F_PARITY: u32 = 0x0002;
pub const DCB_F_OUTX_CTS_FLOW: u32 = 0x0004;
pub const DCB_F_OUTX_DSR_FLOW: u32 = 0x0008;
pub const DCB_DTR_CONTROL_SHIFT: u32 = 4;
pub const DCB_DTR_CONTROL_MASK: u32 = 0x0030;
pub const DCB_F_DSR_SENSITIVITY: u32 = 0x0040;
pub const DCB_F_TX_CONTINUE_ON_XOFF: u32 = 0x0080;
pub const DCB_F_OUTX: u32 = 0x0100;
pub const DCB_F_INX: u32 = 0x0200;
pub const DCB_F_ERROR_CHAR: u32 = 0x0400;
pub const DCB_F_NULL: u32 = 0x0800;
pub const DCB_RTS_CONTROL_SHIFT: u32 = 12;
pub const DCB_RTS_CONTROL_MASK: u32 = 0x3000;
pub const DCB_F_ABORT_ON_ERROR: u32 = 0x4000;

pub const DTR_CONTROL_DISABLE: u32 = 0;
pub const DTR_CONTROL_ENABLE: u32 = 1;
pub const DTR_CONTROL_HANDSHAKE: u32 = 2;

pub const RTS_CONTROL_DISABLE: u32 = 0;
pub const RTS_CONTROL_ENABLE: u32 = 1;
pub const RTS_CONTROL_HANDSHAKE: u32 = 2;
pub const RTS_CONTROL_TOGGLE: u32 = 3;

pub const NOPARITY: u8 = 0;
pub const ODDPARITY: u8 = 1;
pub const EVENPARITY: u8 = 2;
pub const MARKPARITY: u8 = 3;
pub const SPACEPARITY: u8 = 4;

pub const ONESTOPBIT: u8 = 0;
pub const ONE5STOPBITS: u8 = 1;
pub const TWOSTOPBITS: u8 = 2;

/// Device control block. `flags` is the packed bitfield described by the
/// `DCB_*` constants; bits above `DCB_F_ABORT_ON_ERROR` belong to the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dcb {
    pub baud_rate: u32,
    pub flags: u32,
    pub xon_lim: u16,
    pub xoff_lim: u16,
    pub byte_size: u8,
    pub parity: u8,
    pub stop_bits: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub error_char: u8,
    pub eof_char: u8,
    pub evt_char: u8,
}

impl Dcb {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    pub fn dtr_control(&self) -> u32 {
        (self.flags & DCB_DTR_CONTROL_MASK) >> DCB_DTR_CONTROL_SHIFT
    }

    pub fn rts_control(&self) -> u32 {
        (self.flags & DCB_RTS_CONTROL_MASK) >> DCB_RTS_CONTROL_SHIFT
    }

    /// True when both ends would frame characters identically.
    pub fn same_framing(&self, other: &Dcb) -> bool {
        self.baud_rate == other.baud_rate
            && self.byte_size == other.byte_size
            && self.parity == other.parity
            && self.stop_bits == other.stop_bits
    }
}

/// COMMTIMEOUTS, all values in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommTimeouts {
    pub read_interval_timeout: u32,
    pub read_total_timeout_multiplier: u32,
    pub read_total_timeout_constant: u32,
    pub write_total_timeout_multiplier: u32,
    pub write_total_timeout_constant: u32,
}

impl CommTimeouts {
    /// Reads complete at once with whatever is buffered, possibly nothing.
    pub fn returns_immediately(&self) -> bool {
        self.read_interval_timeout == MAXDWORD
            && self.read_total_timeout_multiplier == 0
            && self.read_total_timeout_constant == 0
    }

    /// Whether a read holding `collected` of `requested` bytes is done.
    ///
    /// With no inter-byte interval (0 or MAXDWORD) a read returns as soon as
    /// it has collected anything; otherwise it waits to fill the buffer and
    /// lets the interval timer cut it short.
    pub fn read_satisfied(&self, collected: usize, requested: usize) -> bool {
        if collected >= requested {
            return true;
        }
        collected > 0 && self.interval_gap().is_none()
    }

    /// Inter-byte gap that terminates a read once data has started arriving.
    pub fn interval_gap(&self) -> Option<Duration> {
        match self.read_interval_timeout {
            0 | MAXDWORD => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    /// Absolute deadline of a read of `requested` bytes started at `start`.
    pub fn read_deadline(&self, requested: usize, start: Instant) -> Option<Instant> {
        let total = if self.read_total_timeout_multiplier == MAXDWORD {
            // Wait-for-first-byte form: only the constant bounds the call.
            self.read_total_timeout_constant as u64
        } else {
            total_ms(
                self.read_total_timeout_multiplier,
                self.read_total_timeout_constant,
                requested,
            )
        };
        bounded(total, start)
    }

    /// Absolute deadline of a write of `requested` bytes started at `start`.
    pub fn write_deadline(&self, requested: usize, start: Instant) -> Option<Instant> {
        let total = total_ms(
            self.write_total_timeout_multiplier,
            self.write_total_timeout_constant,
            requested,
        );
        bounded(total, start)
    }
}

fn total_ms(multiplier: u32, constant: u32, requested: usize) -> u64 {
    (multiplier as u64)
        .saturating_mul(requested as u64)
        .saturating_add(constant as u64)
}

fn bounded(total_ms: u64, start: Instant) -> Option<Instant> {
    if total_ms == 0 || total_ms >= MAXDWORD as u64 {
        None
    } else {
        Some(start + Duration::from_millis(total_ms))
    }
}

bitflags! {
    /// Hardware event categories reported by a wait on the event mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HardwareEvent: u32 {
        /// EV_RXCHAR
        const DATA_RECEIVED = 0x0001;
        /// EV_RXFLAG
        const EVENT_CHAR = 0x0002;
        /// EV_TXEMPTY
        const TRANSMIT_EMPTY = 0x0004;
        /// EV_CTS
        const CTS_CHANGED = 0x0008;
        /// EV_DSR
        const DSR_CHANGED = 0x0010;
        /// EV_RLSD
        const CARRIER_DETECT_CHANGED = 0x0020;
        /// EV_BREAK
        const BREAK = 0x0040;
        /// EV_ERR
        const LINE_ERROR = 0x0080;
        /// EV_RING
        const RING_CHANGED = 0x0100;
    }
}

impl HardwareEvent {
    pub const PIN_EVENTS: HardwareEvent = HardwareEvent::CTS_CHANGED
        .union(HardwareEvent::DSR_CHANGED)
        .union(HardwareEvent::CARRIER_DETECT_CHANGED)
        .union(HardwareEvent::RING_CHANGED)
        .union(HardwareEvent::BREAK);

    pub const RECEIVE_EVENTS: HardwareEvent =
        HardwareEvent::DATA_RECEIVED.union(HardwareEvent::EVENT_CHAR);

    /// Events raised by a transition of the given modem lines.
    pub fn from_pin_changes(changed: PinState) -> HardwareEvent {
        let mut events = HardwareEvent::empty();
        events.set(HardwareEvent::CTS_CHANGED, changed.contains(PinState::CTS));
        events.set(HardwareEvent::DSR_CHANGED, changed.contains(PinState::DSR));
        events.set(
            HardwareEvent::CARRIER_DETECT_CHANGED,
            changed.contains(PinState::RLSD),
        );
        events.set(HardwareEvent::RING_CHANGED, changed.contains(PinState::RING));
        events
    }
}

bitflags! {
    /// Line errors latched by the device until cleared (CE_* values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LineErrorSet: u32 {
        const RECEIVE_OVERFLOW = 0x0001;
        const OVERRUN = 0x0002;
        const PARITY = 0x0004;
        const FRAMING = 0x0008;
        const BREAK = 0x0010;
        const TRANSMIT_OVERFLOW = 0x0100;
    }
}

bitflags! {
    /// Modem status lines as reported by GetCommModemStatus (MS_* values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PinState: u32 {
        /// Clear to send
        const CTS = 0x0010;
        /// Data set ready
        const DSR = 0x0020;
        /// Ring indicator
        const RING = 0x0040;
        /// Receive line signal detect (carrier detect)
        const RLSD = 0x0080;
    }
}

bitflags! {
    /// PurgeComm flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PurgeFlags: u32 {
        const TX_ABORT = 0x0001;
        const RX_ABORT = 0x0002;
        const TX_CLEAR = 0x0004;
        const RX_CLEAR = 0x0008;
    }
}

bitflags! {
    /// Reasons the transmitter is currently holding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HoldReasons: u32 {
        const CTS = 0x01;
        const DSR = 0x02;
        const RLSD = 0x04;
        const XOFF = 0x08;
        const XOFF_SENT = 0x10;
        const BREAK = 0x20;
    }
}

/// COMSTAT
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComStat {
    pub hold: HoldReasons,
    pub in_queue: u32,
    pub out_queue: u32,
}

/// Subset of COMMPROP the engine relies on. Zero means "not reported".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommProperties {
    pub max_baud: u32,
    pub rx_queue: u32,
    pub tx_queue: u32,
}

/// EscapeCommFunction codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EscapeFunction {
    SetXoff = 1,
    SetXon = 2,
    SetRts = 3,
    ClrRts = 4,
    SetDtr = 5,
    ClrDtr = 6,
    SetBreak = 8,
    ClrBreak = 9,
}
