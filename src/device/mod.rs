pub mod handle;
pub mod native;
mod receive;
pub mod serialport_backend;
pub mod virtual_port;

pub use handle::DeviceHandle;
pub use native::*;
pub use serialport_backend::NativeBackend;
pub use virtual_port::{VirtualBus, VirtualLine};

use serde::{Deserialize, Serialize};

/// Failure reported by a device, carrying the native status code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{context} (native error {code})")]
pub struct DeviceError {
    pub code: u32,
    pub context: String,
}

/// Coarse classification of native status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    NotFound,
    AccessDenied,
    NotASerialDevice,
    InvalidParameter,
    NotSupported,
    Aborted,
    TimedOut,
    Removed,
    InvalidHandle,
    Fault,
}

impl DeviceError {
    pub fn new(code: u32, context: impl Into<String>) -> Self {
        Self {
            code,
            context: context.into(),
        }
    }

    pub fn aborted(context: impl Into<String>) -> Self {
        Self::new(ERROR_OPERATION_ABORTED, context)
    }

    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_HANDLE, context)
    }

    pub fn kind(&self) -> DeviceErrorKind {
        match self.code {
            ERROR_FILE_NOT_FOUND => DeviceErrorKind::NotFound,
            ERROR_ACCESS_DENIED => DeviceErrorKind::AccessDenied,
            ERROR_BAD_DEV_TYPE => DeviceErrorKind::NotASerialDevice,
            ERROR_INVALID_PARAMETER | ERROR_BAD_COMMAND => DeviceErrorKind::InvalidParameter,
            ERROR_NOT_SUPPORTED => DeviceErrorKind::NotSupported,
            ERROR_OPERATION_ABORTED => DeviceErrorKind::Aborted,
            ERROR_SEM_TIMEOUT => DeviceErrorKind::TimedOut,
            ERROR_DEVICE_REMOVED => DeviceErrorKind::Removed,
            ERROR_INVALID_HANDLE => DeviceErrorKind::InvalidHandle,
            _ => DeviceErrorKind::Fault,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.kind() == DeviceErrorKind::Aborted
    }

    /// Errors after which the handle can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            DeviceErrorKind::Removed | DeviceErrorKind::InvalidHandle | DeviceErrorKind::Fault
        )
    }
}

/// Completion status of a single read or write: bytes moved plus the final
/// native status. A failed transfer can still have moved some bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoStatus {
    pub information: usize,
    pub status: Result<(), DeviceError>,
}

impl IoStatus {
    pub fn ok(information: usize) -> Self {
        Self {
            information,
            status: Ok(()),
        }
    }

    pub fn failed(information: usize, error: DeviceError) -> Self {
        Self {
            information,
            status: Err(error),
        }
    }
}

/// Which outstanding requests a cancellation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelScope {
    Read,
    Write,
    Wait,
    All,
}

/// Cancellation counters. A blocked request remembers the value it started
/// with and aborts once the counter moves.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Generations {
    pub read: u64,
    pub write: u64,
    pub wait: u64,
}

impl Generations {
    pub fn bump(&mut self, scope: CancelScope) {
        match scope {
            CancelScope::Read => self.read += 1,
            CancelScope::Write => self.write += 1,
            CancelScope::Wait => self.wait += 1,
            CancelScope::All => {
                self.read += 1;
                self.write += 1;
                self.wait += 1;
            }
        }
    }
}

/// An opened serial device.
///
/// All methods take `&self`: reads, writes and event waits run concurrently
/// on separate threads, and `cancel` must be able to unblock any of them.
pub trait SerialDevice: Send + Sync {
    fn name(&self) -> &str;

    fn properties(&self) -> Result<CommProperties, DeviceError>;
    fn setup_queues(&self, rx_size: u32, tx_size: u32) -> Result<(), DeviceError>;

    fn get_dcb(&self) -> Result<Dcb, DeviceError>;
    fn set_dcb(&self, dcb: &Dcb) -> Result<(), DeviceError>;
    fn get_timeouts(&self) -> Result<CommTimeouts, DeviceError>;
    fn set_timeouts(&self, timeouts: &CommTimeouts) -> Result<(), DeviceError>;

    /// Blocking read governed by the device timeouts.
    fn read(&self, buf: &mut [u8]) -> IoStatus;
    /// Blocking write governed by the device timeouts.
    fn write(&self, data: &[u8]) -> IoStatus;

    fn set_event_mask(&self, mask: HardwareEvent) -> Result<(), DeviceError>;
    /// Blocks until an event in the mask occurs. Returns an empty set when
    /// the mask is changed underneath the wait.
    fn wait_event(&self) -> Result<HardwareEvent, DeviceError>;

    /// Aborts requests blocked at the time of the call. Later requests are
    /// unaffected.
    fn cancel(&self, scope: CancelScope);
    fn purge(&self, flags: PurgeFlags) -> Result<(), DeviceError>;
    fn escape(&self, function: EscapeFunction) -> Result<(), DeviceError>;
    fn modem_status(&self) -> Result<PinState, DeviceError>;

    /// Returns and clears the latched line errors together with queue status.
    fn clear_error(&self) -> Result<(LineErrorSet, ComStat), DeviceError>;
    /// Queue status without touching the error latch.
    fn comm_status(&self) -> Result<ComStat, DeviceError>;

    fn close(&self);
}

/// Source of devices: the platform driver stack or an in-process bus.
pub trait Backend: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn SerialDevice>, DeviceError>;
    fn enumerate(&self) -> Result<Vec<SerialDeviceInfo>, DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Usb,
    Pci,
    Bluetooth,
    Virtual,
    Unknown,
}

/// One enumerated port: symbolic identifier plus platform device name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub id: String,
    pub port_name: String,
    pub kind: PortKind,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}
