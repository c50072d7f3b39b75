pub mod control;
pub mod discovery;
pub mod dispatch;
pub mod monitor;
pub mod overlapped;
pub mod port;
pub mod types;

pub use control::{PinController, StatusReporter};
pub use discovery::available_ports;
pub use dispatch::{EventHandler, SubscriptionId};
pub use monitor::LoopState;
pub use overlapped::{AsyncOperation, CompletionState};
pub use port::SerialPort;
pub use types::{
    EventKind, Notification, PortState, PortStatistics, QueueStatus, SerialEvent,
};

use crate::config::SettingsError;
use crate::device::{DeviceError, DeviceErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("Port not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not a serial device: {0}")]
    NotASerialDevice(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Port is already open")]
    AlreadyOpen,

    #[error("Timed out opening {0}")]
    TimedOut(String),

    #[error("Device error: {0}")]
    Device(DeviceError),
}

impl From<DeviceError> for OpenError {
    fn from(e: DeviceError) -> Self {
        match e.kind() {
            DeviceErrorKind::NotFound => OpenError::NotFound(e.context),
            DeviceErrorKind::AccessDenied => OpenError::AccessDenied(e.context),
            DeviceErrorKind::NotASerialDevice => OpenError::NotASerialDevice(e.context),
            DeviceErrorKind::InvalidParameter | DeviceErrorKind::NotSupported => {
                OpenError::InvalidParameter(e.context)
            }
            _ => OpenError::Device(e),
        }
    }
}

impl From<ConfigError> for OpenError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Device(device) => device.into(),
            other => OpenError::InvalidParameter(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Baud rate {requested} exceeds the device maximum of {maximum}")]
    UnsupportedBaudRate { requested: u32, maximum: u32 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Port is not open")]
    NotOpen,

    #[error("Device error: {0}")]
    Device(DeviceError),
}

impl From<DeviceError> for ConfigError {
    fn from(e: DeviceError) -> Self {
        match e.kind() {
            DeviceErrorKind::InvalidParameter | DeviceErrorKind::NotSupported => {
                ConfigError::InvalidParameter(e.context)
            }
            DeviceErrorKind::InvalidHandle => ConfigError::NotOpen,
            _ => ConfigError::Device(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    #[error("Operation timed out after {transferred} bytes")]
    TimedOut { transferred: usize },

    #[error("Operation cancelled after {transferred} bytes")]
    Cancelled { transferred: usize },

    #[error("Device removed")]
    DeviceRemoved,

    #[error("Device fault: {0}")]
    DeviceFault(String),

    #[error("Port is not open")]
    NotOpen,

    #[error("Another operation in the same direction is in progress")]
    OperationInProgress,

    #[error("Operation already completed")]
    AlreadyCompleted,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl IoError {
    /// Bytes moved before a timeout or cancellation, 0 otherwise.
    pub fn transferred(&self) -> usize {
        match self {
            IoError::TimedOut { transferred } | IoError::Cancelled { transferred } => *transferred,
            _ => 0,
        }
    }
}

impl From<DeviceError> for IoError {
    fn from(e: DeviceError) -> Self {
        match e.kind() {
            DeviceErrorKind::Aborted => IoError::Cancelled { transferred: 0 },
            DeviceErrorKind::TimedOut => IoError::TimedOut { transferred: 0 },
            DeviceErrorKind::Removed => IoError::DeviceRemoved,
            DeviceErrorKind::InvalidHandle => IoError::NotOpen,
            DeviceErrorKind::InvalidParameter | DeviceErrorKind::NotSupported => {
                IoError::InvalidOperation(e.context)
            }
            _ => IoError::DeviceFault(e.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub type Result<T> = std::result::Result<T, SerialError>;
