pub mod config;
pub mod device;
pub mod serial;

pub use config::{
    DtrMode, Handshake, LineConfiguration, Parity, PortSettings, RtsMode, StopBits,
    TimeoutSettings,
};
pub use device::{
    Backend, DeviceError, HardwareEvent, LineErrorSet, NativeBackend, PinState, SerialDeviceInfo,
    VirtualBus, VirtualLine,
};
pub use serial::{
    AsyncOperation, CompletionState, ConfigError, EventKind, IoError, Notification, OpenError,
    PortState, PortStatistics, Result, SerialError, SerialEvent, SerialPort, SubscriptionId,
};
