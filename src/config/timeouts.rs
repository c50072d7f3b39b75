use serde::{Deserialize, Serialize};

use crate::device::native::{CommTimeouts, MAXDWORD};
use crate::device::{DeviceError, DeviceHandle};

/// Interval value meaning "complete reads with whatever is already buffered".
pub const RETURN_IMMEDIATELY: u32 = MAXDWORD;

/// Device-level read/write timeouts in milliseconds.
///
/// Read total = multiplier * requested bytes + constant; 0 for both means
/// no total limit. The read interval bounds the gap between two received
/// bytes once data has started arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub read_interval_ms: u32,
    pub read_total_multiplier_ms: u32,
    pub read_total_constant_ms: u32,
    pub write_total_multiplier_ms: u32,
    pub write_total_constant_ms: u32,
}

impl TimeoutSettings {
    pub fn return_immediately() -> Self {
        Self {
            read_interval_ms: RETURN_IMMEDIATELY,
            ..Default::default()
        }
    }

    /// Wait up to `ms` for the first byte, then return what is buffered.
    pub fn first_byte_within(ms: u32) -> Self {
        Self {
            read_interval_ms: RETURN_IMMEDIATELY,
            read_total_multiplier_ms: RETURN_IMMEDIATELY,
            read_total_constant_ms: ms,
            ..Default::default()
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.to_native().returns_immediately()
    }

    pub(crate) fn to_native(self) -> CommTimeouts {
        CommTimeouts {
            read_interval_timeout: self.read_interval_ms,
            read_total_timeout_multiplier: self.read_total_multiplier_ms,
            read_total_timeout_constant: self.read_total_constant_ms,
            write_total_timeout_multiplier: self.write_total_multiplier_ms,
            write_total_timeout_constant: self.write_total_constant_ms,
        }
    }

    pub(crate) fn from_native(native: &CommTimeouts) -> Self {
        Self {
            read_interval_ms: native.read_interval_timeout,
            read_total_multiplier_ms: native.read_total_timeout_multiplier,
            read_total_constant_ms: native.read_total_timeout_constant,
            write_total_multiplier_ms: native.write_total_timeout_multiplier,
            write_total_constant_ms: native.write_total_timeout_constant,
        }
    }
}

pub fn apply_timeouts(handle: &DeviceHandle, timeouts: &TimeoutSettings) -> Result<(), DeviceError> {
    let _exclusive = handle.configure();
    handle.ensure_live()?;
    handle.device().set_timeouts(&timeouts.to_native())?;
    log::debug!("{}: applied timeouts {:?}", handle.name(), timeouts);
    Ok(())
}

pub fn read_timeouts(handle: &DeviceHandle) -> Result<TimeoutSettings, DeviceError> {
    handle.ensure_live()?;
    Ok(TimeoutSettings::from_native(&handle.device().get_timeouts()?))
}
