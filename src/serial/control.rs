use std::sync::{Arc, Mutex, PoisonError};

use super::dispatch::NotificationSender;
use super::types::{QueueStatus, SerialEvent};
use super::IoError;
use crate::device::native::{
    EscapeFunction, LineErrorSet, PinState, DTR_CONTROL_HANDSHAKE, RTS_CONTROL_HANDSHAKE,
    RTS_CONTROL_TOGGLE,
};
use crate::device::{DeviceError, DeviceHandle};

/// Discrete control-line commands. Pin state is always read from the
/// device, never cached.
pub struct PinController<'a> {
    handle: &'a DeviceHandle,
}

impl<'a> PinController<'a> {
    pub fn new(handle: &'a DeviceHandle) -> Self {
        Self { handle }
    }

    fn escape(&self, function: EscapeFunction) -> Result<(), IoError> {
        self.handle.ensure_live()?;
        let _submit = self.handle.submit();
        self.handle.device().escape(function)?;
        log::debug!("{}: {:?}", self.handle.name(), function);
        Ok(())
    }

    pub fn set_dtr(&self, asserted: bool) -> Result<(), IoError> {
        self.handle.ensure_live()?;
        if self.handle.device().get_dcb()?.dtr_control() == DTR_CONTROL_HANDSHAKE {
            return Err(IoError::InvalidOperation(
                "DTR is driven by handshaking".into(),
            ));
        }
        self.escape(if asserted {
            EscapeFunction::SetDtr
        } else {
            EscapeFunction::ClrDtr
        })
    }

    pub fn set_rts(&self, asserted: bool) -> Result<(), IoError> {
        self.handle.ensure_live()?;
        let control = self.handle.device().get_dcb()?.rts_control();
        if control == RTS_CONTROL_HANDSHAKE || control == RTS_CONTROL_TOGGLE {
            return Err(IoError::InvalidOperation(
                "RTS is driven by handshaking".into(),
            ));
        }
        self.escape(if asserted {
            EscapeFunction::SetRts
        } else {
            EscapeFunction::ClrRts
        })
    }

    pub fn set_break(&self, active: bool) -> Result<(), IoError> {
        self.escape(if active {
            EscapeFunction::SetBreak
        } else {
            EscapeFunction::ClrBreak
        })
    }

    /// Makes the device transmit as if XON had been received.
    pub fn send_xon(&self) -> Result<(), IoError> {
        self.escape(EscapeFunction::SetXon)
    }

    /// Makes the device hold transmission as if XOFF had been received.
    pub fn send_xoff(&self) -> Result<(), IoError> {
        self.escape(EscapeFunction::SetXoff)
    }

    pub fn pins(&self) -> Result<PinState, IoError> {
        self.handle.ensure_live()?;
        Ok(self.handle.device().modem_status()?)
    }
}

/// Single path to the device error latch.
///
/// Reading the latch clears it, so the event loop and user queries both go
/// through here: calls are serialized and every non-empty error set is
/// forwarded to ErrorReceived subscribers, whoever asked.
pub struct StatusReporter {
    handle: Arc<DeviceHandle>,
    gate: Mutex<()>,
    notifications: NotificationSender,
}

impl StatusReporter {
    pub(crate) fn new(handle: Arc<DeviceHandle>, notifications: NotificationSender) -> Self {
        Self {
            handle,
            gate: Mutex::new(()),
            notifications,
        }
    }

    pub fn clear_and_snapshot(&self) -> Result<(LineErrorSet, QueueStatus), DeviceError> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.handle.ensure_live()?;
        let received = self.handle.received();
        let (errors, stat) = self.handle.device().clear_error()?;
        let buffered = received.len() as u32;
        drop(received);
        if !errors.is_empty() {
            log::warn!("{}: line errors {:?}", self.handle.name(), errors);
            self.notifications.send(SerialEvent::ErrorReceived { errors });
        }
        Ok((
            errors,
            QueueStatus {
                in_queue: stat.in_queue.saturating_add(buffered),
                out_queue: stat.out_queue,
                hold: stat.hold,
            },
        ))
    }

    /// Queue depths without touching the error latch. Input counts the
    /// receive buffer as well as the device queue.
    pub fn queue_status(&self) -> Result<QueueStatus, DeviceError> {
        self.handle.ensure_live()?;
        let received = self.handle.received();
        let stat = self.handle.device().comm_status()?;
        let buffered = received.len() as u32;
        Ok(QueueStatus {
            in_queue: stat.in_queue.saturating_add(buffered),
            out_queue: stat.out_queue,
            hold: stat.hold,
        })
    }
}
