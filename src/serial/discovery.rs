use crate::device::{Backend, DeviceError, NativeBackend, SerialDeviceInfo};

/// Lists the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<SerialDeviceInfo>, DeviceError> {
    list_ports(&NativeBackend)
}

/// Lists the ports a backend can open, USB devices first.
pub fn list_ports(backend: &dyn Backend) -> Result<Vec<SerialDeviceInfo>, DeviceError> {
    let mut ports = backend.enumerate()?;
    ports.sort_by(|a, b| {
        let non_usb = |p: &SerialDeviceInfo| p.vid.is_none();
        non_usb(a).cmp(&non_usb(b)).then_with(|| a.port_name.cmp(&b.port_name))
    });
    log::debug!("Found {} serial ports", ports.len());
    for port in &ports {
        log::trace!("  {} -> {}", port.id, port.port_name);
    }
    Ok(ports)
}
