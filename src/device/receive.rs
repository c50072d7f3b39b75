//! Receive buffer the event loop drains the device input queue into.

use std::collections::VecDeque;

use super::{DeviceError, SerialDevice};

/// Upper bound on queue-depth re-reads in one drain.
const DRAIN_ROUNDS: usize = 64;

pub(crate) const DEFAULT_CAPACITY: usize = 4096;

/// Bytes already taken off the device, oldest first. Everything here
/// precedes whatever is still queued in the device.
#[derive(Debug)]
pub(crate) struct Received {
    data: VecDeque<u8>,
    capacity: usize,
}

impl Default for Received {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Received {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Moves up to `out.len()` buffered bytes into `out`.
    pub fn take(&mut self, out: &mut [u8]) -> usize {
        let n = self.data.len().min(out.len());
        for (slot, byte) in out.iter_mut().zip(self.data.drain(..n)) {
            *slot = byte;
        }
        n
    }

    /// Pulls whatever the device has queued until it reports nothing more or
    /// the buffer is full. Returns the number of bytes moved.
    pub fn fill_from(&mut self, device: &dyn SerialDevice) -> Result<usize, DeviceError> {
        let mut moved = 0;
        let mut chunk = Vec::new();
        for _ in 0..DRAIN_ROUNDS {
            let free = self.free();
            if free == 0 {
                break;
            }
            chunk.resize(free, 0);
            let pulled = pull(device, &mut chunk);
            let n = pulled.as_ref().map_or_else(|(n, _)| *n, |n| *n);
            self.data.extend(&chunk[..n]);
            moved += n;
            if let Err((_, e)) = pulled {
                return Err(e);
            }
            if n == 0 {
                break;
            }
        }
        Ok(moved)
    }
}

/// Reads only what the device already holds, so it never blocks. A failed
/// read still reports the bytes it moved; a cancellation is not a failure.
pub(crate) fn pull(
    device: &dyn SerialDevice,
    out: &mut [u8],
) -> Result<usize, (usize, DeviceError)> {
    let queued = device.comm_status().map_err(|e| (0, e))?.in_queue as usize;
    let n = queued.min(out.len());
    if n == 0 {
        return Ok(0);
    }
    let status = device.read(&mut out[..n]);
    match status.status {
        Ok(()) => Ok(status.information),
        Err(e) if e.is_aborted() => Ok(status.information),
        Err(e) => Err((status.information, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Backend, VirtualBus};

    #[test]
    fn test_fill_respects_capacity() {
        let bus = VirtualBus::new();
        bus.create_pair("COM1", "COM2");
        let a = bus.open("COM1").unwrap();
        let b = bus.open("COM2").unwrap();
        a.write(b"0123456789");

        let mut received = Received::with_capacity(4);
        assert_eq!(received.fill_from(b.as_ref()).unwrap(), 4);
        assert_eq!(b.comm_status().unwrap().in_queue, 6);

        let mut out = [0u8; 3];
        assert_eq!(received.take(&mut out), 3);
        assert_eq!(&out, b"012");
        assert_eq!(received.fill_from(b.as_ref()).unwrap(), 3);
        assert_eq!(received.len(), 4);

        let mut rest = [0u8; 8];
        assert_eq!(received.take(&mut rest), 4);
        assert_eq!(&rest[..4], b"3456");
    }
}
