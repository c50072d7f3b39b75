#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use comport_lib::{Notification, PortSettings, SerialEvent, SerialPort, VirtualBus};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two facades wired back to back through an in-memory null modem.
pub struct Pair {
    pub bus: VirtualBus,
    pub a: SerialPort,
    pub b: SerialPort,
}

pub fn open_pair() -> Pair {
    open_pair_with(PortSettings::default(), PortSettings::default())
}

pub fn open_pair_with(a_settings: PortSettings, b_settings: PortSettings) -> Pair {
    init_logging();
    let bus = VirtualBus::new();
    bus.create_pair("COM1", "COM2");
    let a = SerialPort::with_settings(Arc::new(bus.clone()), a_settings);
    let b = SerialPort::with_settings(Arc::new(bus.clone()), b_settings);
    a.open("COM1").expect("open COM1");
    b.open("COM2").expect("open COM2");
    Pair { bus, a, b }
}

/// Collects every notification of a port for later inspection.
pub fn record_events(port: &SerialPort) -> Arc<Mutex<Vec<SerialEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        comport_lib::EventKind::DataReceived,
        comport_lib::EventKind::PinChanged,
        comport_lib::EventKind::ErrorReceived,
        comport_lib::EventKind::TransmitEmpty,
    ] {
        let sink = Arc::clone(&seen);
        port.subscribe(kind, move |n: &Notification| {
            sink.lock().unwrap().push(n.event.clone());
        });
    }
    seen
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
