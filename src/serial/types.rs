//! Event, notification and statistics types shared by the engine
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::native::{HardwareEvent, HoldReasons, LineErrorSet, PinState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    Closed,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DataReceived,
    PinChanged,
    ErrorReceived,
    TransmitEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialEvent {
    /// `available` bytes are buffered; `event_char` is set when the
    /// configured event character was among them.
    DataReceived { available: usize, event_char: bool },
    /// One notification per wait cycle, however many lines moved.
    PinChanged { changed: HardwareEvent, pins: PinState },
    ErrorReceived { errors: LineErrorSet },
    TransmitEmpty,
}

impl SerialEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SerialEvent::DataReceived { .. } => EventKind::DataReceived,
            SerialEvent::PinChanged { .. } => EventKind::PinChanged,
            SerialEvent::ErrorReceived { .. } => EventKind::ErrorReceived,
            SerialEvent::TransmitEmpty => EventKind::TransmitEmpty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: SerialEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub in_queue: u32,
    pub out_queue: u32,
    pub hold: HoldReasons,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PortStatistics {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub data_received_events: u64,
    pub pin_changed_events: u64,
    pub error_events: u64,
    pub transmit_empty_events: u64,
    pub line_errors: u64,
    pub handler_panics: u64,
    pub last_fault: Option<String>,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub data_received_events: AtomicU64,
    pub pin_changed_events: AtomicU64,
    pub error_events: AtomicU64,
    pub transmit_empty_events: AtomicU64,
    pub line_errors: AtomicU64,
    pub handler_panics: AtomicU64,
    pub last_fault: Mutex<Option<String>>,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_event(&self, event: &SerialEvent) {
        let counter = match event.kind() {
            EventKind::DataReceived => &self.data_received_events,
            EventKind::PinChanged => &self.pin_changed_events,
            EventKind::ErrorReceived => &self.error_events,
            EventKind::TransmitEmpty => &self.transmit_empty_events,
        };
        Self::add(counter, 1);
        if let SerialEvent::ErrorReceived { errors } = event {
            Self::add(&self.line_errors, errors.iter().count() as u64);
        }
    }

    pub fn record_fault(&self, fault: &str) {
        if let Ok(mut last) = self.last_fault.lock() {
            *last = Some(fault.to_string());
        }
    }

    pub fn snapshot(&self) -> PortStatistics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PortStatistics {
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            data_received_events: load(&self.data_received_events),
            pin_changed_events: load(&self.pin_changed_events),
            error_events: load(&self.error_events),
            transmit_empty_events: load(&self.transmit_empty_events),
            line_errors: load(&self.line_errors),
            handler_panics: load(&self.handler_panics),
            last_fault: self.last_fault.lock().ok().and_then(|f| f.clone()),
        }
    }
}
