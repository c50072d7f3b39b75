use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::types::{Counters, EventKind, Notification, SerialEvent};

/// Capacity of the broadcast event stream; slow receivers see `Lagged`.
const STREAM_CAPACITY: usize = 256;

pub type EventHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

/// Registered handlers plus the broadcast stream. Lives as long as the
/// facade so subscriptions survive close and reopen.
pub(crate) struct Subscribers {
    handlers: RwLock<Vec<Subscription>>,
    stream: broadcast::Sender<Notification>,
}

impl Subscribers {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            stream,
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, handler });
        log::debug!("Subscribed {:?} handler {:?}", kind, id);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|s| s.id != id);
        handlers.len() != before
    }

    pub fn stream(&self) -> broadcast::Receiver<Notification> {
        self.stream.subscribe()
    }

    fn matching(&self, kind: EventKind) -> Vec<EventHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }
}

/// Producer side of the notification queue. Sequence numbers are assigned
/// under the same lock as the send, so queue order matches numbering.
#[derive(Clone)]
pub(crate) struct NotificationSender {
    port_name: Arc<str>,
    inner: Arc<Mutex<(u64, mpsc::UnboundedSender<Notification>)>>,
}

impl NotificationSender {
    pub fn send(&self, event: SerialEvent) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.0 += 1;
        let notification = Notification {
            sequence: inner.0,
            timestamp: Utc::now(),
            event,
        };
        log::trace!("{}: queued {:?}", self.port_name, notification.event);
        inner.1.send(notification).is_ok()
    }
}

/// Thread delivering notifications to handlers in queue order.
pub(crate) struct Dispatcher {
    join: Option<JoinHandle<()>>,
    thread: ThreadId,
    exited: std_mpsc::Receiver<()>,
}

impl Dispatcher {
    pub fn start(
        port_name: &str,
        subscribers: Arc<Subscribers>,
        counters: Arc<Counters>,
    ) -> std::io::Result<(NotificationSender, Dispatcher)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let (exit_tx, exited) = std_mpsc::sync_channel(1);
        let name: Arc<str> = Arc::from(port_name);
        let thread_name = Arc::clone(&name);

        let join = thread::Builder::new()
            .name(format!("comport-dispatch-{}", port_name).to_lowercase())
            .spawn(move || {
                while let Some(notification) = rx.blocking_recv() {
                    deliver(&thread_name, &subscribers, &counters, notification);
                }
                log::debug!("{}: dispatcher drained", thread_name);
                let _ = exit_tx.send(());
            })?;

        let sender = NotificationSender {
            port_name: name,
            inner: Arc::new(Mutex::new((0, tx))),
        };
        let dispatcher = Dispatcher {
            thread: join.thread().id(),
            join: Some(join),
            exited,
        };
        Ok((sender, dispatcher))
    }

    /// Waits for the queue to drain once every sender is gone. A handler
    /// closing its own port runs on this thread, so that case is not waited on.
    pub fn finish(mut self, timeout: Duration) {
        if thread::current().id() == self.thread {
            return;
        }
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("Dispatcher still busy after {:?}, detaching it", timeout);
            }
        }
    }
}

fn deliver(
    port_name: &str,
    subscribers: &Subscribers,
    counters: &Counters,
    notification: Notification,
) {
    counters.record_event(&notification.event);
    for handler in subscribers.matching(notification.event.kind()) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&notification)));
        if outcome.is_err() {
            Counters::add(&counters.handler_panics, 1);
            log::error!(
                "{}: {:?} handler panicked",
                port_name,
                notification.event.kind()
            );
        }
    }
    // No receivers is fine.
    let _ = subscribers.stream.send(notification);
}
