//! Asynchronous event fan-out
//!
//! Every listener gets its own bounded queue drained by a dedicated task, so
//! a listener sees events in the order they were emitted while listeners
//! never wait on each other. Each delivery runs in its own spawned task: a
//! listener that panics is logged and the next event is still delivered.
//! Emitting never blocks; if a listener's queue is full the event is
//! dropped for that listener.

use log::{debug, error, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::config::AuthConfig;
use crate::core::events::{AuthEvent, AuthListener};

/// Deliveries queued or running, used by `flush`
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct ListenerQueue {
    name: String,
    sender: mpsc::Sender<AuthEvent>,
}

/// Fans events out to registered listeners
pub struct EventDispatcher {
    queues: RwLock<Vec<ListenerQueue>>,
    /// Maximum number of events waiting per listener
    queue_capacity: usize,
    in_flight: Arc<InFlight>,
}

impl EventDispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
            queue_capacity: queue_capacity.max(1),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.max_queued_events)
    }

    /// Register a listener. Must be called from within a Tokio runtime.
    pub fn subscribe(&self, listener: Arc<dyn AuthListener>) {
        let (sender, mut receiver) = mpsc::channel::<AuthEvent>(self.queue_capacity);
        let name = listener.name().to_string();
        let in_flight = Arc::clone(&self.in_flight);
        let worker_name = name.clone();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let listener = Arc::clone(&listener);
                let kind = event.kind;
                let outcome = tokio::spawn(async move { listener.on_event(&event).await }).await;

                if let Err(e) = outcome {
                    if e.is_panic() {
                        error!("Listener '{}' panicked while handling {} event", worker_name, kind);
                    } else {
                        warn!("Listener '{}' delivery for {} event cancelled", worker_name, kind);
                    }
                }
                in_flight.end();
            }
            debug!("Listener '{}' worker stopped", worker_name);
        });

        let mut queues = match self.queues.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queues.push(ListenerQueue { name, sender });
    }

    /// Queue an event for every listener without waiting for delivery
    pub fn emit(&self, event: AuthEvent) {
        let queues = match self.queues.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for queue in queues.iter() {
            self.in_flight.begin();
            match queue.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.in_flight.end();
                    warn!(
                        "Listener '{}' queue full ({} events), dropping {} event",
                        queue.name, self.queue_capacity, event.kind
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.in_flight.end();
                    warn!("Listener '{}' is gone, dropping {} event", queue.name, event.kind);
                }
            }
        }
    }

    /// Wait until every event emitted so far has been handled
    pub async fn flush(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        match self.queues.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliveries queued or running right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }
}

/// Shared dispatcher that can be accessed by multiple components
pub type SharedDispatcher = Arc<EventDispatcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::{Device, Identity};
    use crate::core::events::{AuthEventKind, FnListener};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    fn event(kind: AuthEventKind, token: &str) -> AuthEvent {
        AuthEvent::new(kind, Identity::new(1, "alice", Device::Web), token)
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AuthListener for Recorder {
        async fn on_event(&self, event: &AuthEvent) {
            self.seen.lock().unwrap().push(event.token.clone());
        }
    }

    struct Panicker;

    #[async_trait]
    impl AuthListener for Panicker {
        async fn on_event(&self, _event: &AuthEvent) {
            panic!("listener failure");
        }

        fn name(&self) -> &str {
            "panicker"
        }
    }

    #[tokio::test]
    async fn test_per_listener_order() {
        let dispatcher = EventDispatcher::new(100);
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        dispatcher.subscribe(recorder.clone());

        for i in 0..20 {
            dispatcher.emit(event(AuthEventKind::Login, &format!("t{}", i)));
        }
        dispatcher.flush().await;

        let expected: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        assert_eq!(*recorder.seen.lock().unwrap(), expected);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let dispatcher = EventDispatcher::new(10);
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        dispatcher.subscribe(Arc::new(Panicker));
        dispatcher.subscribe(recorder.clone());

        dispatcher.emit(event(AuthEventKind::Logout, "a"));
        dispatcher.emit(event(AuthEventKind::Logout, "b"));
        dispatcher.flush().await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert_eq!(dispatcher.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_slow_listener() {
        struct Slow;

        #[async_trait]
        impl AuthListener for Slow {
            async fn on_event(&self, _event: &AuthEvent) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        let dispatcher = EventDispatcher::new(10);
        dispatcher.subscribe(Arc::new(Slow));

        let started = std::time::Instant::now();
        dispatcher.emit(event(AuthEventKind::Refresh, "x"));
        assert!(started.elapsed() < Duration::from_millis(100));

        dispatcher.flush().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_fn_listener() {
        let dispatcher = EventDispatcher::new(10);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        dispatcher.subscribe(Arc::new(FnListener::new("counter", move |_e: &AuthEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        dispatcher.emit(event(AuthEventKind::Expired, "e"));
        dispatcher.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_without_listeners() {
        let dispatcher = EventDispatcher::new(1);
        dispatcher.emit(event(AuthEventKind::Login, "nobody-listens"));
        dispatcher.flush().await;
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
