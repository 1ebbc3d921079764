//! The hub: ingress queue, subscriber registry, dispatch worker.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::types::{
    ClientId, EntityEvent, HubConfig, SubscriberHandle, SubscriptionConfig, SubscriptionFilter,
};

/// Internal per-subscriber state.
struct Subscriber {
    filter: SubscriptionFilter,
    sender: Sender<EntityEvent>,
    /// Messages dropped for this subscriber because its buffer was full.
    missed: Arc<AtomicU64>,
}

type Registry = Arc<RwLock<HashMap<ClientId, Subscriber>>>;

/// Broadcasts committed entity mutations to live subscribers.
///
/// An owned value with an explicit lifecycle: construct, [`start`], use,
/// [`stop`]. Writers call [`publish`], which never blocks: if the
/// ingress queue is full the event is dropped and counted. The dispatch
/// worker fans each event out with non-blocking sends, so one stalled
/// subscriber cannot delay the others.
///
/// [`start`]: Hub::start
/// [`stop`]: Hub::stop
/// [`publish`]: Hub::publish
pub struct Hub {
    subscribers: Registry,

    ingress_tx: Sender<EntityEvent>,
    /// Consumed by `start`; a hub runs one dispatch cycle.
    ingress_rx: Mutex<Option<Receiver<EntityEvent>>>,

    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,

    worker: Mutex<Option<JoinHandle<()>>>,
    dropped_publishes: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (ingress_tx, ingress_rx) = bounded(config.ingress_capacity);
        let (shutdown_tx, shutdown_rx) = bounded(1);

        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            shutdown_tx,
            shutdown_rx,
            worker: Mutex::new(None),
            dropped_publishes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the dispatch worker. No-op if already started.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let ingress_rx = match self.ingress_rx.lock().take() {
            Some(rx) => rx,
            None => return, // already ran its cycle
        };

        let subscribers = Arc::clone(&self.subscribers);
        let shutdown_rx = self.shutdown_rx.clone();

        *worker = Some(std::thread::spawn(move || {
            dispatch_loop(ingress_rx, shutdown_rx, subscribers);
        }));
    }

    /// Stop the dispatch worker and wait for it to exit. Idempotent.
    /// Undelivered ingress events are discarded; delivery is best-effort.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.try_send(());
            let _ = handle.join();
        }
    }

    /// Enqueue a committed mutation for fan-out. Never blocks and never
    /// fails: if the ingress queue is full the event is dropped and
    /// counted.
    pub fn publish(&self, event: EntityEvent) {
        match self.ingress_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped_publishes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %event.key, "ingress full, publish dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped_publishes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Register a subscriber with the default buffer and the given
    /// filter, under a fresh identifier.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> SubscriberHandle {
        self.subscribe_with(SubscriptionConfig::filtered(filter))
    }

    /// Register a subscriber. Re-using a client id replaces the previous
    /// registration; its handle observes channel closure.
    pub fn subscribe_with(&self, config: SubscriptionConfig) -> SubscriberHandle {
        let client_id = config.client_id.unwrap_or_else(ClientId::generate);
        let (sender, receiver) = bounded(config.buffer_size);
        let subscriber = Subscriber {
            filter: config.filter,
            sender,
            missed: Arc::new(AtomicU64::new(0)),
        };

        self.subscribers.write().insert(client_id.clone(), subscriber);

        SubscriberHandle {
            client_id,
            receiver,
        }
    }

    /// Deregister a subscriber and close its channel so blocked receivers
    /// unblock. Idempotent.
    pub fn unsubscribe(&self, client_id: &ClientId) {
        self.subscribers.write().remove(client_id);
    }

    /// Publishes dropped at the ingress queue.
    pub fn dropped_publishes(&self) -> u64 {
        self.dropped_publishes.load(Ordering::Relaxed)
    }

    /// Deliveries missed by one subscriber due to a full buffer.
    /// Zero for unknown subscribers.
    pub fn missed_deliveries(&self, client_id: &ClientId) -> u64 {
        self.subscribers
            .read()
            .get(client_id)
            .map(|s| s.missed.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

fn dispatch_loop(
    ingress_rx: Receiver<EntityEvent>,
    shutdown_rx: Receiver<()>,
    subscribers: Registry,
) {
    loop {
        crossbeam_channel::select! {
            recv(ingress_rx) -> msg => {
                let event = match msg {
                    Ok(event) => event,
                    Err(_) => break,
                };

                // Collect matching senders under the lock, send outside it.
                let targets: Vec<(Sender<EntityEvent>, Arc<AtomicU64>)> = {
                    let subs = subscribers.read();
                    subs.values()
                        .filter(|sub| sub.filter.matches(&event))
                        .map(|sub| (sub.sender.clone(), Arc::clone(&sub.missed)))
                        .collect()
                };

                for (sender, missed) in targets {
                    match sender.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            missed.fetch_add(1, Ordering::Relaxed);
                        }
                        // Receiver handle dropped without unsubscribing;
                        // registry cleanup happens on unsubscribe.
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityRecord, Kind, User};
    use std::time::Duration;

    fn user_event(email: &str) -> EntityEvent {
        EntityEvent::changed(
            User {
                email: email.into(),
                name: "Test".into(),
                ..Default::default()
            }
            .into_entity(),
        )
    }

    fn started_hub() -> Hub {
        let hub = Hub::new(HubConfig::default());
        hub.start();
        hub
    }

    #[test]
    fn test_subscribe_receive_unsubscribe() {
        let hub = started_hub();

        let handle = hub.subscribe(SubscriptionFilter::all());
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(user_event("carol@example.com"));

        let event = handle.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.key, "carol@example.com");
        assert_eq!(event.kind, Kind::User);

        hub.unsubscribe(&handle.client_id);
        assert_eq!(hub.subscriber_count(), 0);

        // Channel closes rather than hanging forever.
        assert!(handle.recv().is_err());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let hub = started_hub();
        let handle = hub.subscribe(SubscriptionFilter::all());

        hub.unsubscribe(&handle.client_id);
        hub.unsubscribe(&handle.client_id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_filtered_delivery() {
        let hub = started_hub();

        let keyed = hub.subscribe(SubscriptionFilter::key("a@b.c"));
        let all = hub.subscribe(SubscriptionFilter::all());

        hub.publish(user_event("x@y.z"));
        hub.publish(user_event("a@b.c"));

        // The keyed subscriber only sees its key.
        let event = keyed.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.key, "a@b.c");
        assert!(keyed.try_recv().is_err());

        // The unfiltered subscriber sees both, in publish order.
        let first = all.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = all.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.key, "x@y.z");
        assert_eq!(second.key, "a@b.c");
    }

    #[test]
    fn test_slow_subscriber_does_not_block_others() {
        let hub = started_hub();

        // This subscriber never drains its 2-slot buffer.
        let stalled = hub.subscribe_with(SubscriptionConfig {
            buffer_size: 2,
            ..Default::default()
        });
        let healthy = hub.subscribe_with(SubscriptionConfig {
            buffer_size: 64,
            ..Default::default()
        });

        for i in 0..20 {
            hub.publish(user_event(&format!("user{}@example.com", i)));
        }

        // The healthy subscriber sees all 20 despite the stalled one.
        for _ in 0..20 {
            healthy.recv_timeout(Duration::from_secs(1)).unwrap();
        }

        // Let the dispatcher finish the final fan-out before counting.
        std::thread::sleep(Duration::from_millis(50));

        // The stalled subscriber stays registered; its overflow is counted.
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.missed_deliveries(&stalled.client_id), 18);
    }

    #[test]
    fn test_publish_never_blocks_when_stopped() {
        let hub = Hub::new(HubConfig { ingress_capacity: 4 });
        // Never started: ingress fills, then publishes drop.

        for i in 0..10 {
            hub.publish(user_event(&format!("user{}@example.com", i)));
        }
        assert_eq!(hub.dropped_publishes(), 6);
    }

    #[test]
    fn test_stop_joins_worker() {
        let hub = started_hub();
        let handle = hub.subscribe(SubscriptionFilter::all());

        hub.publish(user_event("a@b.c"));
        handle.recv_timeout(Duration::from_secs(1)).unwrap();

        hub.stop();
        hub.stop(); // idempotent
    }

    #[test]
    fn test_resubscribe_replaces() {
        let hub = started_hub();

        let config = || SubscriptionConfig {
            client_id: Some(ClientId::from("client-1")),
            ..Default::default()
        };
        let first = hub.subscribe_with(config());
        let second = hub.subscribe_with(config());
        assert_eq!(hub.subscriber_count(), 1);

        // The replaced handle observes closure.
        assert!(first.recv_timeout(Duration::from_millis(100)).is_err());

        hub.publish(user_event("a@b.c"));
        assert!(second.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
