use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use bourracho_types::events::DomainEvent;

use crate::metrics::Metrics;

/// Why a subscriber was dropped. Local to the hub; never reported to the
/// command that produced the event.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue full")]
    QueueFull,

    #[error("subscriber connection closed")]
    Closed,

    #[error("socket write timed out")]
    Timeout,

    #[error("user left the conversation")]
    Left,
}

impl DeliveryError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::Left => "left",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Events buffered per subscriber before it is considered unresponsive.
    pub queue_capacity: usize,
    /// Upper bound on a single socket write in the connection loop.
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// An event queued for one subscriber, serialized once per publish.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Arc<DomainEvent>,
    pub json: Arc<str>,
}

/// Outcome of one [`Dispatcher::publish`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: Vec<(Uuid, DeliveryError)>,
}

struct Subscriber {
    user_id: String,
    tx: mpsc::Sender<Delivery>,
}

/// Per-conversation registry of live connections.
///
/// `publish` never blocks: each subscriber owns a bounded queue drained by
/// its connection task. A subscriber whose queue is full or closed is
/// removed, which ends its stream without affecting anyone else.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    metrics: Option<Arc<Metrics>>,

    /// conversation_id -> (conn_id -> subscriber)
    subscribers: RwLock<HashMap<String, HashMap<Uuid, Subscriber>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::build(config, None)
    }

    /// A dispatcher that reports publishes, drops and live gauges.
    pub fn with_metrics(config: DispatcherConfig, metrics: Arc<Metrics>) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: DispatcherConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                metrics,
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.inner.metrics.as_ref()
    }

    /// Register a connection for a conversation. Events published after this
    /// call are queued on the returned subscription; dropping it unregisters.
    pub fn subscribe(&self, conversation_id: &str, user_id: &str) -> Subscription {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));

        match self.inner.subscribers.write() {
            Ok(mut subs) => {
                subs.entry(conversation_id.to_string()).or_default().insert(
                    conn_id,
                    Subscriber {
                        user_id: user_id.to_string(),
                        tx,
                    },
                );
                self.inner.refresh_gauges(&subs);
            }
            Err(e) => error!("subscriber registry poisoned: {}", e),
        }

        debug!(
            "{} subscribed to {} (conn {})",
            user_id, conversation_id, conn_id
        );

        Subscription {
            conn_id,
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Queue an event for every current subscriber of its conversation.
    pub fn publish(&self, event: DomainEvent) -> DeliveryReport {
        let json: Arc<str> = match serde_json::to_string(&event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.kind(), e);
                return DeliveryReport::default();
            }
        };
        let conversation_id = event.conversation_id().to_string();
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_published(event.kind());
        }
        let delivery = Delivery {
            event: Arc::new(event),
            json,
        };

        let mut report = DeliveryReport::default();
        {
            let subs = match self.inner.subscribers.read() {
                Ok(subs) => subs,
                Err(e) => {
                    error!("subscriber registry poisoned: {}", e);
                    return report;
                }
            };
            let Some(conn_map) = subs.get(&conversation_id) else {
                return report;
            };

            for (conn_id, sub) in conn_map {
                match sub.tx.try_send(delivery.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            "Subscriber {} ({}) on {} is not draining, dropping it",
                            sub.user_id, conn_id, conversation_id
                        );
                        report.dropped.push((*conn_id, DeliveryError::QueueFull));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        report.dropped.push((*conn_id, DeliveryError::Closed));
                    }
                }
            }
        }

        if !report.dropped.is_empty() {
            if let Some(metrics) = &self.inner.metrics {
                for (_, reason) in &report.dropped {
                    metrics.record_dropped(*reason);
                }
            }
            let ids: Vec<Uuid> = report.dropped.iter().map(|(id, _)| *id).collect();
            self.inner.remove(&conversation_id, &ids);
        }

        debug!(
            "{} on {} queued for {} subscriber(s)",
            delivery.event.kind(),
            conversation_id,
            report.delivered
        );
        report
    }

    /// Drop every live subscription `user_id` holds on a conversation. Their
    /// streams end once already-queued events are drained. Returns how many
    /// were removed.
    pub fn unsubscribe_user(&self, conversation_id: &str, user_id: &str) -> usize {
        let mut subs = match self.inner.subscribers.write() {
            Ok(subs) => subs,
            Err(e) => {
                error!("subscriber registry poisoned: {}", e);
                return 0;
            }
        };
        let Some(conn_map) = subs.get_mut(conversation_id) else {
            return 0;
        };
        let before = conn_map.len();
        conn_map.retain(|_, sub| sub.user_id != user_id);
        let removed = before - conn_map.len();
        if conn_map.is_empty() {
            subs.remove(conversation_id);
        }
        self.inner.refresh_gauges(&subs);

        if removed > 0 {
            if let Some(metrics) = &self.inner.metrics {
                for _ in 0..removed {
                    metrics.record_dropped(DeliveryError::Left);
                }
            }
            debug!(
                "Dropped {} subscription(s) of {} on {}",
                removed, user_id, conversation_id
            );
        }
        removed
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .map(|subs| subs.get(conversation_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    /// Live subscriptions across every conversation.
    pub fn total_subscribers(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .map(|subs| subs.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    /// Number of conversations with at least one live subscriber.
    pub fn active_conversations(&self) -> usize {
        self.inner.subscribers.read().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl DispatcherInner {
    fn remove(&self, conversation_id: &str, conn_ids: &[Uuid]) {
        let mut subs = match self.subscribers.write() {
            Ok(subs) => subs,
            Err(e) => {
                error!("subscriber registry poisoned: {}", e);
                return;
            }
        };
        if let Some(conn_map) = subs.get_mut(conversation_id) {
            for conn_id in conn_ids {
                conn_map.remove(conn_id);
            }
            if conn_map.is_empty() {
                subs.remove(conversation_id);
            }
        }
        self.refresh_gauges(&subs);
    }

    fn refresh_gauges(&self, subs: &HashMap<String, HashMap<Uuid, Subscriber>>) {
        if let Some(metrics) = &self.metrics {
            metrics.set_live(subs.len(), subs.values().map(HashMap::len).sum());
        }
    }
}

/// A live registration in the [`Dispatcher`]. Unregisters itself on drop.
pub struct Subscription {
    conn_id: Uuid,
    conversation_id: String,
    user_id: String,
    rx: mpsc::Receiver<Delivery>,
    registry: Weak<DispatcherInner>,
}

impl Subscription {
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next queued event. `None` once the hub has dropped this subscriber
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(&self.conversation_id, &[self.conn_id]);
            debug!(
                "{} unsubscribed from {} (conn {})",
                self.user_id, self.conversation_id, self.conn_id
            );
        }
    }
}
