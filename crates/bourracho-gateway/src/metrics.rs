//! Prometheus metrics for the command path and the live hub.
//!
//! - `bourracho_commands_total{command, result}` - commands by outcome
//!   (`accepted` or the rejection code)
//! - `bourracho_events_published_total{event}` - events handed to the hub
//! - `bourracho_subscribers_dropped_total{reason}` - subscribers cut off
//! - `bourracho_active_conversations` / `bourracho_subscribers` - live gauges

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use crate::dispatcher::DeliveryError;

/// Owned registry so several servers (or tests) in one process never share
/// counters.
pub struct Metrics {
    registry: Registry,
    commands: IntCounterVec,
    events_published: IntCounterVec,
    subscribers_dropped: IntCounterVec,
    active_conversations: IntGauge,
    subscribers: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("bourracho_commands_total", "Commands processed by outcome"),
            &["command", "result"],
        )?;
        let events_published = IntCounterVec::new(
            Opts::new("bourracho_events_published_total", "Domain events published"),
            &["event"],
        )?;
        let subscribers_dropped = IntCounterVec::new(
            Opts::new(
                "bourracho_subscribers_dropped_total",
                "Live subscribers dropped by the hub",
            ),
            &["reason"],
        )?;
        let active_conversations = IntGauge::new(
            "bourracho_active_conversations",
            "Conversations with at least one live subscriber",
        )?;
        let subscribers = IntGauge::new("bourracho_subscribers", "Live subscribers")?;

        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(subscribers_dropped.clone()))?;
        registry.register(Box::new(active_conversations.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        Ok(Self {
            registry,
            commands,
            events_published,
            subscribers_dropped,
            active_conversations,
            subscribers,
        })
    }

    /// `result` is `accepted` or a rejection code such as `forbidden`.
    #[inline]
    pub fn record_command(&self, command: &str, result: &str) {
        self.commands.with_label_values(&[command, result]).inc();
    }

    pub fn command_count(&self, command: &str, result: &str) -> u64 {
        self.commands.with_label_values(&[command, result]).get()
    }

    #[inline]
    pub fn record_published(&self, event: &str) {
        self.events_published.with_label_values(&[event]).inc();
    }

    pub fn published_count(&self, event: &str) -> u64 {
        self.events_published.with_label_values(&[event]).get()
    }

    #[inline]
    pub fn record_dropped(&self, reason: DeliveryError) {
        self.subscribers_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn dropped_count(&self, reason: DeliveryError) -> u64 {
        self.subscribers_dropped
            .with_label_values(&[reason.as_str()])
            .get()
    }

    pub fn set_live(&self, conversations: usize, subscribers: usize) {
        self.active_conversations.set(conversations as i64);
        self.subscribers.set(subscribers as i64);
    }

    /// Encode every metric in the Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        match String::from_utf8(buffer) {
            Ok(text) => text,
            Err(e) => {
                error!("Metrics were not valid UTF-8: {}", e);
                String::new()
            }
        }
    }
}
