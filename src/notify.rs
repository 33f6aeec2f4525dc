// =============================================================================
// Notification Dispatcher — priority-gated multi-channel fan-out
// =============================================================================
//
// Routing:
//   urgent/high -> WebSocket + email (+ SMS for external operations)
//   normal      -> WebSocket + email
//   low         -> WebSocket only
//
// Delivery is at-least-once toward idempotent sinks; a failing channel is
// logged and skipped.  A per-alert cooldown (keyed by the notification's
// dedupe key) suppresses repeats.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

/// What a notification is about; drives channel routing and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    OrderUpdate,
    ExternalOperation,
    HealthAlert,
    System,
}

/// Transport channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    WebSocket,
    Email,
    Sms,
}

/// One notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub category: Category,
    /// Cooldown key; repeats under the same key are suppressed while the
    /// cooldown holds.
    pub dedupe_key: String,
    pub created_at: i64,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
        category: Category,
    ) -> Self {
        let title = title.into();
        Self {
            id: Uuid::new_v4().to_string(),
            dedupe_key: format!("{category:?}:{title}"),
            title,
            body: body.into(),
            priority,
            category,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = key.into();
        self
    }
}

/// Channels a notification is routed to.
pub fn channels_for(priority: Priority, category: Category) -> Vec<Channel> {
    match priority {
        Priority::Urgent | Priority::High => {
            let mut channels = vec![Channel::WebSocket, Channel::Email];
            if category == Category::ExternalOperation {
                channels.push(Channel::Sms);
            }
            channels
        }
        Priority::Normal => vec![Channel::WebSocket, Channel::Email],
        Priority::Low => vec![Channel::WebSocket],
    }
}

/// The Send(notification) capability a channel implements.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn channel(&self) -> Channel;
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// WebSocket sink: fans into the broadcast the API's `/ws` handler drains.
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    fn channel(&self) -> Channel {
        Channel::WebSocket
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        // No receivers is fine: nobody is watching the stream right now.
        let _ = self.tx.send(notification.clone());
        Ok(())
    }
}

/// Stand-in sink for externally-delivered channels (email/SMS relays are
/// separate services reached through this capability).
pub struct RelaySink {
    channel: Channel,
    label: &'static str,
}

impl RelaySink {
    pub fn email() -> Self {
        Self {
            channel: Channel::Email,
            label: "email",
        }
    }

    pub fn sms() -> Self {
        Self {
            channel: Channel::Sms,
            label: "sms",
        }
    }
}

#[async_trait]
impl NotificationSink for RelaySink {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            channel = self.label,
            title = %notification.title,
            priority = ?notification.priority,
            "notification handed to relay"
        );
        Ok(())
    }
}

/// Per-dispatcher counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_disabled: u64,
    pub delivery_failures: u64,
}

/// Routes notifications to channel sinks with per-alert cooldown.
pub struct NotificationDispatcher {
    enabled: bool,
    cooldown_ms: i64,
    sinks: HashMap<Channel, Arc<dyn NotificationSink>>,
    last_sent: Mutex<HashMap<String, i64>>,
    stats: Mutex<DispatchStats>,
}

impl NotificationDispatcher {
    pub fn new(
        enabled: bool,
        cooldown_ms: i64,
        sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> Self {
        let sinks = sinks.into_iter().map(|s| (s.channel(), s)).collect();
        Self {
            enabled,
            cooldown_ms,
            sinks,
            last_sent: Mutex::new(HashMap::new()),
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    /// Dispatch one notification to its routed channels. Returns the
    /// channels actually delivered to.
    pub async fn dispatch(&self, notification: &Notification) -> Vec<Channel> {
        if !self.enabled {
            self.stats.lock().suppressed_disabled += 1;
            return Vec::new();
        }

        // Cooldown gate.
        {
            let mut last = self.last_sent.lock();
            if let Some(&sent_at) = last.get(&notification.dedupe_key) {
                if notification.created_at - sent_at < self.cooldown_ms {
                    self.stats.lock().suppressed_cooldown += 1;
                    debug!(
                        key = %notification.dedupe_key,
                        "notification suppressed by cooldown"
                    );
                    return Vec::new();
                }
            }
            last.insert(notification.dedupe_key.clone(), notification.created_at);
        }

        let mut delivered = Vec::new();
        for channel in channels_for(notification.priority, notification.category) {
            let Some(sink) = self.sinks.get(&channel) else {
                continue;
            };
            match sink.deliver(notification).await {
                Ok(()) => delivered.push(channel),
                Err(e) => {
                    self.stats.lock().delivery_failures += 1;
                    warn!(channel = ?channel, error = %e, "notification delivery failed");
                }
            }
        }

        self.stats.lock().dispatched += 1;
        delivered
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSink {
        channel: Channel,
        count: AtomicU64,
        fail: bool,
    }

    impl CountingSink {
        fn new(channel: Channel) -> Arc<Self> {
            Arc::new(Self {
                channel,
                count: AtomicU64::new(0),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn deliver(&self, _notification: &Notification) -> Result<()> {
            if self.fail {
                anyhow::bail!("injected failure");
            }
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn routing_table() {
        assert_eq!(
            channels_for(Priority::Low, Category::System),
            vec![Channel::WebSocket]
        );
        assert_eq!(
            channels_for(Priority::Normal, Category::OrderUpdate),
            vec![Channel::WebSocket, Channel::Email]
        );
        assert_eq!(
            channels_for(Priority::High, Category::OrderUpdate),
            vec![Channel::WebSocket, Channel::Email]
        );
        // SMS joins only for external operations at urgent/high priority.
        assert_eq!(
            channels_for(Priority::Urgent, Category::ExternalOperation),
            vec![Channel::WebSocket, Channel::Email, Channel::Sms]
        );
        assert_eq!(
            channels_for(Priority::Normal, Category::ExternalOperation),
            vec![Channel::WebSocket, Channel::Email]
        );
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_sinks() {
        let ws = CountingSink::new(Channel::WebSocket);
        let email = CountingSink::new(Channel::Email);
        let dispatcher = NotificationDispatcher::new(
            true,
            60_000,
            vec![ws.clone(), email.clone()],
        );

        let n = Notification::new("fill", "order filled", Priority::Normal, Category::OrderUpdate);
        let delivered = dispatcher.dispatch(&n).await;
        assert_eq!(delivered, vec![Channel::WebSocket, Channel::Email]);
        assert_eq!(ws.count.load(Ordering::Relaxed), 1);
        assert_eq!(email.count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeats() {
        let ws = CountingSink::new(Channel::WebSocket);
        let dispatcher = NotificationDispatcher::new(true, 60_000, vec![ws.clone()]);

        let first = Notification::new("alert", "x", Priority::Low, Category::HealthAlert);
        assert!(!dispatcher.dispatch(&first).await.is_empty());

        // Same dedupe key, inside the window.
        let repeat = Notification::new("alert", "x", Priority::Low, Category::HealthAlert);
        assert!(dispatcher.dispatch(&repeat).await.is_empty());
        assert_eq!(dispatcher.stats().suppressed_cooldown, 1);

        // Past the window: goes through.
        let mut late = Notification::new("alert", "x", Priority::Low, Category::HealthAlert);
        late.created_at = first.created_at + 61_000;
        assert!(!dispatcher.dispatch(&late).await.is_empty());
        assert_eq!(ws.count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn disabled_dispatcher_drops_everything() {
        let ws = CountingSink::new(Channel::WebSocket);
        let dispatcher = NotificationDispatcher::new(false, 0, vec![ws.clone()]);
        let n = Notification::new("x", "y", Priority::Urgent, Category::System);
        assert!(dispatcher.dispatch(&n).await.is_empty());
        assert_eq!(ws.count.load(Ordering::Relaxed), 0);
        assert_eq!(dispatcher.stats().suppressed_disabled, 1);
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let ws = CountingSink::new(Channel::WebSocket);
        let email = Arc::new(CountingSink {
            channel: Channel::Email,
            count: AtomicU64::new(0),
            fail: true,
        });
        let dispatcher = NotificationDispatcher::new(true, 0, vec![ws.clone(), email]);

        let n = Notification::new("x", "y", Priority::Normal, Category::OrderUpdate);
        let delivered = dispatcher.dispatch(&n).await;
        assert_eq!(delivered, vec![Channel::WebSocket]);
        assert_eq!(dispatcher.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn broadcast_sink_tolerates_no_receivers() {
        let (tx, _) = broadcast::channel(8);
        let sink = BroadcastSink::new(tx);
        let n = Notification::new("x", "y", Priority::Low, Category::System);
        sink.deliver(&n).await.unwrap();
    }
}
