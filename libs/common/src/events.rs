use tokio::sync::broadcast;

/// Platform lifecycle events delivered to registered subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new container is serving a domain; stale proxy targets for the
    /// domain must be dropped.
    ContainerDeployed {
        domain: String,
        container_id: String,
    },
    /// The config file was re-read; routes may have been added or removed.
    ConfigReloaded,
}

/// Broadcast bus for [`Event`]s.
///
/// Delivery is best-effort: slow subscribers that fall behind the channel
/// capacity miss events (`RecvError::Lagged`) and should resynchronise by
/// treating the lag as a full refresh.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Returns the number of
    /// subscribers that received it.
    pub fn publish(&self, event: Event) -> usize {
        let receivers = self.tx.send(event.clone()).unwrap_or(0);
        tracing::debug!(?event, receivers, "published event");
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
