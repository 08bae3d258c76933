use crate::build::Build;

use serde::Serialize;
use tokio::sync::broadcast;

/// Per-subscriber buffer; a subscriber that lags behind this many events is
/// disconnected and must reconnect for a fresh snapshot.
const SUBSCRIBE_BUFFER_SIZE: usize = 256;

/// A build index delta, broadcast to all subscribers.
///
/// Serializes as `{"event": "upd", "build": {...}}`, the wire format of the
/// `/build-events` SSE endpoint.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "build", rename_all = "lowercase")]
pub enum BuildEvent {
    Upd(Build),
    Del(Build),
}

impl BuildEvent {
    pub fn build(&self) -> &Build {
        match self {
            BuildEvent::Upd(b) | BuildEvent::Del(b) => b,
        }
    }
}

/// Topic-less fan-out of build changes.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BuildEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBE_BUFFER_SIZE);
        Self { tx }
    }
}

impl EventBus {
    /// Publish to all current subscribers. Delivery is best-effort: with no
    /// subscribers the event is dropped.
    pub fn publish(&self, event: BuildEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildStatus, InitStatus};

    fn build(name: &str) -> Build {
        Build {
            name: name.into(),
            repo: "acme/svc".into(),
            target_branch: "main".into(),
            pr: None,
            git_commit: "a".repeat(40),
            image: "img:1".into(),
            created_at: None,
            init_status: InitStatus::Todo,
            init_status_timestamp: None,
            desired_replicas: 0,
            ready_replicas: 0,
            deleted: false,
            last_scaled_at: None,
            status: BuildStatus::Todo,
        }
    }

    #[test]
    fn wire_format() {
        let event = BuildEvent::Upd(build("b1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "upd");
        assert_eq!(json["build"]["name"], "b1");
        assert_eq!(json["build"]["status"], "todo");

        let event = BuildEvent::Del(build("b1"));
        assert_eq!(serde_json::to_value(&event).unwrap()["event"], "del");
    }

    #[tokio::test]
    async fn fan_out_to_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(BuildEvent::Upd(build("b1")));
        assert_eq!(a.recv().await.unwrap().build().name, "b1");
        assert_eq!(b.recv().await.unwrap().build().name, "b1");
    }
}
