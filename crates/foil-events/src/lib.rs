use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Broadcast an event, returning the envelope that was sent so callers
    /// can also persist it.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) -> Envelope {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        let _ = self.tx.send(env.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("runs.created", &serde_json::json!({"id":"r1"}));
        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.kind, "runs.created");
        assert_eq!(env.payload["id"].as_str(), Some("r1"));
    }
}
