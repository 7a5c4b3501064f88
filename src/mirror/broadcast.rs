//! In-process mirror for subscribers living in the same binary.

use super::{EventMirror, MirrorError, MirroredEvent};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Fans events out over a broadcast channel. Having no subscribers is not
/// an error; slow subscribers lag and skip.
#[derive(Clone)]
pub struct BroadcastMirror {
    sender: broadcast::Sender<MirroredEvent>,
}

impl BroadcastMirror {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirroredEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventMirror for BroadcastMirror {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn publish(&self, event: &MirroredEvent) -> Result<(), MirrorError> {
        // Err only means nobody is listening right now.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLogLine, GameEvent};

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let mirror = BroadcastMirror::new(4);
        let event = GameEvent::LogLine(EventLogLine {
            msg: "tick".to_string(),
        });

        assert!(mirror
            .publish(&MirroredEvent::new("t1", "s1", &event))
            .await
            .is_ok());
    }
}
