use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::cache::CacheSource;
use crate::sync::SyncMethod;

/// Sync lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// A sync resolved with data
  Fetched {
    model: String,
    method: SyncMethod,
    source: CacheSource,
  },
  /// A sync resolved with an error
  Failed {
    model: String,
    method: SyncMethod,
    error: String,
  },
}

/// Fan-out of sync events to any number of subscribers.
///
/// Subscribers that dropped their receiver are forgotten on the next emit.
#[derive(Default)]
pub struct EventBus {
  subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new subscriber
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.push(tx);
    }
    rx
  }

  pub fn emit(&self, event: SyncEvent) {
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fetched() -> SyncEvent {
    SyncEvent::Fetched {
      model: "users".into(),
      method: SyncMethod::Read,
      source: CacheSource::Network,
    }
  }

  #[tokio::test]
  async fn test_every_subscriber_receives_event() {
    let bus = EventBus::new();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    bus.emit(fetched());

    assert_eq!(a.recv().await, Some(fetched()));
    assert_eq!(b.recv().await, Some(fetched()));
  }

  #[test]
  fn test_dropped_subscriber_is_forgotten() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let _kept = bus.subscribe();
    drop(rx);

    bus.emit(fetched());
    assert_eq!(bus.subscriber_count(), 1);
  }
}
