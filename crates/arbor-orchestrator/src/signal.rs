//! Named signals awaited by EVENT_WAIT nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct Slot {
  payload: Option<Value>,
  notify: Arc<Notify>,
}

/// Delivers event payloads to waiting runs.
///
/// A signal sent before anyone waits is kept until the matching wait consumes
/// it. Each delivered payload is consumed exactly once.
#[derive(Default)]
pub struct SignalHub {
  slots: Mutex<HashMap<(String, String), Slot>>,
}

impl SignalHub {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliver `payload` for `event` to run `run_id`.
  pub fn signal(&self, run_id: &str, event: &str, payload: Value) {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    let slot = slots
      .entry((run_id.to_string(), event.to_string()))
      .or_default();
    slot.payload = Some(payload);
    slot.notify.notify_one();
    debug!(run_id = %run_id, event = %event, "signal_delivered");
  }

  /// Wait until `event` is signalled for `run_id` and take its payload.
  pub async fn wait(&self, run_id: &str, event: &str) -> Value {
    let key = (run_id.to_string(), event.to_string());
    loop {
      let notify = {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.clone()).or_default();
        if let Some(payload) = slot.payload.take() {
          slots.remove(&key);
          return payload;
        }
        slot.notify.clone()
      };
      notify.notified().await;
    }
  }

  /// Whether a payload is waiting to be consumed.
  pub fn is_pending(&self, run_id: &str, event: &str) -> bool {
    let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots
      .get(&(run_id.to_string(), event.to_string()))
      .is_some_and(|s| s.payload.is_some())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::time::Duration;

  #[tokio::test]
  async fn test_signal_before_wait_is_kept() {
    let hub = SignalHub::new();
    hub.signal("run", "approved", json!({ "by": "ops" }));
    assert!(hub.is_pending("run", "approved"));

    assert_eq!(hub.wait("run", "approved").await, json!({ "by": "ops" }));
    assert!(!hub.is_pending("run", "approved"));
  }

  #[tokio::test]
  async fn test_wait_wakes_on_signal() {
    let hub = Arc::new(SignalHub::new());
    let waiter = {
      let hub = hub.clone();
      tokio::spawn(async move { hub.wait("run", "approved").await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    hub.signal("run", "approved", json!(true));

    let payload = tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(payload, json!(true));
  }

  #[tokio::test]
  async fn test_signals_are_scoped_per_run() {
    let hub = SignalHub::new();
    hub.signal("other", "approved", json!(1));
    assert!(!hub.is_pending("run", "approved"));
  }
}
