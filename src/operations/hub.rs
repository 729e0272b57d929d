use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::types::StreamMessage;

/// Per-subscriber buffer. A subscriber that falls behind loses frames and
/// recovers them from the operation log by sequence number.
const SUBSCRIBER_BUFFER: usize = 1;

/// A frame as fanned out to live subscribers.
#[derive(Debug, Clone)]
pub struct HubFrame {
    pub sequence: i64,
    pub message: StreamMessage,
}

pub struct Subscription {
    pub id: u64,
    pub operation_id: String,
    pub receiver: mpsc::Receiver<HubFrame>,
}

/// Live WebSocket subscribers keyed by operation id.
#[derive(Default)]
pub struct SubscriberHub {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<(u64, mpsc::Sender<HubFrame>)>>>,
}

impl SubscriberHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, operation_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(operation_id.to_string())
            .or_default()
            .push((id, tx));

        Subscription {
            id,
            operation_id: operation_id.to_string(),
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut map = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = map.get_mut(&subscription.operation_id) {
            subs.retain(|(id, _)| *id != subscription.id);
            if subs.is_empty() {
                map.remove(&subscription.operation_id);
            }
        }
    }

    /// Non-blocking fan-out. Full buffers drop the frame; closed receivers
    /// are pruned.
    pub fn publish(&self, operation_id: &str, sequence: i64, message: &StreamMessage) {
        let mut closed = Vec::new();
        {
            let map = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            let Some(subs) = map.get(operation_id) else {
                return;
            };
            for (id, tx) in subs {
                let frame = HubFrame {
                    sequence,
                    message: message.clone(),
                };
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(frame) {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut map = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(subs) = map.get_mut(operation_id) {
                subs.retain(|(id, _)| !closed.contains(id));
                if subs.is_empty() {
                    map.remove(operation_id);
                }
            }
        }
    }

    /// Drops every sender for the operation so receivers observe the end.
    pub fn close(&self, operation_id: &str) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_id);
    }

    #[must_use]
    pub fn subscriber_count(&self, operation_id: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation_id)
            .map_or(0, Vec::len)
    }
}
