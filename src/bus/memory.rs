//! In-process message bus
//!
//! Fans broadcasts out to every live subscription of a topic through a
//! `tokio::sync::broadcast` channel. Subscribers that join after a broadcast
//! never see it, which matches the at-most-once behavior of the real bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BusChannel, BusError, BusMessage, ChannelConfig, MessageBus};

/// Per-topic buffer; slow subscribers lag and skip.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Delivery {
    origin: u64,
    message: BusMessage,
}

/// Topics with at least one open subscription.
#[derive(Default)]
struct Topics {
    senders: HashMap<String, broadcast::Sender<Delivery>>,
    #[cfg(test)]
    closes: HashMap<String, usize>,
    next_handle: u64,
}

/// Message bus living entirely inside this process.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<Topics>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open subscriptions on `name`.
    #[cfg(test)]
    pub fn subscriber_count(&self, name: &str) -> usize {
        let guard = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .senders
            .get(name)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// How many subscriptions on `name` have been closed so far.
    #[cfg(test)]
    pub fn close_count(&self, name: &str) -> usize {
        let guard = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        guard.closes.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn open(
        &self,
        name: &str,
        config: ChannelConfig,
    ) -> Result<Box<dyn BusChannel>, BusError> {
        let mut guard = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard
            .senders
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone();
        guard.next_handle += 1;
        let handle = guard.next_handle;
        drop(guard);

        tracing::debug!("Memory bus: joined {} (handle {})", name, handle);

        Ok(Box::new(MemoryChannel {
            name: name.to_string(),
            handle,
            config,
            rx: Some(tx.subscribe()),
            tx,
            topics: self.topics.clone(),
        }))
    }
}

struct MemoryChannel {
    name: String,
    handle: u64,
    config: ChannelConfig,
    tx: broadcast::Sender<Delivery>,
    /// `None` once closed.
    rx: Option<broadcast::Receiver<Delivery>>,
    topics: Arc<Mutex<Topics>>,
}

#[async_trait]
impl BusChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<(), BusError> {
        if self.rx.is_none() {
            return Err(BusError::Closed(self.name.clone()));
        }
        let delivery = Delivery {
            origin: self.handle,
            message: BusMessage {
                event: event.to_string(),
                payload,
            },
        };
        // No receivers left is not an error: the message is simply lost.
        let _ = self.tx.send(delivery);
        Ok(())
    }

    async fn recv(&mut self) -> Option<BusMessage> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(d) if d.origin == self.handle && !self.config.self_delivery => continue,
                Ok(d) => return Some(d.message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Memory bus: {} skipped {} messages", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        drop(rx);
        let mut guard = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let idle = guard
            .senders
            .get(&self.name)
            .is_some_and(|tx| tx.receiver_count() == 0);
        if idle {
            guard.senders.remove(&self.name);
        }
        #[cfg(test)]
        {
            *guard.closes.entry(self.name.clone()).or_insert(0) += 1;
        }
        tracing::debug!("Memory bus: left {} (handle {})", self.name, self.handle);
    }
}
