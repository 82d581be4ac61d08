//! In-memory transport backed by a tokio channel

use super::traits::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use device_cloud_shared::TransportId;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// A publish as seen by whoever drains the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub transport_id: TransportId,
    pub topic: String,
    pub payload: Bytes,
}

/// Loopback transport: publishes land on an mpsc receiver
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundMessage>,
    next_id: AtomicU64,
}

impl ChannelTransport {
    /// Create the transport and the receiver its publishes are delivered to
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self {
            tx,
            next_id: AtomicU64::new(1),
        };
        (transport, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<TransportId> {
        let transport_id = TransportId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let message = OutboundMessage {
            transport_id,
            topic: topic.to_string(),
            payload,
        };

        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("channel transport closed"))?;
        debug!("Published {} on {}", transport_id, topic);
        Ok(transport_id)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_assigns_increasing_ids() {
        let (transport, mut rx) = ChannelTransport::new(4);

        let first = transport.publish("api/1", Bytes::from_static(b"{}")).await.unwrap();
        let second = transport.publish("api/2", Bytes::from_static(b"{}")).await.unwrap();
        assert!(second.0 > first.0);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.transport_id, first);
        assert_eq!(message.topic, "api/1");
    }

    #[tokio::test]
    async fn test_publish_fails_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new(1);
        drop(rx);

        assert!(transport.publish("api/1", Bytes::new()).await.is_err());
    }
}
