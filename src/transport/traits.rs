//! Transport trait abstraction for pluggable publish/subscribe backends

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use device_cloud_shared::TransportId;

/// Outbound side of a publish/subscribe connection
///
/// Inbound messages are delivered out of band as `(topic, payload)` pairs and
/// fed to [`crate::Client::handle_message`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a payload on `topic`, returning the id the transport assigned
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<TransportId>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
