//! Reply correlator - holds outbound publishes until the cloud answers them

use device_cloud_shared::state_machine::{
    is_valid_transition, IdentityEvent, PublishIdentity, PublishState, TransitionResult,
};
use device_cloud_shared::{now_ms, CorrelationKey, TransportId};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors raised when an acknowledgement cannot be matched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Message {0} not found; may be a duplicate reply")]
    DuplicateReply(CorrelationKey),

    #[error("Unknown transport id {0}")]
    UnknownTransportId(TransportId),
}

/// An outbound command waiting for its cloud reply
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    /// Id the transport assigned when the publish was submitted
    pub transport_id: TransportId,
    /// Position of this command inside the publish, starting at 1
    pub command_seq: u32,
    /// Semantic operation, e.g. `property.publish`
    pub command: String,
    pub description: String,
    pub timestamp_ms: u64,
    pub payload: Value,
}

impl PendingPublish {
    pub fn new(
        transport_id: TransportId,
        command_seq: u32,
        command: impl Into<String>,
        description: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            transport_id,
            command_seq,
            command: command.into(),
            description: description.into(),
            timestamp_ms: now_ms(),
            payload,
        }
    }
}

/// Reference to a tracked publish; goes stale once the entry is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublishHandle {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Tracked {
    publish: PendingPublish,
    identity: PublishIdentity,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Tracked>,
}

/// Topic bound to a transport id, kept until the transport accepts the publish
#[derive(Debug, Clone, Copy)]
struct Correlation {
    topic_seq: u64,
    recorded_ms: u64,
}

/// Arena of tracked publishes plus the two identity indices
#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_transport: HashMap<TransportId, Vec<PublishHandle>>,
    by_key: HashMap<CorrelationKey, PublishHandle>,
    topics: HashMap<TransportId, Correlation>,
    /// Accepts that arrived before their topic was assigned, with arrival time
    early_accepts: HashMap<TransportId, u64>,
}

impl Inner {
    fn insert(&mut self, tracked: Tracked) -> PublishHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.entry = Some(tracked);
        PublishHandle {
            index,
            generation: slot.generation,
        }
    }

    fn get_mut(&mut self, handle: PublishHandle) -> Option<&mut Tracked> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn get(&self, handle: PublishHandle) -> Option<&Tracked> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Take an entry out of the arena and both indices
    fn remove(&mut self, handle: PublishHandle) -> Option<Tracked> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let tracked = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        match tracked.identity.state() {
            PublishState::Sent { transport_id } => {
                if let Some(handles) = self.by_transport.get_mut(&transport_id) {
                    handles.retain(|h| *h != handle);
                    if handles.is_empty() {
                        self.by_transport.remove(&transport_id);
                    }
                }
            }
            PublishState::Acknowledged { key } | PublishState::Resolved { key } => {
                if self.by_key.get(&key) == Some(&handle) {
                    self.by_key.remove(&key);
                }
            }
        }

        Some(tracked)
    }

    /// Move one entry from the transport index to the key index
    fn promote(&mut self, handle: PublishHandle, topic_seq: u64) {
        let Some(tracked) = self.get_mut(handle) else {
            return;
        };
        let from = tracked.identity.state();

        match tracked.identity.process_event(IdentityEvent::TopicAssigned { topic_seq }) {
            TransitionResult::Promoted(key) => {
                debug_assert!(is_valid_transition(from, tracked.identity.state()));
                if let Some(previous) = self.by_key.insert(key, handle) {
                    if previous != handle {
                        warn!("[TRACKER] Key {} reused; evicting older publish", key);
                        if let Some(slot) = self.slots.get_mut(previous.index) {
                            if slot.generation == previous.generation && slot.entry.take().is_some() {
                                slot.generation = slot.generation.wrapping_add(1);
                                self.free.push(previous.index);
                            }
                        }
                    }
                }
            }
            TransitionResult::Unchanged(_) => {}
            other => warn!("[TRACKER] Unexpected promotion result {:?}", other),
        }
    }

    /// Promote every entry still waiting on `transport_id`
    fn promote_all(&mut self, transport_id: TransportId, topic_seq: u64) -> usize {
        let handles = self.by_transport.remove(&transport_id).unwrap_or_default();
        for handle in &handles {
            self.promote(*handle, topic_seq);
        }
        handles.len()
    }
}

/// Tracks outbound publishes until their cloud reply arrives
///
/// Entries are first indexed by transport id. Once the topic they were sent
/// on is known they are re-indexed by [`CorrelationKey`] in the same critical
/// section. Entries never expire on their own; see [`super::ReplyTimeout`].
#[derive(Debug, Default)]
pub struct ReplyCorrelator {
    inner: Mutex<Inner>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publish under its transport id
    pub async fn track(&self, publish: PendingPublish) -> PublishHandle {
        let mut inner = self.inner.lock().await;
        let transport_id = publish.transport_id;
        let identity = PublishIdentity::new(transport_id, publish.command_seq);
        let handle = inner.insert(Tracked { publish, identity });

        // Topic may already be known if the correlation raced ahead of us
        match inner.topics.get(&transport_id).copied() {
            Some(correlation) => inner.promote(handle, correlation.topic_seq),
            None => inner
                .by_transport
                .entry(transport_id)
                .or_default()
                .push(handle),
        }

        handle
    }

    /// Bind a transport id to the topic sequence its reply will use
    ///
    /// Promotes every entry sent under that id. Repeated calls for the same
    /// id are no-ops; the first topic wins. Returns the number promoted.
    ///
    /// If the transport already accepted this id, the entries are promoted
    /// but no topic record is kept, since no accept will come to remove it.
    pub async fn assign_correlation(&self, transport_id: TransportId, topic_seq: u64) -> usize {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.topics.get(&transport_id).copied() {
            if existing.topic_seq != topic_seq {
                warn!(
                    "[TRACKER] {} already bound to topic {}, ignoring {}",
                    transport_id, existing.topic_seq, topic_seq
                );
            }
            return 0;
        }

        if inner.early_accepts.remove(&transport_id).is_none() {
            inner.topics.insert(
                transport_id,
                Correlation {
                    topic_seq,
                    recorded_ms: now_ms(),
                },
            );
        }
        let promoted = inner.promote_all(transport_id, topic_seq);
        debug!(
            "[TRACKER] {} -> topic {} ({} promoted)",
            transport_id, topic_seq, promoted
        );
        promoted
    }

    /// Remove and return the publish a reply refers to
    pub async fn resolve(
        &self,
        topic_seq: u64,
        command_seq: u32,
    ) -> Result<PendingPublish, TrackerError> {
        let key = CorrelationKey::new(topic_seq, command_seq);
        let mut inner = self.inner.lock().await;

        let handle = inner
            .by_key
            .get(&key)
            .copied()
            .ok_or(TrackerError::DuplicateReply(key))?;

        let mut tracked = inner
            .remove(handle)
            .ok_or(TrackerError::DuplicateReply(key))?;
        tracked.identity.process_event(IdentityEvent::ReplyMatched);

        Ok(tracked.publish)
    }

    /// Remove and return the topic bound to a transport id
    ///
    /// An unknown id is remembered so that a later [`assign_correlation`]
    /// for it does not leave a topic record behind.
    ///
    /// [`assign_correlation`]: Self::assign_correlation
    pub async fn resolve_correlation(&self, transport_id: TransportId) -> Result<u64, TrackerError> {
        let mut inner = self.inner.lock().await;

        match inner.topics.remove(&transport_id) {
            Some(correlation) => Ok(correlation.topic_seq),
            None => {
                inner.early_accepts.insert(transport_id, now_ms());
                Err(TrackerError::UnknownTransportId(transport_id))
            }
        }
    }

    /// Forget topic records and early accepts older than `max_age`
    pub async fn prune_correlations(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut inner = self.inner.lock().await;
        let before = inner.topics.len() + inner.early_accepts.len();

        inner.topics.retain(|_, c| c.recorded_ms >= cutoff);
        inner.early_accepts.retain(|_, recorded_ms| *recorded_ms >= cutoff);

        before - (inner.topics.len() + inner.early_accepts.len())
    }

    /// Drop a tracked publish; `None` if it was already resolved or evicted
    pub async fn cancel(&self, handle: PublishHandle) -> Option<PendingPublish> {
        self.inner
            .lock()
            .await
            .remove(handle)
            .map(|tracked| tracked.publish)
    }

    /// Current identity state of a tracked publish
    pub async fn state(&self, handle: PublishHandle) -> Option<PublishState> {
        self.inner
            .lock()
            .await
            .get(handle)
            .map(|tracked| tracked.identity.state())
    }

    /// Handles of publishes older than `max_age`
    pub async fn stale(&self, max_age: Duration) -> Vec<PublishHandle> {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let inner = self.inner.lock().await;

        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let tracked = slot.entry.as_ref()?;
                (tracked.publish.timestamp_ms < cutoff).then_some(PublishHandle {
                    index,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    /// Remove everything, returning the publishes that never got a reply
    pub async fn drain(&self) -> Vec<PendingPublish> {
        let mut inner = self.inner.lock().await;

        let handles: Vec<PublishHandle> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| PublishHandle {
                index,
                generation: slot.generation,
            })
            .collect();

        let drained = handles
            .into_iter()
            .filter_map(|handle| inner.remove(handle))
            .map(|tracked| tracked.publish)
            .collect();

        inner.topics.clear();
        inner.early_accepts.clear();
        inner.by_transport.clear();
        inner.by_key.clear();
        drained
    }

    /// Number of publishes awaiting a reply
    pub async fn pending_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Number of transport ids with a recorded topic
    pub async fn correlation_count(&self) -> usize {
        self.inner.lock().await.topics.len()
    }
}
