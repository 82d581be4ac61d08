//! Publish Identity State Machine
//!
//! An outbound publish is first known only by the transport id handed back
//! at send time. Once the topic it went out on is known, it is re-keyed by
//! the durable (topic sequence, command sequence) pair that cloud replies
//! carry. A matching reply retires it.
//!
//! ```text
//! Sent { transport_id } --TopicAssigned--> Acknowledged { key } --ReplyMatched--> Resolved
//! ```

use crate::{CorrelationKey, TransportId};

/// Identity state of a tracked publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    /// Submitted to the transport; only the transport id is known
    Sent { transport_id: TransportId },
    /// Topic known; indexed by the composite key
    Acknowledged { key: CorrelationKey },
    /// Reply consumed
    Resolved { key: CorrelationKey },
}

/// Events that drive identity transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityEvent {
    /// The transport id was bound to a topic sequence
    TopicAssigned { topic_seq: u64 },
    /// A cloud reply with this publish's key arrived
    ReplyMatched,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Identity moved from the transport id to the composite key
    Promoted(CorrelationKey),
    /// Event repeated a transition that already happened
    Unchanged(PublishState),
    /// Reply consumed
    Resolved(CorrelationKey),
    /// Event is not valid in the current state
    Invalid {
        from: PublishState,
        event: IdentityEvent,
    },
}

/// Two-phase identity of a single outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishIdentity {
    state: PublishState,
    command_seq: u32,
}

impl PublishIdentity {
    /// A freshly sent command
    pub fn new(transport_id: TransportId, command_seq: u32) -> Self {
        Self {
            state: PublishState::Sent { transport_id },
            command_seq,
        }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn command_seq(&self) -> u32 {
        self.command_seq
    }

    /// Transport id, while still in the `Sent` state
    pub fn transport_id(&self) -> Option<TransportId> {
        match self.state {
            PublishState::Sent { transport_id } => Some(transport_id),
            _ => None,
        }
    }

    /// Composite key, once promoted
    pub fn key(&self) -> Option<CorrelationKey> {
        match self.state {
            PublishState::Sent { .. } => None,
            PublishState::Acknowledged { key } | PublishState::Resolved { key } => Some(key),
        }
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: IdentityEvent) -> TransitionResult {
        use IdentityEvent::*;
        use PublishState::*;

        match (self.state, event) {
            (Sent { .. }, TopicAssigned { topic_seq }) => {
                let key = CorrelationKey::new(topic_seq, self.command_seq);
                self.state = Acknowledged { key };
                TransitionResult::Promoted(key)
            }

            // Repeated assignment of the same topic
            (Acknowledged { key }, TopicAssigned { topic_seq }) if key.topic_seq == topic_seq => {
                TransitionResult::Unchanged(self.state)
            }

            (Acknowledged { key }, ReplyMatched) => {
                self.state = Resolved { key };
                TransitionResult::Resolved(key)
            }

            (from, event) => TransitionResult::Invalid { from, event },
        }
    }
}

/// Check if a transition from one state to another is valid
pub fn is_valid_transition(from: PublishState, to: PublishState) -> bool {
    use PublishState::*;

    match (from, to) {
        (a, b) if a == b => true,
        (Sent { .. }, Acknowledged { .. }) => true,
        (Acknowledged { key: a }, Resolved { key: b }) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let identity = PublishIdentity::new(TransportId(7), 1);
        assert_eq!(
            identity.state(),
            PublishState::Sent {
                transport_id: TransportId(7)
            }
        );
        assert_eq!(identity.transport_id(), Some(TransportId(7)));
        assert!(identity.key().is_none());
    }

    #[test]
    fn test_normal_flow() {
        let mut identity = PublishIdentity::new(TransportId(7), 2);

        let result = identity.process_event(IdentityEvent::TopicAssigned { topic_seq: 40 });
        assert_eq!(result, TransitionResult::Promoted(CorrelationKey::new(40, 2)));
        assert!(identity.transport_id().is_none());

        let result = identity.process_event(IdentityEvent::ReplyMatched);
        assert_eq!(result, TransitionResult::Resolved(CorrelationKey::new(40, 2)));
    }

    #[test]
    fn test_repeated_assignment_is_unchanged() {
        let mut identity = PublishIdentity::new(TransportId(1), 1);
        identity.process_event(IdentityEvent::TopicAssigned { topic_seq: 5 });

        let result = identity.process_event(IdentityEvent::TopicAssigned { topic_seq: 5 });
        assert!(matches!(result, TransitionResult::Unchanged(_)));

        let result = identity.process_event(IdentityEvent::TopicAssigned { topic_seq: 6 });
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(identity.key(), Some(CorrelationKey::new(5, 1)));
    }

    #[test]
    fn test_reply_before_promotion_is_invalid() {
        let mut identity = PublishIdentity::new(TransportId(1), 1);
        let result = identity.process_event(IdentityEvent::ReplyMatched);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_valid_transitions() {
        let sent = PublishState::Sent {
            transport_id: TransportId(1),
        };
        let acked = PublishState::Acknowledged {
            key: CorrelationKey::new(1, 1),
        };
        let resolved = PublishState::Resolved {
            key: CorrelationKey::new(1, 1),
        };

        assert!(is_valid_transition(sent, acked));
        assert!(is_valid_transition(acked, resolved));
        assert!(!is_valid_transition(resolved, sent));
        assert!(!is_valid_transition(sent, resolved));
    }
}
