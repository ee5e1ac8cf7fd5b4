//! Pipeline events and their wire envelope.
//!
//! Events are serialized with `bincode` and wrapped in a [`SerializedEvent`]
//! carrying a versioned type tag and a partition key. The envelope is what
//! travels over the event channel and what lands in the dead-letter queue when
//! a payload cannot be decoded.
//!
//! # Example
//!
//! ```
//! use flashgrab_core::event::{PipelineEvent, SerializedEvent};
//! use flashgrab_core::types::{EventId, LikeEvent, UserId};
//!
//! let like = PipelineEvent::Like(LikeEvent {
//!     event_id: EventId::new(),
//!     user_id: UserId::new("u-7"),
//!     is_top_like: false,
//!     occurred_at: chrono::Utc::now(),
//! });
//!
//! let envelope = SerializedEvent::from_event(&like).expect("serializable");
//! assert_eq!(envelope.event_type, "LikeRecorded.v1");
//! assert_eq!(PipelineEvent::decode(&envelope).expect("decodable"), like);
//! ```

use crate::types::{EventId, GrabEvent, LikeEvent, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Type tag of [`PipelineEvent::Grab`].
pub const GRAB_RECORDED: &str = "GrabRecorded.v1";

/// Type tag of [`PipelineEvent::Like`].
pub const LIKE_RECORDED: &str = "LikeRecorded.v1";

/// Error types for event encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Envelope carries a tag this build does not understand.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Envelope tag disagrees with the decoded payload.
    #[error("Event type mismatch: envelope says {envelope}, payload is {payload}")]
    TypeMismatch {
        /// Tag on the envelope.
        envelope: String,
        /// Tag of the decoded payload.
        payload: &'static str,
    },
}

/// Everything the gateway emits and the persister consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A grab decision.
    Grab(GrabEvent),
    /// A like action.
    Like(LikeEvent),
}

impl PipelineEvent {
    /// Versioned type tag.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Grab(_) => GRAB_RECORDED,
            Self::Like(_) => LIKE_RECORDED,
        }
    }

    /// Idempotency key.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Grab(e) => e.event_id,
            Self::Like(e) => e.event_id,
        }
    }

    /// The user this event belongs to (also the partition key).
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        match self {
            Self::Grab(e) => &e.user_id,
            Self::Like(e) => &e.user_id,
        }
    }

    /// Serialize to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an envelope back into an event, checking the type tag.
    ///
    /// # Errors
    ///
    /// - [`EventError::UnknownEventType`] for tags other than the known ones
    /// - [`EventError::DeserializationError`] for corrupt payloads
    /// - [`EventError::TypeMismatch`] when tag and payload disagree
    pub fn decode(envelope: &SerializedEvent) -> Result<Self, EventError> {
        if envelope.event_type != GRAB_RECORDED && envelope.event_type != LIKE_RECORDED {
            return Err(EventError::UnknownEventType(envelope.event_type.clone()));
        }

        let event: Self = bincode::deserialize(&envelope.data)
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;

        if event.event_type() != envelope.event_type {
            return Err(EventError::TypeMismatch {
                envelope: envelope.event_type.clone(),
                payload: event.event_type(),
            });
        }

        Ok(event)
    }
}

/// Wire envelope for one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g. `"GrabRecorded.v1"`).
    pub event_type: String,

    /// Partition key. Events sharing a key keep their relative order.
    pub key: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Create an envelope from raw parts.
    #[must_use]
    pub const fn new(event_type: String, key: String, data: Vec<u8>) -> Self {
        Self {
            event_type,
            key,
            data,
        }
    }

    /// Wrap a pipeline event, keyed by its user.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be encoded.
    pub fn from_event(event: &PipelineEvent) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            key: event.user_id().as_str().to_string(),
            data: event.to_bytes()?,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.key,
            self.data.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use crate::types::{DenialReason, Outcome, ResourceId};
    use chrono::Utc;

    fn grab() -> PipelineEvent {
        PipelineEvent::Grab(GrabEvent {
            event_id: EventId::new(),
            user_id: UserId::new("u-1"),
            resource_id: ResourceId::new("coupon-101"),
            outcome: Outcome::Denied(DenialReason::OutOfStock),
            stock_snapshot: 0,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn envelope_is_keyed_by_user() {
        let envelope = SerializedEvent::from_event(&grab()).expect("serializable");
        assert_eq!(envelope.event_type, GRAB_RECORDED);
        assert_eq!(envelope.key, "u-1");
        assert!(!envelope.data.is_empty());
    }

    #[test]
    fn unknown_tag_is_rejected_before_decoding() {
        let mut envelope = SerializedEvent::from_event(&grab()).expect("serializable");
        envelope.event_type = "CouponGrab".to_string();
        assert_eq!(
            PipelineEvent::decode(&envelope),
            Err(EventError::UnknownEventType("CouponGrab".to_string()))
        );
    }

    #[test]
    fn corrupt_payload_is_a_decode_error() {
        let envelope = SerializedEvent::new(GRAB_RECORDED.to_string(), "u".to_string(), vec![0xff; 3]);
        assert!(matches!(
            PipelineEvent::decode(&envelope),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn mismatched_tag_is_detected() {
        let mut envelope = SerializedEvent::from_event(&grab()).expect("serializable");
        envelope.event_type = LIKE_RECORDED.to_string();
        assert!(matches!(
            PipelineEvent::decode(&envelope),
            Err(EventError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn display_mentions_type_and_size() {
        let envelope = SerializedEvent::new("X.v1".to_string(), "k".to_string(), vec![1, 2, 3]);
        let display = format!("{envelope}");
        assert!(display.contains("X.v1"));
        assert!(display.contains("3 bytes"));
    }
}
