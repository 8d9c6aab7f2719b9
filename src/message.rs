//! Message envelope types carried through the engine
//!
//! Payloads are opaque byte blobs serialized by the caller; the engine only
//! routes them, tracks correlation ids, and carries headers.

use std::collections::HashMap;
use uuid::Uuid;

/// Header carrying the routing key a responder must use for the reply
pub const REPLY_ROUTING_HEADER: &str = "reply-routing-key";

/// Header carrying the caller-meaningful business id (e.g. ticket id)
pub const BUSINESS_ID_HEADER: &str = "business-id";

/// An outbound message handed to the publisher
///
/// The correlation id is assigned exactly once at construction and is never
/// regenerated, so the id used on the wire is the id responses are matched
/// against.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Correlation id linking this request to its eventual response
    pub correlation_id: String,
    /// Caller-meaningful id used to key blocking waits (defaults to the
    /// correlation id)
    pub business_id: String,
    /// Routing key for the request
    pub routing_key: String,
    /// Routing key the responder should use for the reply, carried in the
    /// `reply-routing-key` header
    pub reply_routing_key: Option<String>,
    /// Custom message headers
    pub headers: HashMap<String, String>,
    /// Opaque serialized payload
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Create a new message with a generated correlation id
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        Self {
            business_id: correlation_id.clone(),
            correlation_id,
            routing_key: routing_key.into(),
            reply_routing_key: None,
            headers: HashMap::new(),
            payload,
        }
    }

    /// Use a caller-assigned correlation id instead of a generated one
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        if self.business_id == self.correlation_id {
            self.business_id = correlation_id.clone();
        }
        self.correlation_id = correlation_id;
        self
    }

    /// Set the business id used to correlate blocking sends with responses
    pub fn with_business_id(mut self, business_id: impl Into<String>) -> Self {
        self.business_id = business_id.into();
        self
    }

    /// Set the reply routing key header
    pub fn with_reply_routing_key(mut self, key: impl Into<String>) -> Self {
        self.reply_routing_key = Some(key.into());
        self
    }

    /// Attach a custom header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Headers as they go on the wire, including the reply routing key and
    /// business id
    pub fn wire_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some(reply) = &self.reply_routing_key {
            headers.insert(REPLY_ROUTING_HEADER.to_string(), reply.clone());
        }
        headers.insert(BUSINESS_ID_HEADER.to_string(), self.business_id.clone());
        headers
    }
}

/// A raw delivery pulled from the broker
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    /// Broker delivery tag used for acknowledgement
    pub delivery_tag: u64,
    /// Routing key the message arrived with
    pub routing_key: String,
    /// Correlation id from the message properties, if present
    pub correlation_id: Option<String>,
    /// Message headers
    pub headers: HashMap<String, String>,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Whether the broker flagged this delivery as redelivered
    pub redelivered: bool,
}

impl InboundDelivery {
    /// Business id for response matching: the `business-id` header when
    /// present, otherwise the wire correlation id
    pub fn business_id(&self) -> Option<String> {
        self.headers
            .get(BUSINESS_ID_HEADER)
            .cloned()
            .or_else(|| self.correlation_id.clone())
    }
}

/// A correlated response delivered to the caller
#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    /// Correlation id of the originating request
    pub correlation_id: String,
    /// Business id used for matching
    pub business_id: String,
    /// Routing key the response arrived with
    pub routing_key: String,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// Opaque response payload
    pub payload: Vec<u8>,
}

impl ReplyEnvelope {
    /// Build a reply envelope from a raw delivery, if it carries enough
    /// correlation metadata to be matched
    pub fn from_delivery(delivery: &InboundDelivery) -> Option<Self> {
        let correlation_id = delivery.correlation_id.clone()?;
        let business_id = delivery.business_id().unwrap_or_else(|| correlation_id.clone());
        Some(Self {
            correlation_id,
            business_id,
            routing_key: delivery.routing_key.clone(),
            headers: delivery.headers.clone(),
            payload: delivery.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_assigned_once() {
        let msg = OutboundMessage::new("ticket.submit", b"payload".to_vec());
        let id = msg.correlation_id.clone();
        let msg = msg.with_header("priority", "1");
        assert_eq!(msg.correlation_id, id);
        assert_eq!(msg.business_id, id);
    }

    #[test]
    fn business_id_follows_explicit_correlation_id() {
        let msg = OutboundMessage::new("ticket.submit", Vec::new()).with_correlation_id("c1");
        assert_eq!(msg.correlation_id, "c1");
        assert_eq!(msg.business_id, "c1");

        let msg = OutboundMessage::new("ticket.submit", Vec::new())
            .with_business_id("ticket-42")
            .with_correlation_id("c2");
        assert_eq!(msg.business_id, "ticket-42");
    }

    #[test]
    fn wire_headers_carry_reply_routing_key() {
        let msg = OutboundMessage::new("ticket.submit", Vec::new())
            .with_reply_routing_key("ticket.reply.node1");
        let headers = msg.wire_headers();
        assert_eq!(
            headers.get(REPLY_ROUTING_HEADER).map(String::as_str),
            Some("ticket.reply.node1")
        );
        assert!(headers.contains_key(BUSINESS_ID_HEADER));
    }

    #[test]
    fn reply_envelope_requires_correlation_id() {
        let delivery = InboundDelivery {
            delivery_tag: 1,
            routing_key: "ticket.reply".to_string(),
            correlation_id: None,
            headers: HashMap::new(),
            payload: Vec::new(),
            redelivered: false,
        };
        assert!(ReplyEnvelope::from_delivery(&delivery).is_none());

        let delivery = InboundDelivery {
            correlation_id: Some("c1".to_string()),
            ..delivery
        };
        let reply = ReplyEnvelope::from_delivery(&delivery).expect("matched");
        assert_eq!(reply.business_id, "c1");
    }
}
