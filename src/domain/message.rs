//! Messages exchanged through the communication hub

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::capability::{Capability, CapabilitySet};

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Status,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Notification => write!(f, "notification"),
            MessageKind::Status => write!(f, "status"),
        }
    }
}

/// Message priority (Low < Medium < High < Critical)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Immutable message routed by the hub.
///
/// `target == None` means broadcast; the broadcast reaches every agent whose
/// capabilities intersect `capability_filter` (an empty filter reaches all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub target: Option<String>,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub payload: Value,
    #[serde(default)]
    pub capability_filter: CapabilitySet,
    /// Id of the request this message answers (responses only)
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn build(sender: &str, target: Option<&str>, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            target: target.map(str::to_string),
            kind,
            priority: MessagePriority::default(),
            payload,
            capability_filter: CapabilitySet::new(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Point-to-point request
    pub fn request(sender: &str, target: &str, payload: Value) -> Self {
        Self::build(sender, Some(target), MessageKind::Request, payload)
    }

    /// Broadcast request to every agent with one of `capabilities`
    pub fn broadcast_request(
        sender: &str,
        capabilities: impl IntoIterator<Item = Capability>,
        payload: Value,
    ) -> Self {
        let mut msg = Self::build(sender, None, MessageKind::Request, payload);
        msg.capability_filter = capabilities.into_iter().collect();
        msg
    }

    /// Notification, targeted or broadcast
    pub fn notification(sender: &str, target: Option<&str>, payload: Value) -> Self {
        Self::build(sender, target, MessageKind::Notification, payload)
    }

    /// Status update, targeted or broadcast
    pub fn status(sender: &str, target: Option<&str>, payload: Value) -> Self {
        Self::build(sender, target, MessageKind::Status, payload)
    }

    /// Build the response to this message.
    ///
    /// The only way to construct a response, so every response carries the
    /// correlation id of exactly one request.
    pub fn reply(&self, responder: &str, payload: Value) -> Self {
        let mut msg = Self::build(
            responder,
            Some(self.sender.as_str()),
            MessageKind::Response,
            payload,
        );
        msg.priority = self.priority;
        msg.correlation_id = Some(self.id);
        msg
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Whether a broadcast with this message's filter reaches `capabilities`
    pub fn matches_capabilities(&self, capabilities: &CapabilitySet) -> bool {
        self.capability_filter.is_empty()
            || self
                .capability_filter
                .iter()
                .any(|cap| capabilities.contains(cap))
    }
}

/// Outcome reported by an agent handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    /// Handler hit its internal deadline or ran with reduced fidelity
    Degraded,
    Error,
}

/// Body of every response message produced by an agent runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub status: ReplyStatus,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseBody {
    pub fn ok(body: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            body,
            error: None,
        }
    }

    pub fn degraded(body: Value, reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Degraded,
            body,
            error: Some(reason.into()),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            body: Value::Null,
            error: Some(reason.into()),
        }
    }

    /// Decode a response payload; payloads that don't follow the envelope
    /// are treated as a plain successful body.
    pub fn from_payload(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_else(|_| Self::ok(payload.clone()))
    }

    pub fn into_payload(self) -> Value {
        serde_json::to_value(&self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_carries_correlation_and_swaps_direction() {
        let req = Message::request("coordinator", "risk-1", json!({"amount": 10}))
            .with_priority(MessagePriority::High);
        let resp = req.reply("risk-1", json!({"score": 0.2}));

        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.correlation_id, Some(req.id));
        assert_eq!(resp.target.as_deref(), Some("coordinator"));
        assert_eq!(resp.sender, "risk-1");
        assert_eq!(resp.priority, MessagePriority::High);
        assert_ne!(resp.id, req.id);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Medium);
        assert!(MessagePriority::Medium > MessagePriority::Low);
    }

    #[test]
    fn test_broadcast_filter_matching() {
        let msg = Message::broadcast_request(
            "coordinator",
            [Capability::RiskAssessment],
            json!({}),
        );
        let risk: CapabilitySet = [Capability::RiskAssessment, Capability::Reporting].into();
        let compliance: CapabilitySet = [Capability::ComplianceCheck].into();
        assert!(msg.matches_capabilities(&risk));
        assert!(!msg.matches_capabilities(&compliance));

        let open = Message::notification("coordinator", None, json!({}));
        assert!(open.matches_capabilities(&compliance));
    }

    #[test]
    fn test_response_body_falls_back_to_plain_payload() {
        let body = ResponseBody::from_payload(&json!({"score": 3}));
        assert_eq!(body.status, ReplyStatus::Ok);
        assert_eq!(body.body, json!({"score": 3}));

        let degraded = ResponseBody::degraded(json!(null), "slow").into_payload();
        assert_eq!(
            ResponseBody::from_payload(&degraded).status,
            ReplyStatus::Degraded
        );
    }
}
