//! Builders for test entities with sensible defaults.

use taskmesh_domain::entities::{
    BrokerMessage, MessageRecipient, MessageSender, MessageType, TaskDraft,
};

/// A minimal valid draft for the given type and priority.
pub fn task_draft(task_type: &str, priority: u8) -> TaskDraft {
    TaskDraft::new(task_type, priority, serde_json::json!({}))
}

pub struct BrokerMessageBuilder {
    message: BrokerMessage,
}

impl BrokerMessageBuilder {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message: BrokerMessage::new(
                message_type,
                MessageSender::new("test-sender", "worker"),
                MessageRecipient::to_all(),
                serde_json::json!({}),
            ),
        }
    }

    pub fn from(mut self, sender_id: &str, sender_kind: &str) -> Self {
        self.message.sender = MessageSender::new(sender_id, sender_kind);
        self
    }

    pub fn to(mut self, recipient_id: &str) -> Self {
        self.message.recipient = MessageRecipient::to(recipient_id);
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.message.recipient = MessageRecipient::to_all();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.message.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.message.metadata.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.message.metadata.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn build(self) -> BrokerMessage {
        self.message
    }
}

/// A broadcast message of the given type from `sender_id`.
pub fn broadcast_message(message_type: MessageType, sender_id: &str) -> BrokerMessage {
    BrokerMessageBuilder::new(message_type)
        .from(sender_id, "worker")
        .broadcast()
        .build()
}

/// A direct message of the given type from `sender_id` to `recipient_id`.
pub fn direct_message(
    message_type: MessageType,
    sender_id: &str,
    recipient_id: &str,
) -> BrokerMessage {
    BrokerMessageBuilder::new(message_type)
        .from(sender_id, "worker")
        .to(recipient_id)
        .build()
}
