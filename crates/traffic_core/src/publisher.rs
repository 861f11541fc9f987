//! Serializes mutated records onto the message bus.

use std::sync::Arc;

use serde::Serialize;

use crate::ports::{BusMessage, MessageBus, Result};
use crate::types::{ChangeAction, EntityKind};

/// Channel naming: one channel per (kind, action), e.g. `payment_record_create`.
pub fn channel(kind: EntityKind, action: ChangeAction) -> String {
    format!("{}_{}", kind.record_name(), action)
}

#[derive(Clone)]
pub struct ChangePublisher {
    bus: Arc<dyn MessageBus>,
}

impl ChangePublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Append `payload` to the kind/action channel, keyed by `key`. Returns
    /// only once the bus has durably accepted the message.
    pub async fn publish<P>(
        &self,
        kind: EntityKind,
        action: ChangeAction,
        key: &str,
        payload: &P,
    ) -> Result<()>
    where
        P: Serialize + Sync + ?Sized,
    {
        let message = BusMessage {
            channel: channel(kind, action),
            key: key.to_string(),
            payload: serde_json::to_value(payload)?,
        };
        tracing::debug!(channel = %message.channel, key, "publishing change");
        self.bus.publish(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use crate::records::PaymentRecord;

    #[test]
    fn channel_names() {
        assert_eq!(
            channel(EntityKind::Payment, ChangeAction::Create),
            "payment_record_create"
        );
        assert_eq!(
            channel(EntityKind::Offense, ChangeAction::Update),
            "offense_record_update"
        );
    }

    #[tokio::test]
    async fn publish_keys_message_by_idempotency_key() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = ChangePublisher::new(bus.clone());
        let record = PaymentRecord {
            fine_id: Some(8),
            ..Default::default()
        };

        publisher
            .publish(EntityKind::Payment, ChangeAction::Create, "key-1", &record)
            .await
            .unwrap();

        let sent = bus.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "payment_record_create");
        assert_eq!(sent[0].key, "key-1");
        assert_eq!(sent[0].payload["fineId"], 8);
    }

    #[tokio::test]
    async fn publish_failure_propagates() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_available(false);
        let publisher = ChangePublisher::new(bus.clone());
        let err = publisher
            .publish(EntityKind::Fine, ChangeAction::Create, "k", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(bus.published().is_empty());
    }
}
