//! OutboxDispatcher: background task that claims outbox messages and hands
//! them to a downstream consumer.
//!
//! Delivery is at-least-once. A failed delivery releases the claim for a
//! later poll until the message has been attempted `max_fails` times, after
//! which it is dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use traffic_core::ports::{MessageConsumer, OutboxMessage, OutboxStore, Result};

/// Consumer used when no downstream system is configured: records each
/// change in the log and acknowledges it.
pub struct LoggingConsumer;

#[async_trait]
impl MessageConsumer for LoggingConsumer {
    async fn deliver(&self, message: &OutboxMessage) -> Result<()> {
        tracing::info!(
            seq = message.seq,
            channel = %message.message.channel,
            key = %message.message.key,
            attempt = message.attempt_count,
            "change delivered"
        );
        Ok(())
    }
}

/// What one poll of the outbox did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Delivered,
    Retrying,
    DeadLettered,
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    consumer: Arc<dyn MessageConsumer>,
    claimer_id: String,
    interval: Duration,
    max_fails: u32,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        consumer: Arc<dyn MessageConsumer>,
        interval: Duration,
        max_fails: u32,
    ) -> Self {
        Self {
            outbox,
            consumer,
            claimer_id: format!("dispatcher-{}", uuid::Uuid::new_v4().simple()),
            interval,
            max_fails,
        }
    }

    /// Run the dispatcher loop. This never returns under normal operation.
    /// Spawn it as a background task via `tokio::spawn`.
    pub async fn run(&self) {
        tracing::info!(
            claimer = %self.claimer_id,
            interval_ms = self.interval.as_millis() as u64,
            max_fails = self.max_fails,
            "outbox dispatcher started"
        );
        loop {
            match self.tick().await {
                Ok(tick) => {
                    if let Some(pause) = self.pause_after(tick) {
                        tokio::time::sleep(pause).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "outbox claim failed");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    /// Delay before the next poll. A failed delivery waits a full interval
    /// so a failing message is not re-claimed back to back.
    pub fn pause_after(&self, tick: Tick) -> Option<Duration> {
        match tick {
            Tick::Idle | Tick::Retrying => Some(self.interval),
            Tick::Delivered | Tick::DeadLettered => None,
        }
    }

    /// Claim and process at most one message.
    pub async fn tick(&self) -> Result<Tick> {
        let Some(message) = self.outbox.claim_next(&self.claimer_id).await? else {
            return Ok(Tick::Idle);
        };
        let seq = message.seq;
        let channel = message.message.channel.as_str();

        match self.consumer.deliver(&message).await {
            Ok(()) => {
                if let Err(e) = self.outbox.mark_processed(seq).await {
                    tracing::error!(seq, error = %e, "failed to mark outbox message processed");
                }
                Ok(Tick::Delivered)
            }
            Err(e) if message.attempt_count >= self.max_fails => {
                tracing::error!(
                    seq,
                    channel,
                    attempts = message.attempt_count,
                    error = %e,
                    "outbox message dead-lettered"
                );
                if let Err(mark_err) = self.outbox.mark_dead_letter(seq, &e.to_string()).await {
                    tracing::error!(seq, error = %mark_err, "failed to dead-letter outbox message");
                }
                Ok(Tick::DeadLettered)
            }
            Err(e) => {
                tracing::warn!(
                    seq,
                    channel,
                    attempts = message.attempt_count,
                    error = %e,
                    "outbox delivery failed, will retry"
                );
                if let Err(mark_err) = self.outbox.record_failure(seq, &e.to_string()).await {
                    tracing::error!(seq, error = %mark_err, "failed to record outbox failure");
                }
                Ok(Tick::Retrying)
            }
        }
    }
}
