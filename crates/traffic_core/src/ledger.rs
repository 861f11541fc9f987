//! Idempotency ledger and gate.
//!
//! A command keyed by a caller-supplied idempotency key moves through:
//!
//! ```text
//!   claim ──► PROCESSING ──publish ok──► SUCCESS/PENDING ──mutation ok──► SUCCESS/DONE
//!                │                            │
//!                └─infra failure─► PROCESSING + lastError (re-claimable)
//!                                             └─mutation rejected──► FAILED
//! ```
//!
//! `SUCCESS/PENDING` means dispatched to the bus, not applied. Only
//! `SUCCESS/DONE` short-circuits a retry as already completed.
//!
//! A PROCESSING claim nobody released (the request was dropped mid-flight)
//! becomes re-claimable once its lease runs out.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::TrafficError;
use crate::ports::{ClaimOutcome, CommandRecord, LedgerStore, NewCommand, Result};
use crate::publisher::ChangePublisher;
use crate::types::{truncate_chars, ChangeAction, EntityKind};

/// Upper bound on a stored failure reason, in characters.
pub const MAX_ERROR_LEN: usize = 500;

/// Longest accepted idempotency key, in characters. Matches the ledger
/// table's key column.
pub const MAX_KEY_LEN: usize = 128;

pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

pub struct IdempotencyLedger {
    store: Arc<dyn LedgerStore>,
    publisher: ChangePublisher,
    claim_lease: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn LedgerStore>, publisher: ChangePublisher) -> Self {
        Self {
            store,
            publisher,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// How long an unreleased PROCESSING claim keeps other callers out.
    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Claim `key` and dispatch `payload` to the `{kind}_{action}` channel.
    ///
    /// Fails with `DuplicateRequest` when the key is already known and not
    /// re-claimable. A publish failure releases the claim and is returned
    /// as-is, so the client can retry with the same key.
    pub async fn check_and_insert<P>(
        &self,
        key: &str,
        payload: &P,
        kind: EntityKind,
        action: ChangeAction,
    ) -> Result<()>
    where
        P: Serialize + Sync + ?Sized,
    {
        let key = require_key(key)?;
        let command = NewCommand {
            key: key.to_string(),
            kind,
            action,
            claim_lease: self.claim_lease,
        };

        match self.store.claim(&command).await? {
            ClaimOutcome::Claimed(_) => {
                tracing::debug!(key, kind = %kind, "idempotency key claimed");
            }
            ClaimOutcome::Existing(record) => {
                let disposition = record.disposition();
                tracing::info!(key, %disposition, "duplicate request rejected");
                return Err(TrafficError::DuplicateRequest {
                    key: key.to_string(),
                    disposition,
                });
            }
        }

        if let Err(e) = self.publisher.publish(kind, action, key, payload).await {
            tracing::warn!(key, error = %e, "publish failed, releasing idempotency key");
            self.release_quietly(key, &e).await;
            return Err(e);
        }

        if let Err(e) = self.store.mark_dispatched(key).await {
            self.release_quietly(key, &e).await;
            return Err(e);
        }
        Ok(())
    }

    /// True iff the key's command is SUCCESS with phase marker DONE.
    pub async fn should_skip_processing(&self, key: &str) -> Result<bool> {
        let key = require_key(key)?;
        Ok(self
            .store
            .find(key)
            .await?
            .map_or(false, |record| record.is_completed()))
    }

    pub async fn find(&self, key: &str) -> Result<Option<CommandRecord>> {
        self.store.find(require_key(key)?).await
    }

    /// The business mutation behind `key` was applied.
    pub async fn mark_success(&self, key: &str, business_id: Option<i64>) -> Result<()> {
        self.store.mark_success(require_key(key)?, business_id).await
    }

    /// The business mutation behind `key` was rejected. Terminal.
    pub async fn mark_failure(&self, key: &str, reason: &str) -> Result<()> {
        let reason = truncate_chars(reason, MAX_ERROR_LEN);
        self.store.mark_failure(require_key(key)?, &reason).await
    }

    /// Reopen `key` after an infrastructure failure so it can be re-driven.
    pub async fn release(&self, key: &str, reason: &str) -> Result<()> {
        let reason = truncate_chars(reason, MAX_ERROR_LEN);
        self.store.release(require_key(key)?, &reason).await
    }

    async fn release_quietly(&self, key: &str, cause: &TrafficError) {
        if let Err(e) = self.release(key, &cause.to_string()).await {
            tracing::error!(key, error = %e, "failed to release idempotency key");
        }
    }
}

fn require_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(TrafficError::validation("Idempotency key must not be blank"));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(TrafficError::validation(format!(
            "Idempotency key must be at most {MAX_KEY_LEN} characters"
        )));
    }
    Ok(key)
}
