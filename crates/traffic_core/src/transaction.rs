//! Primary-store transaction with post-commit hooks.
//!
//! Hooks registered on a [`UnitOfWork`] run only after `commit` succeeds, in
//! registration order. A rollback, a failed commit or simply dropping the
//! unit discards them unrun.

use std::future::Future;
use std::pin::Pin;

use crate::ports::{PrimaryStore, Result, StoreTx};

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type PostCommitHook = Box<dyn FnOnce() -> HookFuture + Send>;

pub struct UnitOfWork {
    tx: Box<dyn StoreTx>,
    after_commit: Vec<PostCommitHook>,
}

impl UnitOfWork {
    pub async fn begin(store: &dyn PrimaryStore) -> Result<Self> {
        Ok(Self {
            tx: store.begin().await?,
            after_commit: Vec::new(),
        })
    }

    pub fn tx(&mut self) -> &mut dyn StoreTx {
        self.tx.as_mut()
    }

    /// Register a hook that runs once the transaction has committed.
    pub fn after_commit<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_commit.push(Box::new(move || Box::pin(hook())));
    }

    pub fn pending_hooks(&self) -> usize {
        self.after_commit.len()
    }

    pub async fn commit(self) -> Result<()> {
        let Self { tx, after_commit } = self;
        tx.commit().await?;
        for hook in after_commit {
            hook().await;
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        let Self { tx, after_commit } = self;
        if !after_commit.is_empty() {
            tracing::debug!(discarded = after_commit.len(), "rollback discards post-commit hooks");
        }
        tx.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::EntityKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn hooks_run_after_commit() {
        let store = MemoryStore::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.tx()
            .insert(EntityKind::Offense, None, &json!({}))
            .await
            .unwrap();
        uow.after_commit(counting_hook(&ran));
        uow.after_commit(counting_hook(&ran));
        assert_eq!(uow.pending_hooks(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        uow.commit().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(store.live_count(EntityKind::Offense), 1);
    }

    #[tokio::test]
    async fn rollback_discards_hooks_and_writes() {
        let store = MemoryStore::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.tx()
            .insert(EntityKind::Fine, None, &json!({}))
            .await
            .unwrap();
        uow.after_commit(counting_hook(&ran));
        uow.rollback().await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(store.live_count(EntityKind::Fine), 0);
    }

    #[tokio::test]
    async fn failed_commit_never_runs_hooks() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.tx()
            .insert(EntityKind::Payment, None, &json!({}))
            .await
            .unwrap();
        uow.after_commit(counting_hook(&ran));
        assert!(uow.commit().await.is_err());

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(store.live_count(EntityKind::Payment), 0);
    }
}
