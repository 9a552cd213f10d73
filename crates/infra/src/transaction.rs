//! All-or-nothing execution of multi-step writes.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};
use uuid::Uuid;

use backoffice_core::{AppError, AppResult};

use crate::store::{DocumentStore, StoreSession};

/// Scoped handle on one atomic store session.
///
/// Only the coordinator creates these, and it consumes the session on commit or abort, so a
/// unit of work can never outlive or be shared beyond the operation that started it.
#[derive(Debug)]
pub struct UnitOfWork<S: StoreSession> {
    session: S,
}

impl<S: StoreSession> UnitOfWork<S> {
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub(crate) fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

/// Runs units of work against a document store.
pub struct TransactionCoordinator<S: DocumentStore> {
    store: Arc<S>,
}

impl<S: DocumentStore> Clone for TransactionCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: DocumentStore> TransactionCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Start a session, run `work` with it, commit on `Ok`, abort on `Err`.
    ///
    /// Errors come back as [`AppError::TransactionAborted`] wrapping the cause, whether the
    /// unit of work failed or the commit itself was refused.
    ///
    /// ```ignore
    /// let tickets = self.tickets.clone();
    /// coordinator
    ///     .execute(move |uow| Box::pin(async move { tickets.create(Some(uow), &ticket).await }))
    ///     .await?;
    /// ```
    pub async fn execute<T, F>(&self, work: F) -> AppResult<T>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork<S::Session>) -> BoxFuture<'u, AppResult<T>> + Send,
    {
        let session = self.store.start_session().await?;
        let mut uow = UnitOfWork { session };
        let session_id = uow.id();
        debug!(session = %session_id, "transaction started");

        match work(&mut uow).await {
            Ok(value) => match uow.session.commit().await {
                Ok(()) => {
                    debug!(session = %session_id, "transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    error!(session = %session_id, error = %e, "transaction commit failed");
                    Err(AppError::aborted(e.into()))
                }
            },
            Err(cause) => {
                error!(session = %session_id, error = %cause, "transaction aborted");
                if let Err(e) = uow.session.abort().await {
                    warn!(session = %session_id, error = %e, "session abort failed");
                }
                Err(AppError::aborted(cause))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, Filter, InMemoryDocumentStore};
    use serde_json::json;

    fn doc(id: &str, email: &str) -> Document {
        Document::new(id, json!({"id": id, "email": email})).unwrap()
    }

    fn coordinator() -> (Arc<InMemoryDocumentStore>, TransactionCoordinator<InMemoryDocumentStore>) {
        let store = Arc::new(InMemoryDocumentStore::new().with_unique_index("users", "email"));
        (store.clone(), TransactionCoordinator::new(store))
    }

    #[tokio::test]
    async fn successful_work_commits_every_write() {
        let (store, tx) = coordinator();
        let writer = store.clone();
        let n = tx
            .execute(move |uow| {
                Box::pin(async move {
                    writer.insert(Some(uow.session_mut()), "users", doc("a", "a@x")).await?;
                    writer.insert(Some(uow.session_mut()), "users", doc("b", "b@x")).await?;
                    Ok(2)
                })
            })
            .await
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(store.count("users", &Filter::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failure_after_first_write_leaves_nothing_behind() {
        let (store, tx) = coordinator();
        let writer = store.clone();
        let err = tx
            .execute(move |uow| {
                Box::pin(async move {
                    writer.insert(Some(uow.session_mut()), "users", doc("a", "a@x")).await?;
                    Err::<(), _>(AppError::validation("second step rejected"))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::TransactionAborted(_)));
        assert!(matches!(err.cause(), AppError::Validation(_)));
        assert!(store.get(None, "users", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refused_commit_is_reported_as_aborted_conflict() {
        let (store, tx) = coordinator();
        store.insert(None, "users", doc("a", "taken@x")).await.unwrap();

        let writer = store.clone();
        let err = tx
            .execute(move |uow| {
                Box::pin(async move {
                    writer.insert(Some(uow.session_mut()), "users", doc("b", "new@x")).await?;
                    writer.insert(Some(uow.session_mut()), "users", doc("c", "taken@x")).await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err.cause(), AppError::Conflict(_)));
        assert!(store.get(None, "users", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nested_aborts_do_not_stack() {
        let (_store, tx) = coordinator();
        let err = tx
            .execute(|_uow| Box::pin(async { Err::<(), _>(AppError::aborted(AppError::Unauthorized)) }))
            .await
            .unwrap_err();

        match err {
            AppError::TransactionAborted(inner) => assert!(matches!(*inner, AppError::Unauthorized)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
