use std::sync::Arc;

use tracing::{info, instrument};

use backoffice_core::{AppError, AppResult, RecordId};

use crate::model::{AuditRecord, Role, User};
use crate::repository::{Record, Repository, now_millis};
use crate::store::{DocumentStore, Filter};
use crate::transaction::TransactionCoordinator;

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: Role,
    pub credential_hash: String,
}

pub struct AccountService<S: DocumentStore> {
    users: Repository<S, User>,
    audit: Repository<S, AuditRecord>,
    tx: TransactionCoordinator<S>,
}

impl<S: DocumentStore> Clone for AccountService<S> {
    fn clone(&self) -> Self {
        Self {
            users: self.users.clone(),
            audit: self.audit.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S: DocumentStore> AccountService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            users: Repository::new(store.clone()),
            audit: Repository::new(store.clone()),
            tx: TransactionCoordinator::new(store),
        }
    }

    /// Register a user. The e-mail is matched case-insensitively; a taken address is a
    /// `Conflict`, including when a concurrent registration wins the race at commit.
    #[instrument(skip(self, input), err)]
    pub async fn register(&self, input: NewUser) -> AppResult<User> {
        let email = input.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::validation("a valid e-mail address is required"));
        }

        let taken = self
            .users
            .find_one(None, &Filter::new().eq("email", email.clone()))
            .await?;
        if taken.is_some() {
            return Err(AppError::conflict(format!("e-mail {email} is already registered")));
        }

        let user = User {
            id: RecordId::new(),
            email,
            name: input.name,
            role: input.role,
            credential_hash: input.credential_hash,
            created_at: now_millis(),
        };

        let users = self.users.clone();
        let audit = self.audit.clone();
        let staged = user.clone();
        self.tx
            .execute(move |uow| {
                Box::pin(async move {
                    users.create(Some(&mut *uow), &staged).await?;
                    let entry =
                        AuditRecord::new(None, "USER_REGISTERED", User::COLLECTION, staged.id);
                    audit.create(Some(uow), &entry).await
                })
            })
            .await
            .map_err(AppError::into_cause)?;

        info!(user = %user.id, "user registered");
        Ok(user)
    }

    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        self.users
            .find_one(None, &Filter::new().eq("email", email.trim().to_lowercase()))
            .await
    }
}
