use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use backoffice_core::{ActorId, AppError, AppResult, RecordId};

use super::{SUPPORT_TICKETS, invalidate};
use crate::assets::{AssetUpload, GuardedAssetStorage};
use crate::cache::{Audience, CacheStore, response_key};
use crate::model::{AuditRecord, SupportTicket, TicketStatus};
use crate::pagination::{Page, PageRequest, SortSpec};
use crate::repository::{Record, Repository, now_millis};
use crate::store::{DocumentStore, Filter};
use crate::transaction::TransactionCoordinator;

const ATTACHMENT_FOLDER: &str = "support-tickets/attachments";

/// A ticket as submitted by a customer.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub subject: String,
    pub message: String,
    pub attachment: Option<AssetUpload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub count: u64,
    /// Share of all tickets, rounded to a whole percent.
    pub percentage: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketStats {
    pub total: u64,
    pub open: StatusCount,
    pub in_progress: StatusCount,
    pub resolved: StatusCount,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyPatch<'a> {
    admin_reply: &'a str,
    status: TicketStatus,
    reply_date: DateTime<Utc>,
}

fn percentage(count: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((count as f64 / total as f64) * 100.0).round() as u8
}

fn ticket_number(id: RecordId, at: DateTime<Utc>) -> String {
    let simple = id.as_uuid().simple().to_string();
    let suffix = &simple[simple.len() - 6..];
    format!("TKT-{}-{}", at.format("%Y%m%d"), suffix.to_uppercase())
}

pub struct SupportTicketService<S: DocumentStore> {
    tickets: Repository<S, SupportTicket>,
    audit: Repository<S, AuditRecord>,
    tx: TransactionCoordinator<S>,
    cache: CacheStore,
    assets: GuardedAssetStorage,
}

impl<S: DocumentStore> Clone for SupportTicketService<S> {
    fn clone(&self) -> Self {
        Self {
            tickets: self.tickets.clone(),
            audit: self.audit.clone(),
            tx: self.tx.clone(),
            cache: self.cache.clone(),
            assets: self.assets.clone(),
        }
    }
}

impl<S: DocumentStore> SupportTicketService<S> {
    pub fn new(store: Arc<S>, cache: CacheStore, assets: GuardedAssetStorage) -> Self {
        Self {
            tickets: Repository::new(store.clone()),
            audit: Repository::new(store.clone()),
            tx: TransactionCoordinator::new(store),
            cache,
            assets,
        }
    }

    /// Record a new ticket for `customer`.
    ///
    /// The attachment is uploaded first; an unavailable asset store yields a placeholder
    /// attachment flagged `fallback` rather than a failed submission. The ticket and its audit
    /// record are written in one transaction. If that transaction aborts, the uploaded
    /// attachment is deleted again.
    #[instrument(skip(self, input), fields(customer = %customer), err)]
    pub async fn submit(&self, customer: ActorId, input: NewTicket) -> AppResult<SupportTicket> {
        if input.subject.trim().is_empty() || input.message.trim().is_empty() {
            return Err(AppError::validation("ticket subject and message are required"));
        }

        let attachment = match &input.attachment {
            Some(file) => {
                let mut upload = file.clone();
                upload.folder = ATTACHMENT_FOLDER.to_string();
                Some(self.assets.upload(&upload).await?.into_inner())
            }
            None => None,
        };

        let id = RecordId::new();
        let created_at = now_millis();
        let ticket = SupportTicket {
            id,
            ticket_number: ticket_number(id, created_at),
            customer,
            subject: input.subject,
            message: input.message,
            status: TicketStatus::Open,
            attachment,
            admin_reply: None,
            reply_date: None,
            created_at,
        };

        let tickets = self.tickets.clone();
        let audit = self.audit.clone();
        let staged = ticket.clone();
        let written = self
            .tx
            .execute(move |uow| {
                Box::pin(async move {
                    tickets.create(Some(&mut *uow), &staged).await?;
                    let entry = AuditRecord::new(
                        Some(customer),
                        "TICKET_SUBMITTED",
                        SupportTicket::COLLECTION,
                        staged.id,
                    );
                    audit.create(Some(uow), &entry).await
                })
            })
            .await;

        if let Err(err) = written {
            if let Some(asset) = ticket.attachment.as_ref().filter(|a| !a.fallback) {
                if let Err(cleanup) = self.assets.delete(&asset.public_id).await {
                    warn!(public_id = %asset.public_id, error = %cleanup, "orphaned attachment not removed");
                }
            }
            return Err(err);
        }

        invalidate(
            &self.cache,
            SUPPORT_TICKETS,
            &[Audience::Customer(customer), Audience::Admin],
        )
        .await;
        info!(ticket = %ticket.ticket_number, "support ticket submitted");
        Ok(ticket)
    }

    /// A customer's own tickets, newest first (cache-aside).
    pub async fn customer_tickets(
        &self,
        customer: ActorId,
        request: &PageRequest,
    ) -> AppResult<Page<SupportTicket>> {
        let key = response_key(
            Audience::Customer(customer),
            SUPPORT_TICKETS,
            &request.cache_segment(),
        );
        let filter = Filter::new().eq("customer", customer.to_string());
        let sort = SortSpec::newest_first();
        self.cache
            .get_or_load(&key, None, || self.tickets.find_page(&filter, &sort, request))
            .await
    }

    /// Every ticket, optionally narrowed to one status, newest first (cache-aside).
    pub async fn all_tickets(
        &self,
        status: Option<TicketStatus>,
        request: &PageRequest,
    ) -> AppResult<Page<SupportTicket>> {
        let segment = format!(
            "status={}:{}",
            status.map_or("all", |s| s.as_str()),
            request.cache_segment()
        );
        let key = response_key(Audience::Admin, SUPPORT_TICKETS, &segment);
        let filter = match status {
            Some(status) => Filter::new().eq("status", status.as_str()),
            None => Filter::new(),
        };
        let sort = SortSpec::newest_first();
        self.cache
            .get_or_load(&key, None, || self.tickets.find_page(&filter, &sort, request))
            .await
    }

    /// Answer a ticket and mark it resolved.
    #[instrument(skip(self, reply), fields(ticket = %id), err)]
    pub async fn reply(&self, id: RecordId, reply: &str) -> AppResult<SupportTicket> {
        if reply.trim().is_empty() {
            return Err(AppError::validation("reply must not be empty"));
        }
        let patch = serde_json::to_value(ReplyPatch {
            admin_reply: reply,
            status: TicketStatus::Resolved,
            reply_date: now_millis(),
        })
        .map_err(|e| AppError::Storage(format!("failed to encode reply: {e}")))?;

        let ticket = self
            .tickets
            .update(None, id, patch)
            .await?
            .ok_or_else(|| AppError::not_found(format!("support ticket {id}")))?;

        invalidate(
            &self.cache,
            SUPPORT_TICKETS,
            &[Audience::Customer(ticket.customer), Audience::Admin],
        )
        .await;
        info!(ticket = %ticket.ticket_number, "support ticket answered");
        Ok(ticket)
    }

    pub async fn stats(&self) -> AppResult<TicketStats> {
        let by_status = |status: TicketStatus| {
            let filter = Filter::new().eq("status", status.as_str());
            async move { self.tickets.count(&filter).await }
        };
        let all = Filter::new();
        let (total, open, in_progress, resolved) = futures::try_join!(
            self.tickets.count(&all),
            by_status(TicketStatus::Open),
            by_status(TicketStatus::InProgress),
            by_status(TicketStatus::Resolved),
        )?;

        let share = |count| StatusCount {
            count,
            percentage: percentage(count, total),
        };
        Ok(TicketStats {
            total,
            open: share(open),
            in_progress: share(in_progress),
            resolved: share(resolved),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TestEnv;
    use crate::store::InMemoryDocumentStore;

    fn service(env: &TestEnv) -> SupportTicketService<InMemoryDocumentStore> {
        SupportTicketService::new(env.store.clone(), env.cache.clone(), env.assets.clone())
    }

    fn ticket(subject: &str) -> NewTicket {
        NewTicket {
            subject: subject.to_string(),
            message: "it broke".to_string(),
            attachment: None,
        }
    }

    #[test]
    fn percentages_round_to_whole_numbers() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(4, 4), 100);
    }

    #[test]
    fn ticket_numbers_carry_the_date() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let number = ticket_number(RecordId::new(), at);
        assert!(number.starts_with("TKT-20231114-"));
        assert_eq!(number.len(), "TKT-20231114-".len() + 6);
    }

    #[tokio::test]
    async fn submit_writes_ticket_and_audit_record() {
        let env = TestEnv::new();
        let svc = service(&env);
        let customer = ActorId::new();

        let mut input = ticket("Login");
        input.attachment = Some(AssetUpload::new("ignored", "shot.png", vec![1, 2]));
        let created = svc.submit(customer, input).await.unwrap();

        assert_eq!(created.status, TicketStatus::Open);
        let attachment = created.attachment.clone().unwrap();
        assert!(attachment.public_id.starts_with(ATTACHMENT_FOLDER));
        assert!(env.asset_storage.contains(&attachment.public_id));

        let audit: Repository<_, AuditRecord> = Repository::new(env.store.clone());
        let entry = audit
            .find_one(None, &Filter::new().eq("resourceId", created.id.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.action, "TICKET_SUBMITTED");
        assert_eq!(entry.actor, Some(customer));
    }

    #[tokio::test]
    async fn submit_survives_an_unavailable_asset_store() {
        let env = TestEnv::new();
        let svc = service(&env);
        env.asset_storage.set_available(false);

        let mut input = ticket("Attachment");
        input.attachment = Some(AssetUpload::new("x", "a.pdf", vec![7]));
        let created = svc.submit(ActorId::new(), input).await.unwrap();
        assert!(created.attachment.unwrap().fallback);
    }

    #[tokio::test]
    async fn blank_ticket_is_rejected() {
        let env = TestEnv::new();
        let err = service(&env)
            .submit(ActorId::new(), ticket("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn customer_listing_is_cached_until_the_next_submission() {
        let env = TestEnv::new();
        let svc = service(&env);
        let customer = ActorId::new();
        svc.submit(customer, ticket("first")).await.unwrap();
        svc.submit(ActorId::new(), ticket("someone else")).await.unwrap();

        let request = PageRequest::first(10);
        let page = svc.customer_tickets(customer, &request).await.unwrap();
        assert_eq!(page.items().len(), 1);
        let key = response_key(
            Audience::Customer(customer),
            SUPPORT_TICKETS,
            &request.cache_segment(),
        );
        assert!(env.cache.get::<Page<SupportTicket>>(&key).await.is_some());

        svc.submit(customer, ticket("second")).await.unwrap();
        assert!(env.cache.get::<Page<SupportTicket>>(&key).await.is_none());

        let page = svc.customer_tickets(customer, &request).await.unwrap();
        let subjects: Vec<_> = page.items().iter().map(|t| t.subject.as_str()).collect();
        assert_eq!(subjects, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn reply_resolves_and_invalidates_admin_listing() {
        let env = TestEnv::new();
        let svc = service(&env);
        let created = svc.submit(ActorId::new(), ticket("help")).await.unwrap();

        let open = svc
            .all_tickets(Some(TicketStatus::Open), &PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(open.items().len(), 1);

        let answered = svc.reply(created.id, "fixed").await.unwrap();
        assert_eq!(answered.status, TicketStatus::Resolved);
        assert_eq!(answered.admin_reply.as_deref(), Some("fixed"));
        assert!(answered.reply_date.is_some());

        let open = svc
            .all_tickets(Some(TicketStatus::Open), &PageRequest::first(10))
            .await
            .unwrap();
        assert!(open.items().is_empty());
    }

    #[tokio::test]
    async fn reply_to_missing_ticket_is_not_found() {
        let env = TestEnv::new();
        let err = service(&env).reply(RecordId::new(), "hello").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let env = TestEnv::new();
        let svc = service(&env);
        let a = svc.submit(ActorId::new(), ticket("a")).await.unwrap();
        svc.submit(ActorId::new(), ticket("b")).await.unwrap();
        svc.submit(ActorId::new(), ticket("c")).await.unwrap();
        svc.reply(a.id, "done").await.unwrap();

        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.open, StatusCount { count: 2, percentage: 67 });
        assert_eq!(stats.resolved, StatusCount { count: 1, percentage: 33 });
        assert_eq!(stats.in_progress.count, 0);
    }
}
