//! Stored resources used by the services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backoffice_core::{ActorId, RecordId};

use crate::assets::StoredAsset;
use crate::repository::{Record, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Open,
    #[serde(rename = "In Progress")]
    InProgress,
    Resolved,
}

impl TicketStatus {
    /// Wire name, as stored in documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "Open",
            TicketStatus::InProgress => "In Progress",
            TicketStatus::Resolved => "Resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportTicket {
    pub id: RecordId,
    pub ticket_number: String,
    pub customer: ActorId,
    pub subject: String,
    pub message: String,
    pub status: TicketStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<StoredAsset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Record for SupportTicket {
    const COLLECTION: &'static str = "support_tickets";

    fn id(&self) -> RecordId {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Employee,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: RecordId,
    pub email: String,
    pub name: String,
    pub role: Role,
    /// Opaque credential digest produced by the auth layer.
    pub credential_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Record for User {
    const COLLECTION: &'static str = "users";

    fn id(&self) -> RecordId {
        self.id
    }
}

/// Who did what to which record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorId>,
    pub action: String,
    pub resource: String,
    pub resource_id: RecordId,
    pub created_at: DateTime<Utc>,
}

impl Record for AuditRecord {
    const COLLECTION: &'static str = "audit_log";

    fn id(&self) -> RecordId {
        self.id
    }
}

impl AuditRecord {
    pub fn new(
        actor: Option<ActorId>,
        action: impl Into<String>,
        resource: impl Into<String>,
        resource_id: RecordId,
    ) -> Self {
        Self {
            id: RecordId::new(),
            actor,
            action: action.into(),
            resource: resource.into(),
            resource_id,
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: RecordId,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    #[serde(default)]
    pub images: Vec<StoredAsset>,
    #[serde(default)]
    pub images_optimized: bool,
    /// Relevance score used by the "best match" listing.
    #[serde(default)]
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl Record for Product {
    const COLLECTION: &'static str = "products";

    fn id(&self) -> RecordId {
        self.id
    }
}

/// Product as submitted for creation (single or bulk import).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDraft {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    #[serde(default)]
    pub images: Vec<StoredAsset>,
    #[serde(default)]
    pub score: f64,
}

impl ProductDraft {
    pub fn into_product(self) -> Product {
        Product {
            id: RecordId::new(),
            sku: self.sku,
            name: self.name,
            price_cents: self.price_cents,
            images: self.images,
            images_optimized: false,
            score: self.score,
            created_at: now_millis(),
        }
    }
}
