//! Resource services composing repositories, transactions, cache, breakers and the job queue.

pub mod accounts;
pub mod handlers;
pub mod products;
pub mod support_tickets;

use tracing::debug;

use crate::cache::{Audience, CacheStore, family_pattern};

pub use accounts::{AccountService, NewUser};
pub use handlers::CatalogJobHandlers;
pub use products::ProductService;
pub use support_tickets::{NewTicket, StatusCount, SupportTicketService, TicketStats};

/// Cache resource family of support ticket listings.
pub const SUPPORT_TICKETS: &str = "support-tickets";
/// Cache resource family of product listings.
pub const PRODUCTS: &str = "products";

/// Drop every cached response of `family` for each of `audiences`.
pub(crate) async fn invalidate(cache: &CacheStore, family: &str, audiences: &[Audience]) {
    let mut removed = 0;
    for audience in audiences {
        removed += cache.delete_by_pattern(&family_pattern(*audience, family)).await;
    }
    debug!(family, removed, "response caches invalidated");
}
