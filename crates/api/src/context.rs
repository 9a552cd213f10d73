use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request context, inserted into request extensions by the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: String,
}

impl RequestContext {
    /// Use the caller's request id when it is usable, otherwise mint one.
    pub fn from_header(header: Option<&str>) -> Self {
        let request_id = header
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        Self { request_id }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}
