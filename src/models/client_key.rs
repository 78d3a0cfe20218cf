use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A client-facing access key for this gateway.
///
/// Clients present one of these (Bearer or `x-goog-api-key`) to reach the
/// proxy routes; the pooled upstream keys are never exposed to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientKey {
    pub id: i64,
    pub secret: String,
    pub status: String,
    pub usage_count: i64,
    pub permissions: String,
    pub rate_limit: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ClientKey {
    pub fn is_active(&self) -> bool {
        self.status == super::gemini_key::STATUS_ACTIVE
    }

    /// A key with no `expires_at` never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t < now)
    }
}
