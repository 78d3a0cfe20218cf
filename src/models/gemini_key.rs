use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pooled Gemini API key as stored in the database.
///
/// `failure_count` and `usage_count` are authoritative in the store; the
/// pool keeps its own in-memory projection (see `pool::ManagedKey`) and
/// reconciles it on the periodic reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiKey {
    pub id: i64,
    pub secret: String,
    pub status: String,
    pub failure_count: i64,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

impl GeminiKey {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DISABLED: &str = "disabled";

/// Last four characters of a secret, for logging. Never log the whole key.
pub fn key_suffix(secret: &str) -> &str {
    let n = secret.len();
    if n > 4 {
        &secret[n - 4..]
    } else {
        secret
    }
}
