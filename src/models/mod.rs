pub mod client_key;
pub mod gemini_key;

pub use client_key::ClientKey;
pub use gemini_key::{key_suffix, GeminiKey, STATUS_ACTIVE, STATUS_DISABLED};
