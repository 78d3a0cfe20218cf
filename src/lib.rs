//! GoGemini gateway — reverse proxy that multiplexes client requests over
//! a pool of Gemini API keys.
//!
//! Exposes the native Gemini protocol under `/gemini/*` and the upstream's
//! OpenAI-compatible façade under `/openai/*`, with least-used key
//! selection, failure quarantine, scheduled revival probes and an admin
//! CRUD surface.

pub mod api;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod store;
pub mod webui;
