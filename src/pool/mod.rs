//! In-memory pool of Gemini API keys with least-used selection, failure
//! accounting, quarantine and probe-based revival.
//!
//! The pool is the single point of contact through which the proxy engines
//! obtain a key. Mutations happen under one mutex; persistence runs outside
//! the critical section. Usage increments flow through a bounded queue
//! drained by a dedicated worker so a load spike cannot fan out into an
//! unbounded number of database writes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::{key_suffix, GeminiKey, STATUS_ACTIVE, STATUS_DISABLED};
use crate::store::{Store, StoreError};

pub const UPSTREAM_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const USAGE_QUEUE_CAPACITY: usize = 100;
const RELOAD_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_REVIVAL_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no active Gemini keys available")]
    Empty,

    #[error("all available Gemini keys are temporarily disabled")]
    AllDisabled,
}

/// The capability set the proxy engines need. The concrete pool also
/// carries the scheduler-facing operations (revival, health checks, close).
#[async_trait]
pub trait Manager: Send + Sync {
    /// Pick the eligible key with the lowest usage count. Never blocks on I/O.
    fn select_next(&self) -> Result<String, PoolError>;

    async fn report_failure(&self, secret: &str);

    async fn report_success(&self, secret: &str);

    /// Number of keys currently eligible for selection.
    fn eligible_count(&self) -> usize;
}

/// A pool entry: the persisted row plus transient quarantine state.
struct ManagedKey {
    key: GeminiKey,
    quarantined: bool,
    quarantined_at: Instant,
}

impl ManagedKey {
    fn new(key: GeminiKey) -> Self {
        Self {
            key,
            quarantined: false,
            quarantined_at: Instant::now(),
        }
    }
}

/// Tuning knobs. The defaults cover production; tests shrink the cooldown
/// and point the probe at a mock server.
pub struct PoolOptions {
    pub probe_base_url: String,
    pub revival_cooldown: Duration,
    /// Await persistence inline instead of spawning; used by tests that
    /// assert on database state right after a report.
    pub sync_db_updates: bool,
}

impl PoolOptions {
    pub fn default_for_upstream() -> Self {
        Self {
            probe_base_url: UPSTREAM_BASE_URL.to_string(),
            revival_cooldown: DEFAULT_REVIVAL_COOLDOWN,
            sync_db_updates: false,
        }
    }
}

pub struct KeyPool {
    keys: Mutex<Vec<ManagedKey>>,
    store: Store,
    update_tx: mpsc::Sender<String>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    probe_client: reqwest::Client,
    probe_base_url: String,
    disable_threshold: i64,
    revival_cooldown: Duration,
    sync_db_updates: bool,
}

impl KeyPool {
    pub async fn new(store: Store, cfg: &Config) -> anyhow::Result<Arc<Self>> {
        Self::with_options(store, cfg, PoolOptions::default_for_upstream()).await
    }

    pub async fn with_options(
        store: Store,
        cfg: &Config,
        options: PoolOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let initial = store.load_active_gemini_keys().await?;
        if initial.is_empty() {
            warn!(
                "No active Gemini keys found in the database; the pool will return \
                 no keys until some are added"
            );
        }

        let (update_tx, update_rx) = mpsc::channel(USAGE_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let pool = Arc::new(Self {
            keys: Mutex::new(initial.into_iter().map(ManagedKey::new).collect()),
            store: store.clone(),
            update_tx,
            worker: Mutex::new(None),
            cancel: cancel.clone(),
            probe_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build probe HTTP client"),
            probe_base_url: options.probe_base_url,
            disable_threshold: cfg.proxy.disable_key_threshold,
            revival_cooldown: options.revival_cooldown,
            sync_db_updates: options.sync_db_updates,
        });

        let worker = tokio::spawn(usage_updater(store, update_rx, cancel));
        *pool.worker_slot() = Some(worker);

        tokio::spawn(reloader(pool.clone()));

        Ok(pool)
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap()
    }

    /// Stop the reloader and the usage worker, draining any queued usage
    /// updates before returning.
    pub async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker_slot().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("Usage updater worker panicked: {}", e);
            }
        }
        info!("Key pool shutdown complete");
    }

    /// Replace the in-memory list with the store's current active keys.
    /// Quarantine flags are intentionally dropped; the next scheduler sweep
    /// re-quarantines anything still failing.
    async fn reload_keys(&self) {
        match self.store.load_active_gemini_keys().await {
            Ok(keys) => {
                if keys.is_empty() {
                    warn!("No active Gemini keys found in database during reload");
                }
                let count = keys.len();
                let mut guard = self.keys.lock().unwrap();
                *guard = keys.into_iter().map(ManagedKey::new).collect();
                drop(guard);
                if count > 0 {
                    debug!(count, "Reloaded Gemini keys from database");
                }
            }
            Err(e) => error!("Failed to reload Gemini keys from database: {}", e),
        }
    }

    async fn persist_key(&self, key: GeminiKey) {
        if self.sync_db_updates {
            if let Err(e) = self.store.update_gemini_key(&key).await {
                error!(key_id = key.id, "Failed to persist key state: {}", e);
            }
        } else {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.update_gemini_key(&key).await {
                    error!(key_id = key.id, "Failed to persist key state: {}", e);
                }
            });
        }
    }

    /// Probe a key against the model-listing endpoint. Success is exactly
    /// HTTP 200; anything else (including transport errors) is a failure.
    async fn probe_key(&self, secret: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1beta/openai/models", self.probe_base_url);
        let resp = self
            .probe_client
            .get(&url)
            .bearer_auth(secret)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("test request failed: {e}"))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            let body = body.chars().take(1024).collect::<String>();
            anyhow::bail!(
                "test request returned non-200 status: {}, body: {}",
                status.as_u16(),
                body.trim()
            );
        }
        Ok(())
    }

    /// Probe quarantined keys whose cooldown has elapsed; revive the ones
    /// that answer, push the rest another cooldown out.
    pub async fn revive_disabled_keys(&self) {
        let candidates: Vec<String> = {
            let keys = self.keys.lock().unwrap();
            keys.iter()
                .filter(|k| k.quarantined && k.quarantined_at.elapsed() > self.revival_cooldown)
                .map(|k| k.key.secret.clone())
                .collect()
        };

        if candidates.is_empty() {
            return;
        }
        info!(count = candidates.len(), "Checking disabled keys for revival");

        let probes = candidates.iter().map(|secret| self.probe_key(secret));
        let outcomes = futures::future::join_all(probes).await;

        for (secret, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    info!(key_suffix = key_suffix(secret), "Successfully revived key");
                    self.report_success(secret).await;
                }
                Err(e) => {
                    debug!(
                        key_suffix = key_suffix(secret),
                        "Key still failing revival check: {}", e
                    );
                    // Reset the cooldown so the next sweep does not probe it
                    // again immediately.
                    let mut keys = self.keys.lock().unwrap();
                    if let Some(k) = keys.iter_mut().find(|k| k.key.secret == *secret) {
                        k.quarantined_at = Instant::now();
                    }
                }
            }
        }
        info!("Finished checking disabled keys");
    }

    /// Probe every key. A failing active key is pushed to the threshold and
    /// quarantined through the normal failure path; a passing quarantined
    /// key is revived.
    pub async fn check_all_keys_health(&self) {
        let snapshot: Vec<(String, bool)> = {
            let keys = self.keys.lock().unwrap();
            keys.iter()
                .map(|k| (k.key.secret.clone(), k.quarantined))
                .collect()
        };

        if snapshot.is_empty() {
            return;
        }
        info!(count = snapshot.len(), "Starting health check for all keys");

        let probes = snapshot.iter().map(|(secret, _)| self.probe_key(secret));
        let outcomes = futures::future::join_all(probes).await;

        for ((secret, quarantined), outcome) in snapshot.iter().zip(outcomes) {
            match outcome {
                Err(e) if !quarantined => {
                    warn!(
                        key_suffix = key_suffix(secret),
                        "Key failed health check, disabling it: {}", e
                    );
                    // Put it one failure below the threshold so the report
                    // below trips quarantine in a single step.
                    {
                        let mut keys = self.keys.lock().unwrap();
                        if let Some(k) = keys.iter_mut().find(|k| k.key.secret == *secret) {
                            k.key.failure_count = self.disable_threshold - 1;
                        }
                    }
                    self.report_failure(secret).await;
                }
                Ok(()) if *quarantined => {
                    info!(
                        key_suffix = key_suffix(secret),
                        "Key passed health check, re-activating it"
                    );
                    self.report_success(secret).await;
                }
                _ => {}
            }
        }
        info!("Finished health check for all keys");
    }

    /// Probe a single key by database id, updating pool state either way.
    /// Keys not in the pool (e.g. disabled in the store) are fetched and
    /// added so the outcome has somewhere to land.
    pub async fn test_key_by_id(&self, id: i64) -> anyhow::Result<()> {
        let in_memory = {
            let keys = self.keys.lock().unwrap();
            keys.iter()
                .find(|k| k.key.id == id)
                .map(|k| k.key.secret.clone())
        };

        let secret = match in_memory {
            Some(secret) => secret,
            None => {
                let key = self
                    .store
                    .get_gemini_key(id)
                    .await
                    .map_err(|e| match e {
                        StoreError::GeminiKeyNotFound => {
                            anyhow::anyhow!("key with ID {id} not found")
                        }
                        other => anyhow::anyhow!("failed to load key {id}: {other}"),
                    })?;
                let secret = key.secret.clone();
                self.keys.lock().unwrap().push(ManagedKey::new(key));
                secret
            }
        };

        info!(key_id = id, "Performing manual health check for key");
        match self.probe_key(&secret).await {
            Ok(()) => {
                self.report_success(&secret).await;
                Ok(())
            }
            Err(e) => {
                warn!(key_id = id, "Manual health check failed: {}", e);
                self.report_failure(&secret).await;
                Err(e)
            }
        }
    }

    /// Kick off a full health check without waiting for it.
    pub fn test_all_keys_async(self: Arc<Self>) {
        info!("Triggering asynchronous health check for all keys");
        tokio::spawn(async move { self.check_all_keys_health().await });
    }
}

#[async_trait]
impl Manager for KeyPool {
    fn select_next(&self) -> Result<String, PoolError> {
        let secret = {
            let mut keys = self.keys.lock().unwrap();
            if keys.is_empty() {
                return Err(PoolError::Empty);
            }
            // The vec is sorted by usage, so the first eligible entry is
            // the least used one.
            let idx = keys
                .iter()
                .position(|k| !k.quarantined)
                .ok_or(PoolError::AllDisabled)?;

            let secret = keys[idx].key.secret.clone();
            keys[idx].key.usage_count += 1;
            keys.sort_by_key(|k| k.key.usage_count);
            secret
        };

        if self.update_tx.try_send(secret.clone()).is_err() {
            warn!("Failed to queue usage count update: queue is full");
        }
        Ok(secret)
    }

    async fn report_failure(&self, secret: &str) {
        let update = {
            let mut keys = self.keys.lock().unwrap();
            keys.iter_mut()
                .find(|k| k.key.secret == secret)
                .map(|k| {
                    k.key.failure_count += 1;
                    if k.key.failure_count >= self.disable_threshold && !k.quarantined {
                        k.quarantined = true;
                        k.quarantined_at = Instant::now();
                        k.key.status = STATUS_DISABLED.to_string();
                        warn!(
                            key_suffix = key_suffix(secret),
                            failures = k.key.failure_count,
                            "Disabling key after reaching failure threshold"
                        );
                    }
                    k.key.clone()
                })
        };

        if let Some(key) = update {
            self.persist_key(key).await;
        }
    }

    async fn report_success(&self, secret: &str) {
        let update = {
            let mut keys = self.keys.lock().unwrap();
            keys.iter_mut()
                .find(|k| k.key.secret == secret && (k.key.failure_count > 0 || k.quarantined))
                .map(|k| {
                    info!(
                        key_suffix = key_suffix(secret),
                        old_failures = k.key.failure_count,
                        "Re-activating key after successful request"
                    );
                    k.key.failure_count = 0;
                    k.quarantined = false;
                    k.key.status = STATUS_ACTIVE.to_string();
                    k.key.clone()
                })
        };

        if let Some(key) = update {
            self.persist_key(key).await;
        }
    }

    fn eligible_count(&self) -> usize {
        self.keys
            .lock()
            .unwrap()
            .iter()
            .filter(|k| !k.quarantined)
            .count()
    }
}

/// Worker that drains the usage queue into the store. Usage accounting is
/// best-effort; failed increments are logged and dropped.
async fn usage_updater(store: Store, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
    info!("Starting usage updater worker");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(secret) => increment_usage(&store, &secret).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                // Drain whatever is still queued before exiting.
                while let Ok(secret) = rx.try_recv() {
                    increment_usage(&store, &secret).await;
                }
                break;
            }
        }
    }
    info!("Usage updater worker stopped");
}

async fn increment_usage(store: &Store, secret: &str) {
    if let Err(e) = store.increment_gemini_key_usage(secret).await {
        warn!(
            key_suffix = key_suffix(secret),
            "Failed to increment usage count in DB: {}", e
        );
    }
}

/// Periodically refresh the pool from the store so out-of-band admin
/// changes (new keys, deletions, status flips) take effect.
async fn reloader(pool: Arc<KeyPool>) {
    let mut interval = tokio::time::interval(RELOAD_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; consume it so the initial load
    // done by the constructor is not repeated right away.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = pool.cancel.cancelled() => {
                info!("Stopping key reloader");
                break;
            }
            _ = interval.tick() => pool.reload_keys().await,
        }
    }
}
