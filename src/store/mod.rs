//! SQL persistence for pooled Gemini keys and client access keys.
//!
//! Backed by sqlx's `Any` driver so one binary supports sqlite, postgres
//! and mysql; the dialect is picked from `database.type` at startup and the
//! schema is created on connect. Timestamps are stored as unix seconds,
//! which every supported backend can hold in a BIGINT.

use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::models::{ClientKey, GeminiKey, STATUS_ACTIVE};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("gemini key not found")]
    GeminiKeyNotFound,

    #[error("client key not found")]
    ClientKeyNotFound,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

/// Fields accepted when creating a client key via the admin API.
#[derive(Debug, Clone)]
pub struct NewClientKey {
    pub secret: String,
    pub permissions: String,
    pub rate_limit: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
}

impl Store {
    pub async fn connect(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = match cfg.db_type.as_str() {
            "sqlite" => Dialect::Sqlite,
            "postgres" => Dialect::Postgres,
            "mysql" => Dialect::Mysql,
            other => anyhow::bail!("unsupported database type: {other}"),
        };

        let url = normalize_dsn(dialect, &cfg.dsn);
        // An in-memory sqlite database exists per connection; pin the pool
        // to one connection so every query sees the same database.
        let max_connections = if url.contains(":memory:") { 1 } else { 10 };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        let store = Self { pool, dialect };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the schema if it does not exist yet, mirroring what an ORM
    /// auto-migration would produce.
    async fn migrate(&self) -> anyhow::Result<()> {
        let id_col = match self.dialect {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Mysql => "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
        };

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS gemini_keys (
                id {id_col},
                secret VARCHAR(255) NOT NULL UNIQUE,
                status VARCHAR(50) NOT NULL DEFAULT 'active',
                failure_count BIGINT NOT NULL DEFAULT 0,
                usage_count BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS client_keys (
                id {id_col},
                secret VARCHAR(255) NOT NULL UNIQUE,
                status VARCHAR(50) NOT NULL DEFAULT 'active',
                usage_count BIGINT NOT NULL DEFAULT 0,
                permissions VARCHAR(255) NOT NULL DEFAULT '',
                rate_limit BIGINT NOT NULL DEFAULT 0,
                expires_at BIGINT,
                created_at BIGINT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rewrite `?` placeholders to `$n` for postgres; sqlite and mysql use
    /// `?` natively.
    fn q(&self, sql: &str) -> String {
        match self.dialect {
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0;
                for ch in sql.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
            _ => sql.to_string(),
        }
    }

    // -- Gemini key operations --

    pub async fn create_gemini_key(&self, secret: &str) -> Result<GeminiKey> {
        sqlx::query(&self.q(
            "INSERT INTO gemini_keys (secret, status, failure_count, usage_count, created_at)
             VALUES (?, 'active', 0, 0, ?)",
        ))
        .bind(secret)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.get_gemini_key_by_secret(secret).await
    }

    /// Insert many keys at once, silently skipping secrets that already
    /// exist (admin batch import).
    pub async fn batch_add_gemini_keys(&self, secrets: &[String]) -> Result<()> {
        for secret in secrets {
            let result = sqlx::query(&self.q(
                "INSERT INTO gemini_keys (secret, status, failure_count, usage_count, created_at)
                 VALUES (?, 'active', 0, 0, ?)",
            ))
            .bind(secret)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn batch_delete_gemini_keys(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = self.q(&format!(
            "DELETE FROM gemini_keys WHERE id IN ({placeholders})"
        ));
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Paginated listing with optional status and failure-count filters,
    /// newest first. Returns the page plus the filtered total.
    pub async fn list_gemini_keys(
        &self,
        page: i64,
        limit: i64,
        status_filter: &str,
        min_failure_count: i64,
    ) -> Result<(Vec<GeminiKey>, i64)> {
        let mut conditions = Vec::new();
        if !status_filter.is_empty() && status_filter != "all" {
            conditions.push("status = ?");
        }
        if min_failure_count > 0 {
            conditions.push("failure_count >= ?");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = self.q(&format!("SELECT COUNT(*) AS n FROM gemini_keys{where_clause}"));
        let mut count_query = sqlx::query(&count_sql);
        if !status_filter.is_empty() && status_filter != "all" {
            count_query = count_query.bind(status_filter);
        }
        if min_failure_count > 0 {
            count_query = count_query.bind(min_failure_count);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        let page = page.max(1);
        let limit = limit.max(1);
        let list_sql = self.q(&format!(
            "SELECT id, secret, status, failure_count, usage_count, created_at
             FROM gemini_keys{where_clause} ORDER BY id DESC LIMIT ? OFFSET ?"
        ));
        let mut list_query = sqlx::query(&list_sql);
        if !status_filter.is_empty() && status_filter != "all" {
            list_query = list_query.bind(status_filter);
        }
        if min_failure_count > 0 {
            list_query = list_query.bind(min_failure_count);
        }
        let rows = list_query
            .bind(limit)
            .bind((page - 1) * limit)
            .fetch_all(&self.pool)
            .await?;

        let keys = rows
            .iter()
            .map(gemini_key_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((keys, total))
    }

    pub async fn get_gemini_key(&self, id: i64) -> Result<GeminiKey> {
        let row = sqlx::query(&self.q(
            "SELECT id, secret, status, failure_count, usage_count, created_at
             FROM gemini_keys WHERE id = ?",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::GeminiKeyNotFound)?;
        Ok(gemini_key_from_row(&row)?)
    }

    async fn get_gemini_key_by_secret(&self, secret: &str) -> Result<GeminiKey> {
        let row = sqlx::query(&self.q(
            "SELECT id, secret, status, failure_count, usage_count, created_at
             FROM gemini_keys WHERE secret = ?",
        ))
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::GeminiKeyNotFound)?;
        Ok(gemini_key_from_row(&row)?)
    }

    pub async fn update_gemini_key(&self, key: &GeminiKey) -> Result<()> {
        let result = sqlx::query(&self.q(
            "UPDATE gemini_keys
             SET secret = ?, status = ?, failure_count = ?, usage_count = ?
             WHERE id = ?",
        ))
        .bind(&key.secret)
        .bind(&key.status)
        .bind(key.failure_count)
        .bind(key.usage_count)
        .bind(key.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::GeminiKeyNotFound);
        }
        Ok(())
    }

    pub async fn delete_gemini_key(&self, id: i64) -> Result<()> {
        sqlx::query(&self.q("DELETE FROM gemini_keys WHERE id = ?"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All active keys, least used first. The pool reloads from this.
    pub async fn load_active_gemini_keys(&self) -> Result<Vec<GeminiKey>> {
        let rows = sqlx::query(&self.q(
            "SELECT id, secret, status, failure_count, usage_count, created_at
             FROM gemini_keys WHERE status = ? ORDER BY usage_count ASC",
        ))
        .bind(STATUS_ACTIVE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(gemini_key_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Atomically increment a key's failure count and flip it to disabled
    /// once the threshold is reached. Returns whether this call disabled it.
    pub async fn handle_gemini_key_failure(
        &self,
        secret: &str,
        disable_threshold: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&self.q(
            "UPDATE gemini_keys SET failure_count = failure_count + 1 WHERE secret = ?",
        ))
        .bind(secret)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::GeminiKeyNotFound);
        }

        let row = sqlx::query(&self.q(
            "SELECT failure_count, status FROM gemini_keys WHERE secret = ?",
        ))
        .bind(secret)
        .fetch_one(&mut *tx)
        .await?;
        let failure_count: i64 = row.try_get("failure_count")?;
        let status: String = row.try_get("status")?;

        let mut disabled = false;
        if failure_count >= disable_threshold && status == STATUS_ACTIVE {
            sqlx::query(&self.q(
                "UPDATE gemini_keys SET status = 'disabled' WHERE secret = ?",
            ))
            .bind(secret)
            .execute(&mut *tx)
            .await?;
            disabled = true;
        }

        tx.commit().await?;
        Ok(disabled)
    }

    pub async fn reset_gemini_key_failures(&self, secret: &str) -> Result<()> {
        sqlx::query(&self.q(
            "UPDATE gemini_keys SET failure_count = 0 WHERE secret = ?",
        ))
        .bind(secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_gemini_key_usage(&self, secret: &str) -> Result<()> {
        sqlx::query(&self.q(
            "UPDATE gemini_keys SET usage_count = usage_count + 1 WHERE secret = ?",
        ))
        .bind(secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_gemini_key_status(&self, secret: &str, status: &str) -> Result<()> {
        let result = sqlx::query(&self.q(
            "UPDATE gemini_keys SET status = ? WHERE secret = ?",
        ))
        .bind(status)
        .bind(secret)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::GeminiKeyNotFound);
        }
        Ok(())
    }

    // -- Client key operations --

    pub async fn create_client_key(&self, new: &NewClientKey) -> Result<ClientKey> {
        sqlx::query(&self.q(
            "INSERT INTO client_keys (secret, status, usage_count, permissions, rate_limit, expires_at, created_at)
             VALUES (?, 'active', 0, ?, ?, ?, ?)",
        ))
        .bind(&new.secret)
        .bind(&new.permissions)
        .bind(new.rate_limit)
        .bind(new.expires_at.map(|t| t.timestamp()))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.find_client_key(&new.secret).await
    }

    pub async fn list_client_keys(&self) -> Result<Vec<ClientKey>> {
        let rows = sqlx::query(&self.q(
            "SELECT id, secret, status, usage_count, permissions, rate_limit, expires_at, created_at
             FROM client_keys ORDER BY id ASC",
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(client_key_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn get_client_key(&self, id: i64) -> Result<ClientKey> {
        let row = sqlx::query(&self.q(
            "SELECT id, secret, status, usage_count, permissions, rate_limit, expires_at, created_at
             FROM client_keys WHERE id = ?",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ClientKeyNotFound)?;
        Ok(client_key_from_row(&row)?)
    }

    pub async fn update_client_key(&self, key: &ClientKey) -> Result<()> {
        let result = sqlx::query(&self.q(
            "UPDATE client_keys
             SET secret = ?, status = ?, usage_count = ?, permissions = ?, rate_limit = ?, expires_at = ?
             WHERE id = ?",
        ))
        .bind(&key.secret)
        .bind(&key.status)
        .bind(key.usage_count)
        .bind(&key.permissions)
        .bind(key.rate_limit)
        .bind(key.expires_at.map(|t| t.timestamp()))
        .bind(key.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClientKeyNotFound);
        }
        Ok(())
    }

    pub async fn delete_client_key(&self, id: i64) -> Result<()> {
        sqlx::query(&self.q("DELETE FROM client_keys WHERE id = ?"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lookup on the hot request path; every proxied request goes through
    /// this before anything else.
    pub async fn find_client_key(&self, secret: &str) -> Result<ClientKey> {
        let row = sqlx::query(&self.q(
            "SELECT id, secret, status, usage_count, permissions, rate_limit, expires_at, created_at
             FROM client_keys WHERE secret = ?",
        ))
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ClientKeyNotFound)?;
        Ok(client_key_from_row(&row)?)
    }

    pub async fn increment_client_key_usage(&self, secret: &str) -> Result<()> {
        sqlx::query(&self.q(
            "UPDATE client_keys SET usage_count = usage_count + 1 WHERE secret = ?",
        ))
        .bind(secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_client_key_usage(&self, id: i64) -> Result<()> {
        let result = sqlx::query(&self.q(
            "UPDATE client_keys SET usage_count = 0 WHERE id = ?",
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClientKeyNotFound);
        }
        Ok(())
    }

    /// Daily quota reset across every client key.
    pub async fn reset_all_client_key_usage(&self) -> Result<()> {
        sqlx::query(&self.q(
            "UPDATE client_keys SET usage_count = 0 WHERE usage_count > 0",
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn normalize_dsn(dialect: Dialect, dsn: &str) -> String {
    match dialect {
        // Accept a bare file path the way ORM-based setups do.
        Dialect::Sqlite => {
            if dsn.starts_with("sqlite:") {
                dsn.to_string()
            } else if dsn == ":memory:" {
                "sqlite::memory:".to_string()
            } else {
                format!("sqlite://{dsn}?mode=rwc")
            }
        }
        Dialect::Postgres | Dialect::Mysql => dsn.to_string(),
    }
}

fn gemini_key_from_row(row: &AnyRow) -> std::result::Result<GeminiKey, sqlx::Error> {
    Ok(GeminiKey {
        id: row.try_get("id")?,
        secret: row.try_get("secret")?,
        status: row.try_get("status")?,
        failure_count: row.try_get("failure_count")?,
        usage_count: row.try_get("usage_count")?,
        created_at: datetime_from_secs(row.try_get("created_at")?),
    })
}

fn client_key_from_row(row: &AnyRow) -> std::result::Result<ClientKey, sqlx::Error> {
    let expires_at: Option<i64> = row.try_get("expires_at")?;
    Ok(ClientKey {
        id: row.try_get("id")?,
        secret: row.try_get("secret")?,
        status: row.try_get("status")?,
        usage_count: row.try_get("usage_count")?,
        permissions: row.try_get("permissions")?,
        rate_limit: row.try_get("rate_limit")?,
        expires_at: expires_at.map(datetime_from_secs),
        created_at: datetime_from_secs(row.try_get("created_at")?),
    })
}

fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
