//! SQLite factor store
//!
//! sqlx with a connection pool. Conditional writes are plain
//! `UPDATE ... WHERE` statements checked through `rows_affected`.

use async_trait::async_trait;
use ipnet::IpNet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use super::{
    BackupCodeRecord, FactorStore, FactorUsage, IpRangeRule, IpRuleKind, IssuedCode, StoreResult,
    UserFactor,
};
use crate::audit::{AuditEntry, AuditEvent, AuditFilter};
use crate::error::StoreError;
use crate::factor::FactorKind;
use crate::state::{FactorProgress, FactorState};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS mfa_user_factors (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        label TEXT NOT NULL,
        secret TEXT,
        created_at INTEGER NOT NULL,
        created_from_ip TEXT,
        last_verified INTEGER,
        confirmed INTEGER NOT NULL DEFAULT 0,
        revoked INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'neutral',
        lock_counter INTEGER NOT NULL DEFAULT 0,
        last_counter INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_mfa_user_factors_user ON mfa_user_factors(user_id, kind)",
    r#"
    CREATE TABLE IF NOT EXISTS mfa_backup_codes (
        id TEXT PRIMARY KEY,
        factor_id TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        code_hash TEXT NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        used_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_mfa_backup_codes_factor ON mfa_backup_codes(factor_id)",
    r#"
    CREATE TABLE IF NOT EXISTS mfa_issued_codes (
        id TEXT PRIMARY KEY,
        factor_id TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        code_hash TEXT NOT NULL,
        salt TEXT NOT NULL,
        link_token_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        used INTEGER NOT NULL DEFAULT 0,
        created_from_ip TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_mfa_issued_codes_factor ON mfa_issued_codes(factor_id)",
    r#"
    CREATE TABLE IF NOT EXISTS mfa_audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        factor TEXT,
        event TEXT NOT NULL,
        success INTEGER NOT NULL,
        reason TEXT,
        ip TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_mfa_audit_log_user ON mfa_audit_log(user_id, created_at)",
    r#"
    CREATE TRIGGER IF NOT EXISTS mfa_audit_log_no_update
    BEFORE UPDATE ON mfa_audit_log
    BEGIN
        SELECT RAISE(ABORT, 'mfa_audit_log is append-only');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS mfa_audit_log_no_delete
    BEFORE DELETE ON mfa_audit_log
    BEGIN
        SELECT RAISE(ABORT, 'mfa_audit_log is append-only');
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mfa_ip_ranges (
        id TEXT PRIMARY KEY,
        network TEXT NOT NULL,
        kind TEXT NOT NULL,
        description TEXT NOT NULL,
        created_by TEXT,
        created_at INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mfa_auth (
        user_id INTEGER PRIMARY KEY,
        last_verified INTEGER NOT NULL
    )
    "#,
];

const FACTOR_COLUMNS: &str = "id, user_id, kind, label, secret, created_at, created_from_ip, \
     last_verified, confirmed, revoked, state, lock_counter, last_counter";

const CODE_COLUMNS: &str = "id, factor_id, user_id, code_hash, salt, link_token_hash, \
     created_at, expires_at, attempts, used, created_from_ip";

/// SQLite-backed [`FactorStore`]
#[derive(Debug, Clone)]
pub struct SqliteFactorStore {
    pool: SqlitePool,
}

impl SqliteFactorStore {
    /// Connect to `url` (`sqlite://path.db` or `sqlite::memory:`).
    ///
    /// An in-memory database only lives as long as its connection, so those
    /// URLs get a pool of exactly one connection that never expires.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables, indexes and audit triggers.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("MFA schema migrations applied");
        Ok(())
    }
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{}: {}", what, e))
}

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| corrupt("uuid", e))
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|e| corrupt("counter", e))
}

fn to_u32(value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|e| corrupt("counter", e))
}

fn factor_from_row(row: &SqliteRow) -> StoreResult<UserFactor> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let lock_counter: i64 = row.try_get("lock_counter")?;
    let last_counter: Option<i64> = row.try_get("last_counter")?;

    Ok(UserFactor {
        id: parse_uuid(&id)?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse::<FactorKind>().map_err(|e| corrupt("kind", e))?,
        label: row.try_get("label")?,
        secret: row.try_get("secret")?,
        created_at: row.try_get("created_at")?,
        created_from_ip: row.try_get("created_from_ip")?,
        last_verified: row.try_get("last_verified")?,
        confirmed: row.try_get("confirmed")?,
        revoked: row.try_get("revoked")?,
        state: state.parse::<FactorState>().map_err(|e| corrupt("state", e))?,
        lock_counter: to_u32(lock_counter)?,
        last_counter: last_counter
            .map(|c| u64::try_from(c).map_err(|e| corrupt("last_counter", e)))
            .transpose()?,
    })
}

fn backup_code_from_row(row: &SqliteRow) -> StoreResult<BackupCodeRecord> {
    let id: String = row.try_get("id")?;
    let factor_id: String = row.try_get("factor_id")?;

    Ok(BackupCodeRecord {
        id: parse_uuid(&id)?,
        factor_id: parse_uuid(&factor_id)?,
        user_id: row.try_get("user_id")?,
        code_hash: row.try_get("code_hash")?,
        used: row.try_get("used")?,
        created_at: row.try_get("created_at")?,
        used_at: row.try_get("used_at")?,
    })
}

fn issued_code_from_row(row: &SqliteRow) -> StoreResult<IssuedCode> {
    let id: String = row.try_get("id")?;
    let factor_id: String = row.try_get("factor_id")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(IssuedCode {
        id: parse_uuid(&id)?,
        factor_id: parse_uuid(&factor_id)?,
        user_id: row.try_get("user_id")?,
        code_hash: row.try_get("code_hash")?,
        salt: row.try_get("salt")?,
        link_token_hash: row.try_get("link_token_hash")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        attempts: to_u32(attempts)?,
        used: row.try_get("used")?,
        created_from_ip: row.try_get("created_from_ip")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> StoreResult<AuditEntry> {
    let factor: Option<String> = row.try_get("factor")?;
    let event: String = row.try_get("event")?;

    Ok(AuditEntry {
        user_id: row.try_get("user_id")?,
        factor: factor
            .map(|f| f.parse::<FactorKind>().map_err(|e| corrupt("factor", e)))
            .transpose()?,
        event: event
            .parse::<AuditEvent>()
            .map_err(|e| corrupt("event", e))?,
        success: row.try_get("success")?,
        reason: row.try_get("reason")?,
        ip: row.try_get("ip")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ip_range_from_row(row: &SqliteRow) -> StoreResult<IpRangeRule> {
    let id: String = row.try_get("id")?;
    let network: String = row.try_get("network")?;
    let kind: String = row.try_get("kind")?;

    Ok(IpRangeRule {
        id: parse_uuid(&id)?,
        network: network
            .parse::<IpNet>()
            .map_err(|e| corrupt("network", e))?,
        kind: kind
            .parse::<IpRuleKind>()
            .map_err(|e| corrupt("rule kind", e))?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        enabled: row.try_get("enabled")?,
    })
}

#[async_trait]
impl FactorStore for SqliteFactorStore {
    async fn insert_factor(&self, factor: &UserFactor) -> StoreResult<()> {
        let last_counter = factor.last_counter.map(to_i64).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO mfa_user_factors
                (id, user_id, kind, label, secret, created_at, created_from_ip,
                 last_verified, confirmed, revoked, state, lock_counter, last_counter)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(factor.id.to_string())
        .bind(factor.user_id)
        .bind(factor.kind.name())
        .bind(&factor.label)
        .bind(&factor.secret)
        .bind(factor.created_at)
        .bind(&factor.created_from_ip)
        .bind(factor.last_verified)
        .bind(factor.confirmed)
        .bind(factor.revoked)
        .bind(factor.state.as_str())
        .bind(i64::from(factor.lock_counter))
        .bind(last_counter)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_factor(&self, id: Uuid) -> StoreResult<Option<UserFactor>> {
        let sql = format!("SELECT {} FROM mfa_user_factors WHERE id = ?", FACTOR_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(factor_from_row).transpose()
    }

    async fn find_factors(
        &self,
        user_id: i64,
        kind: Option<FactorKind>,
        include_revoked: bool,
    ) -> StoreResult<Vec<UserFactor>> {
        let sql = format!(
            "SELECT {} FROM mfa_user_factors \
             WHERE user_id = ? AND (? IS NULL OR kind = ?) AND (? OR revoked = 0) \
             ORDER BY created_at, id",
            FACTOR_COLUMNS
        );
        let kind = kind.map(|k| k.name());
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(kind)
            .bind(kind)
            .bind(include_revoked)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(factor_from_row).collect()
    }

    async fn confirm_factor(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE mfa_user_factors SET confirmed = 1 WHERE id = ? AND revoked = 0")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_factor(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE mfa_user_factors SET revoked = 1 WHERE id = ? AND revoked = 0")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_factors(&self, user_id: i64, kind: FactorKind) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE mfa_user_factors SET revoked = 1 WHERE user_id = ? AND kind = ? AND revoked = 0",
        )
        .bind(user_id)
        .bind(kind.name())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_factors(&self, kind: FactorKind) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        for table in ["mfa_backup_codes", "mfa_issued_codes"] {
            let sql = format!(
                "DELETE FROM {} WHERE factor_id IN (SELECT id FROM mfa_user_factors WHERE kind = ?)",
                table
            );
            sqlx::query(&sql).bind(kind.name()).execute(&mut *tx).await?;
        }

        let result = sqlx::query("DELETE FROM mfa_user_factors WHERE kind = ?")
            .bind(kind.name())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn factor_usage(&self) -> StoreResult<FactorUsage> {
        let users: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT user_id) FROM mfa_user_factors WHERE confirmed = 1 AND revoked = 0",
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT kind, COUNT(DISTINCT user_id) AS users
            FROM mfa_user_factors
            WHERE confirmed = 1 AND revoked = 0
            GROUP BY kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users_by_kind = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: String = row.try_get("kind")?;
            let count: i64 = row.try_get("users")?;
            let kind = kind.parse::<FactorKind>().map_err(|e| corrupt("kind", e))?;
            let count = u64::try_from(count).map_err(|e| corrupt("count", e))?;
            users_by_kind.push((kind, count));
        }
        users_by_kind.sort_by_key(|(kind, _)| FactorKind::ALL.iter().position(|k| k == kind));

        Ok(FactorUsage {
            users_with_factors: u64::try_from(users).map_err(|e| corrupt("count", e))?,
            users_by_kind,
        })
    }

    async fn compare_and_set_progress(
        &self,
        id: Uuid,
        expected: FactorProgress,
        next: FactorProgress,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mfa_user_factors
            SET state = ?, lock_counter = ?
            WHERE id = ? AND state = ? AND lock_counter = ?
            "#,
        )
        .bind(next.state.as_str())
        .bind(i64::from(next.lock_counter))
        .bind(id.to_string())
        .bind(expected.state.as_str())
        .bind(i64::from(expected.lock_counter))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_progress(&self, id: Uuid, progress: FactorProgress) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE mfa_user_factors SET state = ?, lock_counter = ? WHERE id = ?")
            .bind(progress.state.as_str())
            .bind(i64::from(progress.lock_counter))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_states_for_login(&self, user_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE mfa_user_factors SET state = 'neutral' WHERE user_id = ? AND state != 'locked'")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_lock_counters(&self, user_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE mfa_user_factors SET lock_counter = 0 WHERE user_id = ? AND state != 'locked'")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn advance_totp_counter(&self, id: Uuid, counter: u64) -> StoreResult<bool> {
        let counter = to_i64(counter)?;
        let result = sqlx::query(
            r#"
            UPDATE mfa_user_factors SET last_counter = ?
            WHERE id = ? AND (last_counter IS NULL OR last_counter < ?)
            "#,
        )
        .bind(counter)
        .bind(id.to_string())
        .bind(counter)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch_verified(&self, id: Uuid, at: i64) -> StoreResult<()> {
        sqlx::query("UPDATE mfa_user_factors SET last_verified = ? WHERE id = ?")
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_backup_codes(&self, factor_id: Uuid, codes: &[BackupCodeRecord]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM mfa_backup_codes WHERE factor_id = ?")
            .bind(factor_id.to_string())
            .execute(&mut *tx)
            .await?;

        for code in codes {
            sqlx::query(
                r#"
                INSERT INTO mfa_backup_codes (id, factor_id, user_id, code_hash, used, created_at, used_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(code.id.to_string())
            .bind(code.factor_id.to_string())
            .bind(code.user_id)
            .bind(&code.code_hash)
            .bind(code.used)
            .bind(code.created_at)
            .bind(code.used_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_backup_codes(&self, factor_id: Uuid) -> StoreResult<Vec<BackupCodeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, factor_id, user_id, code_hash, used, created_at, used_at
            FROM mfa_backup_codes WHERE factor_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(factor_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(backup_code_from_row).collect()
    }

    async fn consume_backup_code(&self, id: Uuid, at: i64) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE mfa_backup_codes SET used = 1, used_at = ? WHERE id = ? AND used = 0")
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_issued_code(&self, record: &IssuedCode) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM mfa_issued_codes WHERE factor_id = ? AND used = 0")
            .bind(record.factor_id.to_string())
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "INSERT INTO mfa_issued_codes ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            CODE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(record.id.to_string())
            .bind(record.factor_id.to_string())
            .bind(record.user_id)
            .bind(&record.code_hash)
            .bind(&record.salt)
            .bind(&record.link_token_hash)
            .bind(record.created_at)
            .bind(record.expires_at)
            .bind(i64::from(record.attempts))
            .bind(record.used)
            .bind(&record.created_from_ip)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn latest_issued_code(&self, factor_id: Uuid) -> StoreResult<Option<IssuedCode>> {
        let sql = format!(
            "SELECT {} FROM mfa_issued_codes WHERE factor_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            CODE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(factor_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(issued_code_from_row).transpose()
    }

    async fn record_code_attempt(&self, id: Uuid) -> StoreResult<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE mfa_issued_codes SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match attempts {
            Some(attempts) => to_u32(attempts),
            None => Err(StoreError::NotFound(format!("issued code {}", id))),
        }
    }

    async fn consume_issued_code(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE mfa_issued_codes SET used = 1 WHERE id = ? AND used = 0")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_issued_codes(&self, user_id: i64) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM mfa_issued_codes WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_codes(&self, now: i64) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM mfa_issued_codes WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mfa_audit_log (user_id, factor, event, success, reason, ip, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.factor.map(|f| f.name()))
        .bind(entry.event.as_str())
        .bind(entry.success)
        .bind(&entry.reason)
        .bind(&entry.ip)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn audit_entries(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>> {
        let factor = filter.factor.map(|f| f.name());
        let event = filter.event.map(|e| e.as_str());
        // SQLite treats a negative LIMIT as unbounded
        let limit = filter
            .limit
            .and_then(|l| i64::try_from(l).ok())
            .unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT user_id, factor, event, success, reason, ip, created_at
            FROM mfa_audit_log
            WHERE (?1 IS NULL OR user_id = ?1)
              AND (?2 IS NULL OR factor = ?2)
              AND (?3 IS NULL OR event = ?3)
              AND (?4 IS NULL OR created_at >= ?4)
              AND (?5 IS NULL OR success = ?5)
            ORDER BY id DESC
            LIMIT ?6
            "#,
        )
        .bind(filter.user_id)
        .bind(factor)
        .bind(event)
        .bind(filter.since)
        .bind(filter.success)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }

    async fn ip_ranges(&self) -> StoreResult<Vec<IpRangeRule>> {
        let rows = sqlx::query(
            "SELECT id, network, kind, description, created_by, created_at, enabled \
             FROM mfa_ip_ranges ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ip_range_from_row).collect()
    }

    async fn add_ip_range(&self, rule: &IpRangeRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mfa_ip_ranges (id, network, kind, description, created_by, created_at, enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.id.to_string())
        .bind(rule.network.to_string())
        .bind(rule.kind.as_str())
        .bind(&rule.description)
        .bind(&rule.created_by)
        .bind(rule.created_at)
        .bind(rule.enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_ip_range(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM mfa_ip_ranges WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_ip_range_enabled(&self, id: Uuid, enabled: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE mfa_ip_ranges SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_pass(&self, user_id: i64, at: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mfa_auth (user_id, last_verified) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET last_verified = excluded.last_verified
            "#,
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_pass(&self, user_id: i64) -> StoreResult<Option<i64>> {
        let at: Option<i64> = sqlx::query_scalar("SELECT last_verified FROM mfa_auth WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteFactorStore {
        let store = SqliteFactorStore::connect("sqlite::memory:", 5).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = store().await;
        store.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_factor_round_trip() {
        let store = store().await;
        let mut factor = UserFactor::new(42, FactorKind::Totp, "phone", 1_700_000_000);
        factor.secret = Some("JBSWY3DPEHPK3PXP".to_string());
        factor.created_from_ip = Some("10.0.0.1".to_string());
        factor.last_counter = Some(56_666_666);
        store.insert_factor(&factor).await.unwrap();

        let loaded = store.get_factor(factor.id).await.unwrap().unwrap();
        assert_eq!(loaded, factor);
    }

    #[tokio::test]
    async fn test_find_factors_filters() {
        let store = store().await;
        let totp = UserFactor::new(1, FactorKind::Totp, "phone", 1);
        let email = UserFactor::new(1, FactorKind::Email, "a@example.com", 2);
        let other = UserFactor::new(2, FactorKind::Totp, "phone", 3);
        for f in [&totp, &email, &other] {
            store.insert_factor(f).await.unwrap();
        }
        store.revoke_factor(email.id).await.unwrap();

        assert_eq!(store.find_factors(1, None, false).await.unwrap().len(), 1);
        assert_eq!(store.find_factors(1, None, true).await.unwrap().len(), 2);
        let only_totp = store.find_factors(1, Some(FactorKind::Totp), true).await.unwrap();
        assert_eq!(only_totp.len(), 1);
        assert_eq!(only_totp[0].id, totp.id);
    }

    #[tokio::test]
    async fn test_audit_rows_cannot_be_deleted() {
        let store = store().await;
        store
            .append_audit(&AuditEntry::new(1, AuditEvent::MfaPassed, true, 5))
            .await
            .unwrap();

        let result = sqlx::query("DELETE FROM mfa_audit_log").execute(store.pool()).await;
        assert!(result.is_err());
        assert_eq!(store.audit_entries(&AuditFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_pass_upserts() {
        let store = store().await;
        assert_eq!(store.last_pass(9).await.unwrap(), None);
        store.record_pass(9, 100).await.unwrap();
        store.record_pass(9, 200).await.unwrap();
        assert_eq!(store.last_pass(9).await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn test_audit_success_filter() {
        let store = store().await;
        store
            .append_audit(&AuditEntry::new(1, AuditEvent::VerifyFailed, false, 5))
            .await
            .unwrap();
        store
            .append_audit(&AuditEntry::new(1, AuditEvent::VerifySucceeded, true, 6))
            .await
            .unwrap();

        let failures = store
            .audit_entries(&AuditFilter {
                success: Some(false),
                ..AuditFilter::for_user(1)
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event, AuditEvent::VerifyFailed);

        let successes = store
            .audit_entries(&AuditFilter {
                success: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].event, AuditEvent::VerifySucceeded);
    }
}
