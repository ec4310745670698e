//! Persistence for factor instances, one-time codes and the audit log
//!
//! Verification spans several requests, so factor state and lock counters
//! live here rather than in the process. Every update that races with
//! concurrent logins is a conditional write that reports whether it won.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter};
use crate::error::StoreError;
use crate::factor::FactorKind;
use crate::state::{FactorProgress, FactorState};

pub use memory::MemoryFactorStore;
pub use sqlite::SqliteFactorStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A factor instance set up by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFactor {
    pub id: Uuid,
    pub user_id: i64,
    pub kind: FactorKind,
    pub label: String,
    /// Base32 shared secret (TOTP only)
    pub secret: Option<String>,
    pub created_at: i64,
    pub created_from_ip: Option<String>,
    pub last_verified: Option<i64>,
    pub confirmed: bool,
    pub revoked: bool,
    pub state: FactorState,
    pub lock_counter: u32,
    /// Highest TOTP time step accepted so far
    pub last_counter: Option<u64>,
}

impl UserFactor {
    pub fn new(user_id: i64, kind: FactorKind, label: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            label: label.into(),
            secret: None,
            created_at,
            created_from_ip: None,
            last_verified: None,
            confirmed: false,
            revoked: false,
            state: FactorState::Neutral,
            lock_counter: 0,
            last_counter: None,
        }
    }

    pub fn progress(&self) -> FactorProgress {
        FactorProgress::new(self.state, self.lock_counter)
    }

    /// Usable for verification
    pub fn is_active(&self) -> bool {
        self.confirmed && !self.revoked
    }
}

/// Hashed backup code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCodeRecord {
    pub id: Uuid,
    pub factor_id: Uuid,
    pub user_id: i64,
    /// Argon2id PHC string
    pub code_hash: String,
    pub used: bool,
    pub created_at: i64,
    pub used_at: Option<i64>,
}

/// One-time code sent by email or SMS, hashed. Email codes also carry a
/// link token; for SMS the token is random and never delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub id: Uuid,
    pub factor_id: Uuid,
    pub user_id: i64,
    pub code_hash: String,
    pub salt: String,
    pub link_token_hash: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub attempts: u32,
    pub used: bool,
    pub created_from_ip: Option<String>,
}

/// Allow or deny
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpRuleKind {
    Allow,
    Deny,
}

impl IpRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpRuleKind::Allow => "allow",
            IpRuleKind::Deny => "deny",
        }
    }
}

impl fmt::Display for IpRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpRuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" | "whitelist" => Ok(IpRuleKind::Allow),
            "deny" | "blacklist" => Ok(IpRuleKind::Deny),
            other => Err(format!("unknown rule kind: {}", other)),
        }
    }
}

/// Network rule for the IP range factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRangeRule {
    pub id: Uuid,
    pub network: IpNet,
    pub kind: IpRuleKind,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    /// Disabled rules stay stored but are not evaluated
    pub enabled: bool,
}

impl IpRangeRule {
    pub fn new(network: IpNet, kind: IpRuleKind, description: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            network,
            kind,
            description: description.into(),
            created_by: None,
            created_at,
            enabled: true,
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.network.contains(ip)
    }
}

/// Users with at least one active (confirmed, unrevoked) factor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactorUsage {
    pub users_with_factors: u64,
    /// Distinct users per factor kind, kinds without users left out
    pub users_by_kind: Vec<(FactorKind, u64)>,
}

/// Storage backend for MFA data
#[async_trait]
pub trait FactorStore: Send + Sync + fmt::Debug {
    // factor instances
    async fn insert_factor(&self, factor: &UserFactor) -> StoreResult<()>;
    async fn get_factor(&self, id: Uuid) -> StoreResult<Option<UserFactor>>;
    /// Instances of a user, oldest first
    async fn find_factors(
        &self,
        user_id: i64,
        kind: Option<FactorKind>,
        include_revoked: bool,
    ) -> StoreResult<Vec<UserFactor>>;
    async fn confirm_factor(&self, id: Uuid) -> StoreResult<bool>;
    async fn revoke_factor(&self, id: Uuid) -> StoreResult<bool>;
    /// Revoke every live instance of `kind` for a user
    async fn revoke_factors(&self, user_id: i64, kind: FactorKind) -> StoreResult<u64>;
    /// Drop all instances of a kind site-wide, with their codes
    async fn delete_factors(&self, kind: FactorKind) -> StoreResult<u64>;
    /// Site-wide counts of active instances
    async fn factor_usage(&self) -> StoreResult<FactorUsage>;

    /// Newest confirmed, non-revoked instance of `kind`
    async fn active_factor(&self, user_id: i64, kind: FactorKind) -> StoreResult<Option<UserFactor>> {
        let factors = self.find_factors(user_id, Some(kind), false).await?;
        Ok(factors
            .into_iter()
            .filter(|f| f.confirmed)
            .max_by_key(|f| f.created_at))
    }

    // state and lock counter
    /// Write `next` only if the row still holds `expected`.
    async fn compare_and_set_progress(
        &self,
        id: Uuid,
        expected: FactorProgress,
        next: FactorProgress,
    ) -> StoreResult<bool>;
    /// Unconditional write, for administrative unlock
    async fn set_progress(&self, id: Uuid, progress: FactorProgress) -> StoreResult<bool>;
    /// `Pass`/`Fail` back to `Neutral` for every unlocked instance of the user
    async fn reset_states_for_login(&self, user_id: i64) -> StoreResult<()>;
    /// Zero the counters of the user's unlocked instances
    async fn reset_lock_counters(&self, user_id: i64) -> StoreResult<()>;
    /// Move the TOTP replay marker forward. False if `counter` is not newer.
    async fn advance_totp_counter(&self, id: Uuid, counter: u64) -> StoreResult<bool>;
    async fn touch_verified(&self, id: Uuid, at: i64) -> StoreResult<()>;

    // backup codes
    async fn replace_backup_codes(&self, factor_id: Uuid, codes: &[BackupCodeRecord]) -> StoreResult<()>;
    async fn list_backup_codes(&self, factor_id: Uuid) -> StoreResult<Vec<BackupCodeRecord>>;
    /// Mark used if still unused
    async fn consume_backup_code(&self, id: Uuid, at: i64) -> StoreResult<bool>;

    // email and sms codes
    /// Store a new code, dropping the factor's previous unused ones
    async fn replace_issued_code(&self, record: &IssuedCode) -> StoreResult<()>;
    async fn latest_issued_code(&self, factor_id: Uuid) -> StoreResult<Option<IssuedCode>>;
    /// Count a wrong guess. Returns the new attempt count.
    async fn record_code_attempt(&self, id: Uuid) -> StoreResult<u32>;
    async fn consume_issued_code(&self, id: Uuid) -> StoreResult<bool>;
    async fn delete_issued_codes(&self, user_id: i64) -> StoreResult<u64>;
    async fn delete_expired_codes(&self, now: i64) -> StoreResult<u64>;

    // audit
    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()>;
    async fn audit_entries(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>>;

    // ip ranges
    async fn ip_ranges(&self) -> StoreResult<Vec<IpRangeRule>>;
    async fn add_ip_range(&self, rule: &IpRangeRule) -> StoreResult<()>;
    async fn remove_ip_range(&self, id: Uuid) -> StoreResult<bool>;
    /// False if no rule has this id
    async fn set_ip_range_enabled(&self, id: Uuid, enabled: bool) -> StoreResult<bool>;

    // completed logins
    async fn record_pass(&self, user_id: i64, at: i64) -> StoreResult<()>;
    async fn last_pass(&self, user_id: i64) -> StoreResult<Option<i64>>;
}
