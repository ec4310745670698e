use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BackupCodeRecord, FactorStore, FactorUsage, IpRangeRule, IssuedCode, StoreResult, UserFactor,
};
use crate::audit::{AuditEntry, AuditFilter};
use crate::error::StoreError;
use crate::factor::FactorKind;
use crate::state::{FactorProgress, FactorState};

/// In-memory factor store
///
/// For tests and single-process development. Data is lost on restart.
/// [`set_available`](Self::set_available) simulates a database outage.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactorStore {
    inner: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct Tables {
    factors: HashMap<Uuid, UserFactor>,
    backup_codes: HashMap<Uuid, BackupCodeRecord>,
    /// Insertion order, so the newest of two same-second codes is last
    issued_codes: Vec<IssuedCode>,
    audit: Vec<AuditEntry>,
    ip_ranges: Vec<IpRangeRule>,
    passes: HashMap<i64, i64>,
}

impl MemoryFactorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FactorStore for MemoryFactorStore {
    async fn insert_factor(&self, factor: &UserFactor) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        tables.factors.insert(factor.id, factor.clone());
        Ok(())
    }

    async fn get_factor(&self, id: Uuid) -> StoreResult<Option<UserFactor>> {
        self.check()?;
        let tables = self.inner.read().await;
        Ok(tables.factors.get(&id).cloned())
    }

    async fn find_factors(
        &self,
        user_id: i64,
        kind: Option<FactorKind>,
        include_revoked: bool,
    ) -> StoreResult<Vec<UserFactor>> {
        self.check()?;
        let tables = self.inner.read().await;
        let mut factors: Vec<UserFactor> = tables
            .factors
            .values()
            .filter(|f| f.user_id == user_id)
            .filter(|f| kind.map_or(true, |k| f.kind == k))
            .filter(|f| include_revoked || !f.revoked)
            .cloned()
            .collect();
        factors.sort_by_key(|f| (f.created_at, f.id));
        Ok(factors)
    }

    async fn confirm_factor(&self, id: Uuid) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.factors.get_mut(&id) {
            Some(factor) if !factor.revoked => {
                factor.confirmed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_factor(&self, id: Uuid) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.factors.get_mut(&id) {
            Some(factor) if !factor.revoked => {
                factor.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_factors(&self, user_id: i64, kind: FactorKind) -> StoreResult<u64> {
        self.check()?;
        let mut tables = self.inner.write().await;
        let mut count = 0;
        for factor in tables.factors.values_mut() {
            if factor.user_id == user_id && factor.kind == kind && !factor.revoked {
                factor.revoked = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_factors(&self, kind: FactorKind) -> StoreResult<u64> {
        self.check()?;
        let mut tables = self.inner.write().await;
        let doomed: Vec<Uuid> = tables
            .factors
            .values()
            .filter(|f| f.kind == kind)
            .map(|f| f.id)
            .collect();

        for id in &doomed {
            tables.factors.remove(id);
        }
        tables.backup_codes.retain(|_, c| !doomed.contains(&c.factor_id));
        tables.issued_codes.retain(|c| !doomed.contains(&c.factor_id));
        Ok(doomed.len() as u64)
    }

    async fn factor_usage(&self) -> StoreResult<FactorUsage> {
        self.check()?;
        let tables = self.inner.read().await;
        let active: Vec<&UserFactor> = tables.factors.values().filter(|f| f.is_active()).collect();

        let users: HashSet<i64> = active.iter().map(|f| f.user_id).collect();
        let users_by_kind = FactorKind::ALL
            .iter()
            .map(|kind| {
                let users: HashSet<i64> = active
                    .iter()
                    .filter(|f| f.kind == *kind)
                    .map(|f| f.user_id)
                    .collect();
                (*kind, users.len() as u64)
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        Ok(FactorUsage {
            users_with_factors: users.len() as u64,
            users_by_kind,
        })
    }

    async fn compare_and_set_progress(
        &self,
        id: Uuid,
        expected: FactorProgress,
        next: FactorProgress,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.factors.get_mut(&id) {
            Some(factor) if factor.progress() == expected => {
                factor.state = next.state;
                factor.lock_counter = next.lock_counter;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_progress(&self, id: Uuid, progress: FactorProgress) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.factors.get_mut(&id) {
            Some(factor) => {
                factor.state = progress.state;
                factor.lock_counter = progress.lock_counter;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_states_for_login(&self, user_id: i64) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        for factor in tables.factors.values_mut().filter(|f| f.user_id == user_id) {
            let progress = factor.progress().begin_attempt();
            factor.state = progress.state;
        }
        Ok(())
    }

    async fn reset_lock_counters(&self, user_id: i64) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        for factor in tables.factors.values_mut() {
            if factor.user_id == user_id && factor.state != FactorState::Locked {
                factor.lock_counter = 0;
            }
        }
        Ok(())
    }

    async fn advance_totp_counter(&self, id: Uuid, counter: u64) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.factors.get_mut(&id) {
            Some(factor) if factor.last_counter.map_or(true, |last| counter > last) => {
                factor.last_counter = Some(counter);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_verified(&self, id: Uuid, at: i64) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        if let Some(factor) = tables.factors.get_mut(&id) {
            factor.last_verified = Some(at);
        }
        Ok(())
    }

    async fn replace_backup_codes(&self, factor_id: Uuid, codes: &[BackupCodeRecord]) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        tables.backup_codes.retain(|_, c| c.factor_id != factor_id);
        for code in codes {
            tables.backup_codes.insert(code.id, code.clone());
        }
        Ok(())
    }

    async fn list_backup_codes(&self, factor_id: Uuid) -> StoreResult<Vec<BackupCodeRecord>> {
        self.check()?;
        let tables = self.inner.read().await;
        let mut codes: Vec<BackupCodeRecord> = tables
            .backup_codes
            .values()
            .filter(|c| c.factor_id == factor_id)
            .cloned()
            .collect();
        codes.sort_by_key(|c| (c.created_at, c.id));
        Ok(codes)
    }

    async fn consume_backup_code(&self, id: Uuid, at: i64) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.backup_codes.get_mut(&id) {
            Some(code) if !code.used => {
                code.used = true;
                code.used_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_issued_code(&self, record: &IssuedCode) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        tables
            .issued_codes
            .retain(|c| c.factor_id != record.factor_id || c.used);
        tables.issued_codes.push(record.clone());
        Ok(())
    }

    async fn latest_issued_code(&self, factor_id: Uuid) -> StoreResult<Option<IssuedCode>> {
        self.check()?;
        let tables = self.inner.read().await;
        Ok(tables
            .issued_codes
            .iter()
            .filter(|c| c.factor_id == factor_id)
            // max_by_key keeps the last of equal keys
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn record_code_attempt(&self, id: Uuid) -> StoreResult<u32> {
        self.check()?;
        let mut tables = self.inner.write().await;
        let code = tables
            .issued_codes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("issued code {}", id)))?;
        code.attempts += 1;
        Ok(code.attempts)
    }

    async fn consume_issued_code(&self, id: Uuid) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.issued_codes.iter_mut().find(|c| c.id == id) {
            Some(code) if !code.used => {
                code.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_issued_codes(&self, user_id: i64) -> StoreResult<u64> {
        self.check()?;
        let mut tables = self.inner.write().await;
        let before = tables.issued_codes.len();
        tables.issued_codes.retain(|c| c.user_id != user_id);
        Ok((before - tables.issued_codes.len()) as u64)
    }

    async fn delete_expired_codes(&self, now: i64) -> StoreResult<u64> {
        self.check()?;
        let mut tables = self.inner.write().await;
        let before = tables.issued_codes.len();
        tables.issued_codes.retain(|c| c.expires_at >= now);
        Ok((before - tables.issued_codes.len()) as u64)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        tables.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_entries(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>> {
        self.check()?;
        let tables = self.inner.read().await;
        Ok(tables
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn ip_ranges(&self) -> StoreResult<Vec<IpRangeRule>> {
        self.check()?;
        let tables = self.inner.read().await;
        Ok(tables.ip_ranges.clone())
    }

    async fn add_ip_range(&self, rule: &IpRangeRule) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        tables.ip_ranges.push(rule.clone());
        Ok(())
    }

    async fn remove_ip_range(&self, id: Uuid) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        let before = tables.ip_ranges.len();
        tables.ip_ranges.retain(|r| r.id != id);
        Ok(tables.ip_ranges.len() < before)
    }

    async fn set_ip_range_enabled(&self, id: Uuid, enabled: bool) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.inner.write().await;
        match tables.ip_ranges.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_pass(&self, user_id: i64, at: i64) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.inner.write().await;
        tables.passes.insert(user_id, at);
        Ok(())
    }

    async fn last_pass(&self, user_id: i64) -> StoreResult<Option<i64>> {
        self.check()?;
        let tables = self.inner.read().await;
        Ok(tables.passes.get(&user_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::store::IpRuleKind;

    fn issued(factor_id: Uuid, created_at: i64) -> IssuedCode {
        IssuedCode {
            id: Uuid::new_v4(),
            factor_id,
            user_id: 1,
            code_hash: "hash".to_string(),
            salt: "salt".to_string(),
            link_token_hash: "token".to_string(),
            created_at,
            expires_at: created_at + 600,
            attempts: 0,
            used: false,
            created_from_ip: None,
        }
    }

    fn confirmed(user_id: i64, kind: FactorKind, at: i64) -> UserFactor {
        let mut factor = UserFactor::new(user_id, kind, "test", at);
        factor.confirmed = true;
        factor
    }

    #[tokio::test]
    async fn test_compare_and_set_progress() {
        let store = MemoryFactorStore::new();
        let factor = confirmed(1, FactorKind::Totp, 10);
        store.insert_factor(&factor).await.unwrap();

        let start = FactorProgress::default();
        let failed = FactorProgress::new(FactorState::Fail, 1);

        assert!(store.compare_and_set_progress(factor.id, start, failed).await.unwrap());
        // stale expectation loses
        assert!(!store.compare_and_set_progress(factor.id, start, failed).await.unwrap());

        let stored = store.get_factor(factor.id).await.unwrap().unwrap();
        assert_eq!(stored.progress(), failed);
    }

    #[tokio::test]
    async fn test_active_factor_skips_revoked() {
        let store = MemoryFactorStore::new();
        let old = confirmed(1, FactorKind::Totp, 10);
        let new = confirmed(1, FactorKind::Totp, 20);
        store.insert_factor(&old).await.unwrap();
        store.insert_factor(&new).await.unwrap();

        assert_eq!(store.active_factor(1, FactorKind::Totp).await.unwrap().unwrap().id, new.id);

        store.revoke_factor(new.id).await.unwrap();
        assert_eq!(store.active_factor(1, FactorKind::Totp).await.unwrap().unwrap().id, old.id);

        assert_eq!(store.revoke_factors(1, FactorKind::Totp).await.unwrap(), 1);
        assert!(store.active_factor(1, FactorKind::Totp).await.unwrap().is_none());
        assert_eq!(store.find_factors(1, None, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_totp_counter_only_moves_forward() {
        let store = MemoryFactorStore::new();
        let factor = confirmed(1, FactorKind::Totp, 0);
        store.insert_factor(&factor).await.unwrap();

        assert!(store.advance_totp_counter(factor.id, 100).await.unwrap());
        assert!(!store.advance_totp_counter(factor.id, 100).await.unwrap());
        assert!(!store.advance_totp_counter(factor.id, 99).await.unwrap());
        assert!(store.advance_totp_counter(factor.id, 101).await.unwrap());
    }

    #[tokio::test]
    async fn test_login_reset_keeps_locks() {
        let store = MemoryFactorStore::new();
        let totp = confirmed(1, FactorKind::Totp, 0);
        let email = confirmed(1, FactorKind::Email, 0);
        store.insert_factor(&totp).await.unwrap();
        store.insert_factor(&email).await.unwrap();

        store
            .set_progress(totp.id, FactorProgress::new(FactorState::Locked, 10))
            .await
            .unwrap();
        store
            .set_progress(email.id, FactorProgress::new(FactorState::Fail, 3))
            .await
            .unwrap();

        store.reset_states_for_login(1).await.unwrap();
        store.reset_lock_counters(1).await.unwrap();

        let totp = store.get_factor(totp.id).await.unwrap().unwrap();
        let email = store.get_factor(email.id).await.unwrap().unwrap();
        assert_eq!(totp.progress(), FactorProgress::new(FactorState::Locked, 10));
        assert_eq!(email.progress(), FactorProgress::new(FactorState::Neutral, 0));
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryFactorStore::new();
        store.set_available(false);

        let result = store.find_factors(1, None, false).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert!(store.find_factors(1, None, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_newest_first_with_limit() {
        let store = MemoryFactorStore::new();
        for t in 0..5 {
            store
                .append_audit(&AuditEntry::new(1, AuditEvent::VerifyFailed, false, t))
                .await
                .unwrap();
        }

        let filter = AuditFilter {
            limit: Some(2),
            ..AuditFilter::for_user(1)
        };
        let entries = store.audit_entries(&filter).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].created_at, 4);
        assert_eq!(entries[1].created_at, 3);
    }

    #[tokio::test]
    async fn test_same_second_reissue_returns_newest() {
        let store = MemoryFactorStore::new();
        let factor_id = Uuid::new_v4();

        let first = issued(factor_id, 100);
        store.replace_issued_code(&first).await.unwrap();
        assert!(store.consume_issued_code(first.id).await.unwrap());

        // the used code is kept, the new one shares its timestamp
        let second = issued(factor_id, 100);
        store.replace_issued_code(&second).await.unwrap();
        let latest = store.latest_issued_code(factor_id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(!latest.used);

        let third = issued(factor_id, 100);
        store.replace_issued_code(&third).await.unwrap();
        assert_eq!(store.latest_issued_code(factor_id).await.unwrap().unwrap().id, third.id);
    }

    #[tokio::test]
    async fn test_ip_range_toggle() {
        let store = MemoryFactorStore::new();
        let rule = IpRangeRule::new("10.0.0.0/8".parse().unwrap(), IpRuleKind::Allow, "office", 0);
        store.add_ip_range(&rule).await.unwrap();

        assert!(store.set_ip_range_enabled(rule.id, false).await.unwrap());
        assert!(!store.ip_ranges().await.unwrap()[0].enabled);
        assert!(store.set_ip_range_enabled(rule.id, true).await.unwrap());
        assert!(store.ip_ranges().await.unwrap()[0].enabled);
        assert!(!store.set_ip_range_enabled(Uuid::new_v4(), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_factor_usage_counts_active_users() {
        let store = MemoryFactorStore::new();
        store.insert_factor(&confirmed(1, FactorKind::Totp, 0)).await.unwrap();
        store.insert_factor(&confirmed(1, FactorKind::BackupCodes, 0)).await.unwrap();
        store.insert_factor(&confirmed(2, FactorKind::Totp, 0)).await.unwrap();
        // pending and revoked instances do not count
        store.insert_factor(&UserFactor::new(3, FactorKind::Totp, "pending", 0)).await.unwrap();
        let revoked = confirmed(4, FactorKind::Email, 0);
        store.insert_factor(&revoked).await.unwrap();
        store.revoke_factor(revoked.id).await.unwrap();

        let usage = store.factor_usage().await.unwrap();
        assert_eq!(usage.users_with_factors, 2);
        assert_eq!(
            usage.users_by_kind,
            vec![(FactorKind::Totp, 2), (FactorKind::BackupCodes, 1)]
        );
    }
}
