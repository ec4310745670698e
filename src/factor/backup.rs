//! Backup codes factor
//!
//! One-time recovery codes, argon2id-hashed at rest. Consumption is a
//! conditional write, so a code wins at most one race.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MfaError, Result};
use crate::factor::{CodeRejection, FactorKind, Verdict};
use crate::store::{BackupCodeRecord, FactorStore, UserFactor};

const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Warn once fewer codes than this remain
pub const LOW_CODE_THRESHOLD: usize = 3;

/// Configuration for backup codes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupCodeConfig {
    pub enabled: bool,
    pub weight: u32,
    /// Number of codes per set
    pub count: usize,
    /// Characters per code, separators excluded
    pub length: usize,
    /// Print codes as XXXX-XXXX
    pub use_separators: bool,
}

impl Default for BackupCodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 10,
            count: 10,
            length: 8,
            use_separators: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupCodeFactor {
    config: BackupCodeConfig,
}

impl BackupCodeFactor {
    pub fn new(config: BackupCodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackupCodeConfig {
        &self.config
    }

    /// Generate a fresh set, replacing any previous one. Returns the
    /// plaintext codes; they are not stored anywhere.
    pub async fn generate(
        &self,
        store: &dyn FactorStore,
        user_id: i64,
        ip: Option<String>,
        now: i64,
    ) -> Result<Vec<String>> {
        let factor = match store.active_factor(user_id, FactorKind::BackupCodes).await? {
            Some(factor) => factor,
            None => {
                let mut factor = UserFactor::new(user_id, FactorKind::BackupCodes, "Backup codes", now);
                factor.confirmed = true;
                factor.created_from_ip = ip;
                store.insert_factor(&factor).await?;
                factor
            }
        };

        let mut plaintext = Vec::with_capacity(self.config.count);
        let mut records = Vec::with_capacity(self.config.count);

        for _ in 0..self.config.count {
            let code = self.generate_code();
            records.push(BackupCodeRecord {
                id: Uuid::new_v4(),
                factor_id: factor.id,
                user_id,
                code_hash: hash_code(&normalize(&code))?,
                used: false,
                created_at: now,
                used_at: None,
            });
            plaintext.push(code);
        }

        store.replace_backup_codes(factor.id, &records).await?;
        tracing::info!(user_id, count = records.len(), "Backup codes regenerated");

        Ok(plaintext)
    }

    /// Check a code and consume it on match.
    pub async fn check(
        &self,
        store: &dyn FactorStore,
        factor: &UserFactor,
        code: &str,
        now: i64,
    ) -> Result<Verdict> {
        let code = normalize(code);
        if code.len() != self.config.length || !code.bytes().all(|b| ALPHABET.contains(&b)) {
            return Ok(Err(CodeRejection::Malformed));
        }

        for record in store.list_backup_codes(factor.id).await? {
            if record.used || !verify_code(&code, &record.code_hash) {
                continue;
            }
            if store.consume_backup_code(record.id, now).await? {
                return Ok(Ok(()));
            }
            return Ok(Err(CodeRejection::AlreadyUsed));
        }

        Ok(Err(CodeRejection::Invalid))
    }

    /// Unused codes left for the user
    pub async fn remaining(&self, store: &dyn FactorStore, user_id: i64) -> Result<usize> {
        let Some(factor) = store.active_factor(user_id, FactorKind::BackupCodes).await? else {
            return Ok(0);
        };
        let codes = store.list_backup_codes(factor.id).await?;
        Ok(codes.iter().filter(|c| !c.used).count())
    }

    pub fn should_regenerate(&self, remaining: usize) -> bool {
        remaining < LOW_CODE_THRESHOLD
    }

    fn generate_code(&self) -> String {
        let mut rng = thread_rng();
        let code: String = (0..self.config.length)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();

        if self.config.use_separators {
            code.chars()
                .collect::<Vec<char>>()
                .chunks(4)
                .map(|chunk| chunk.iter().collect::<String>())
                .collect::<Vec<String>>()
                .join("-")
        } else {
            code
        }
    }
}

/// Upper-case and drop separators and spaces.
fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn hash_code(code: &str) -> Result<String> {
    let salt = SaltString::generate(&mut thread_rng());
    Argon2::default()
        .hash_password(code.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| MfaError::Crypto(e.to_string()))
}

fn verify_code(code: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(code.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable backup code hash skipped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFactorStore;

    fn small() -> BackupCodeFactor {
        BackupCodeFactor::new(BackupCodeConfig {
            count: 4,
            ..Default::default()
        })
    }

    async fn instance(store: &MemoryFactorStore, user_id: i64) -> UserFactor {
        store
            .active_factor(user_id, FactorKind::BackupCodes)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_format() {
        let store = MemoryFactorStore::new();
        let codes = BackupCodeFactor::new(BackupCodeConfig::default())
            .generate(&store, 1, None, 0)
            .await
            .unwrap();

        assert_eq!(codes.len(), 10);
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(code.replace('-', "").bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn test_single_use() {
        let store = MemoryFactorStore::new();
        let factor = small();
        let codes = factor.generate(&store, 1, None, 0).await.unwrap();
        let record = instance(&store, 1).await;

        assert_eq!(factor.check(&store, &record, &codes[0], 10).await.unwrap(), Ok(()));
        assert_eq!(
            factor.check(&store, &record, &codes[0], 20).await.unwrap(),
            Err(CodeRejection::Invalid)
        );
        assert_eq!(factor.remaining(&store, 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_normalization() {
        let store = MemoryFactorStore::new();
        let factor = small();
        let codes = factor.generate(&store, 1, None, 0).await.unwrap();
        let record = instance(&store, 1).await;

        let typed = codes[1].replace('-', " ").to_lowercase();
        assert_eq!(factor.check(&store, &record, &typed, 10).await.unwrap(), Ok(()));
        assert_eq!(
            factor.check(&store, &record, "not-a-code", 10).await.unwrap(),
            Err(CodeRejection::Malformed)
        );
    }

    #[tokio::test]
    async fn test_regeneration_replaces_set() {
        let store = MemoryFactorStore::new();
        let factor = small();
        let old = factor.generate(&store, 1, None, 0).await.unwrap();
        let new = factor.generate(&store, 1, None, 5).await.unwrap();
        let record = instance(&store, 1).await;

        assert_eq!(store.find_factors(1, Some(FactorKind::BackupCodes), true).await.unwrap().len(), 1);
        if !new.contains(&old[0]) {
            assert_eq!(
                factor.check(&store, &record, &old[0], 10).await.unwrap(),
                Err(CodeRejection::Invalid)
            );
        }
        assert_eq!(factor.check(&store, &record, &new[0], 10).await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_low_count_warning() {
        let store = MemoryFactorStore::new();
        let factor = small();
        let codes = factor.generate(&store, 1, None, 0).await.unwrap();
        let record = instance(&store, 1).await;

        assert!(!factor.should_regenerate(factor.remaining(&store, 1).await.unwrap()));
        factor.check(&store, &record, &codes[0], 1).await.unwrap().unwrap();
        factor.check(&store, &record, &codes[1], 2).await.unwrap().unwrap();
        assert!(factor.should_regenerate(factor.remaining(&store, 1).await.unwrap()));
    }
}
