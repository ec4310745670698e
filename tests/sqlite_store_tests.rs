//! SQLite store integration tests
//!
//! Runs the store contract and a full login against a database file.

use std::sync::Arc;

use nexo_mfa::audit::{AuditEntry, AuditEvent, AuditFilter};
use nexo_mfa::clock::ManualClock;
use nexo_mfa::factor::MemoryMailer;
use nexo_mfa::state::FactorProgress;
use nexo_mfa::store::{BackupCodeRecord, IpRangeRule, IpRuleKind, IssuedCode, UserFactor};
use nexo_mfa::totp::{TotpGenerator, TotpSecret};
use nexo_mfa::{
    AuthContext, AuthGate, FactorInput, FactorKind, FactorManager, FactorState, FactorStore,
    MemorySessionStore, MfaConfig, MfaUser, SqliteFactorStore,
};
use tempfile::TempDir;
use uuid::Uuid;

async fn open(dir: &TempDir) -> SqliteFactorStore {
    let url = format!("sqlite://{}", dir.path().join("mfa.db").display());
    let store = SqliteFactorStore::connect(&url, 4).await.unwrap();
    store.run_migrations().await.unwrap();
    store
}

fn confirmed(user_id: i64, kind: FactorKind, created_at: i64) -> UserFactor {
    let mut factor = UserFactor::new(user_id, kind, kind.name(), created_at);
    factor.confirmed = true;
    factor
}

#[tokio::test]
async fn test_compare_and_set_progress() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let factor = confirmed(1, FactorKind::Totp, 100);
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
async fn test_login_reset_keeps_locks() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let locked = confirmed(1, FactorKind::Totp, 100);
    let failed = confirmed(1, FactorKind::Email, 100);
    store.insert_factor(&locked).await.unwrap();
    store.insert_factor(&failed).await.unwrap();
    store
        .set_progress(locked.id, FactorProgress::new(FactorState::Locked, 10))
        .await
        .unwrap();
    store
        .set_progress(failed.id, FactorProgress::new(FactorState::Fail, 3))
        .await
        .unwrap();

    store.reset_states_for_login(1).await.unwrap();
    assert_eq!(
        store.get_factor(locked.id).await.unwrap().unwrap().state,
        FactorState::Locked
    );
    let email = store.get_factor(failed.id).await.unwrap().unwrap();
    assert_eq!(email.progress(), FactorProgress::new(FactorState::Neutral, 3));

    store.reset_lock_counters(1).await.unwrap();
    assert_eq!(store.get_factor(failed.id).await.unwrap().unwrap().lock_counter, 0);
    assert_eq!(store.get_factor(locked.id).await.unwrap().unwrap().lock_counter, 10);
}

#[tokio::test]
async fn test_totp_counter_only_moves_forward() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let factor = confirmed(1, FactorKind::Totp, 100);
    store.insert_factor(&factor).await.unwrap();

    assert!(store.advance_totp_counter(factor.id, 50).await.unwrap());
    assert!(!store.advance_totp_counter(factor.id, 50).await.unwrap());
    assert!(!store.advance_totp_counter(factor.id, 49).await.unwrap());
    assert!(store.advance_totp_counter(factor.id, 51).await.unwrap());
}

#[tokio::test]
async fn test_backup_code_consumed_once() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let factor = confirmed(1, FactorKind::BackupCodes, 100);
    store.insert_factor(&factor).await.unwrap();

    let code = BackupCodeRecord {
        id: Uuid::new_v4(),
        factor_id: factor.id,
        user_id: 1,
        code_hash: "$argon2id$placeholder".to_string(),
        used: false,
        created_at: 100,
        used_at: None,
    };
    store.replace_backup_codes(factor.id, &[code.clone()]).await.unwrap();

    assert!(store.consume_backup_code(code.id, 200).await.unwrap());
    assert!(!store.consume_backup_code(code.id, 201).await.unwrap());

    let codes = store.list_backup_codes(factor.id).await.unwrap();
    assert!(codes[0].used);
    assert_eq!(codes[0].used_at, Some(200));
}

#[tokio::test]
async fn test_issued_codes_replace_and_expire() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let factor = confirmed(1, FactorKind::Email, 100);
    store.insert_factor(&factor).await.unwrap();

    let record = |created_at: i64| IssuedCode {
        id: Uuid::new_v4(),
        factor_id: factor.id,
        user_id: 1,
        code_hash: "hash".to_string(),
        salt: "salt".to_string(),
        link_token_hash: "token".to_string(),
        created_at,
        expires_at: created_at + 1800,
        attempts: 0,
        used: false,
        created_from_ip: None,
    };

    let first = record(100);
    let second = record(200);
    store.replace_issued_code(&first).await.unwrap();
    store.replace_issued_code(&second).await.unwrap();

    let latest = store.latest_issued_code(factor.id).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
    assert_eq!(store.record_code_attempt(second.id).await.unwrap(), 1);
    assert_eq!(store.record_code_attempt(second.id).await.unwrap(), 2);

    assert_eq!(store.delete_expired_codes(2000).await.unwrap(), 0);
    assert_eq!(store.delete_expired_codes(2001).await.unwrap(), 1);
    assert!(store.latest_issued_code(factor.id).await.unwrap().is_none());

    // a used code and its same-second replacement: the replacement wins
    let used = record(3000);
    store.replace_issued_code(&used).await.unwrap();
    assert!(store.consume_issued_code(used.id).await.unwrap());
    let fresh = record(3000);
    store.replace_issued_code(&fresh).await.unwrap();
    let latest = store.latest_issued_code(factor.id).await.unwrap().unwrap();
    assert_eq!(latest.id, fresh.id);
    assert!(!latest.used);
}

#[tokio::test]
async fn test_ip_range_toggle() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let rule = IpRangeRule::new("192.0.2.0/24".parse().unwrap(), IpRuleKind::Deny, "lab", 100);
    store.add_ip_range(&rule).await.unwrap();
    assert!(store.ip_ranges().await.unwrap()[0].enabled);

    assert!(store.set_ip_range_enabled(rule.id, false).await.unwrap());
    let stored = store.ip_ranges().await.unwrap();
    assert_eq!(stored[0].id, rule.id);
    assert!(!stored[0].enabled);

    assert!(!store.set_ip_range_enabled(Uuid::new_v4(), true).await.unwrap());
}

#[tokio::test]
async fn test_factor_usage() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    for factor in [
        confirmed(1, FactorKind::Totp, 100),
        confirmed(1, FactorKind::Email, 100),
        confirmed(2, FactorKind::Email, 100),
        UserFactor::new(3, FactorKind::Totp, "pending", 100),
    ] {
        store.insert_factor(&factor).await.unwrap();
    }

    let usage = store.factor_usage().await.unwrap();
    assert_eq!(usage.users_with_factors, 2);
    assert_eq!(
        usage.users_by_kind,
        vec![(FactorKind::Totp, 1), (FactorKind::Email, 2)]
    );
}

#[tokio::test]
async fn test_audit_log_survives_reconnect() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir).await;
        store
            .append_audit(
                &AuditEntry::new(9, AuditEvent::VerifyFailed, false, 100)
                    .factor(FactorKind::Email)
                    .reason("invalid code"),
            )
            .await
            .unwrap();
        store
            .append_audit(&AuditEntry::new(9, AuditEvent::MfaPassed, true, 200))
            .await
            .unwrap();
        store.pool().close().await;
    }

    let store = open(&dir).await;
    let entries = store.audit_entries(&AuditFilter::for_user(9)).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].event, AuditEvent::MfaPassed);
    assert_eq!(entries[1].factor, Some(FactorKind::Email));
    assert_eq!(entries[1].reason.as_deref(), Some("invalid code"));
}

#[tokio::test]
async fn test_full_login_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let clock = Arc::new(ManualClock::new(1_700_000_010));
    let manager = FactorManager::new(
        MfaConfig::default(),
        Arc::new(store.clone()),
        Arc::new(MemorySessionStore::new()),
    )
    .unwrap()
    .with_clock(clock.clone())
    .with_mailer(Arc::new(MemoryMailer::new()));

    let ctx = AuthContext::new(MfaUser::new(5, "carol"), "session-carol").with_path("/my/");
    let enrollment = manager.setup_totp(&ctx, "phone").await.unwrap();
    let secret = TotpSecret::from_base32(&enrollment.secret).unwrap();
    let generator = TotpGenerator::new(manager.config().totp.clone());

    let code = generator.code_for_time(&secret, manager.now()).unwrap();
    manager
        .confirm_totp(&ctx, enrollment.factor.id, &code)
        .await
        .unwrap()
        .unwrap();

    clock.advance(30);
    manager.begin_login(&ctx).await.unwrap();
    assert_eq!(
        manager.require_auth(&ctx).await.unwrap(),
        AuthGate::Challenge {
            factor: FactorKind::Totp
        }
    );

    let code = generator.code_for_time(&secret, manager.now()).unwrap();
    assert_eq!(
        manager.verify(&ctx, FactorKind::Totp, FactorInput::Code(&code)).await,
        FactorState::Pass
    );
    assert_eq!(manager.require_auth(&ctx).await.unwrap(), AuthGate::Allow);
    assert_eq!(store.last_pass(5).await.unwrap(), Some(manager.now()));
}

#[tokio::test]
async fn test_concurrent_failures_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let manager = Arc::new(
        FactorManager::new(
            MfaConfig::default(),
            Arc::new(store.clone()),
            Arc::new(MemorySessionStore::new()),
        )
        .unwrap(),
    );

    let mut factor = confirmed(6, FactorKind::BackupCodes, 100);
    factor.label = "Backup codes".to_string();
    store.insert_factor(&factor).await.unwrap();

    let ctx = AuthContext::new(MfaUser::new(6, "dave"), "session-dave");
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                manager
                    .verify(&ctx, FactorKind::BackupCodes, FactorInput::Code("AAAA-BBBB"))
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), FactorState::Fail);
    }

    let stored = store.get_factor(factor.id).await.unwrap().unwrap();
    assert_eq!(stored.lock_counter, 4);
}
