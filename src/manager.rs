//! MFA orchestration
//!
//! [`FactorManager`] ties the factor registry, the store and the session
//! store together: it decides whether a request needs MFA, verifies
//! submitted codes, combines factor states into one login decision and
//! carries out the administrative operations. Any error on the verification
//! and status paths resolves to `Fail`.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEvent, AuditFilter};
use crate::clock::{Clock, SystemClock};
use crate::config::{Aggregation, MfaConfig};
use crate::context::{AuthContext, MfaSession, MfaUser, SessionStore};
use crate::error::{MfaError, Result, StoreError};
use crate::factor::{
    CodeRejection, Factor, FactorInput, FactorKind, FactorRegistry, LogMailer, LogSmsSender,
    Mailer, SendLimit, SmsSender, TotpEnrollment, Verdict,
};
use crate::state::{Attempt, FactorProgress, FactorState, LockPolicy};
use crate::store::{FactorStore, UserFactor};

/// Overall login decision, same lattice as a single factor
pub type AuthStatus = FactorState;

/// Lost compare-and-set rounds tolerated before an attempt is abandoned
const MAX_CAS_RETRIES: usize = 32;

/// Audit history covered by [`FactorManager::get_stats`]
const STATS_WINDOW: i64 = 7 * 24 * 3600;

/// What to do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthGate {
    /// Let the request through
    Allow,
    /// Show the verification page for this factor
    Challenge { factor: FactorKind },
    /// Stop the login
    Denied(AuthStatus),
}

/// Outcome of the redirect check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectDecision {
    NoRedirect,
    Redirect,
}

/// State of one applicable factor during a login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorStatus {
    pub kind: FactorKind,
    pub weight: u32,
    pub state: FactorState,
    /// Takes user input (as opposed to ambient checks like IP ranges)
    pub has_input: bool,
    pub instance: Option<Uuid>,
}

/// Aggregated view of a login in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub status: AuthStatus,
    /// An ambient factor failed; no code can recover the login
    pub vetoed: bool,
    /// Factor the user should be asked for next
    pub next: FactorKind,
    pub factors: Vec<FactorStatus>,
}

/// Counts from a maintenance run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_codes: u64,
    pub purged_factors: u64,
}

/// Audited actions of one factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactorActivity {
    /// `None` for events not tied to a factor, like a completed login
    pub factor: Option<FactorKind>,
    pub total: u64,
    pub successful: u64,
}

/// Site-wide MFA usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MfaStats {
    pub users_with_mfa: u64,
    pub users_by_factor: Vec<(FactorKind, u64)>,
    /// Start of the activity window
    pub activity_since: i64,
    pub recent_activity: Vec<FactorActivity>,
}

#[derive(Debug)]
pub struct FactorManager {
    config: MfaConfig,
    registry: FactorRegistry,
    store: Arc<dyn FactorStore>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    policy: LockPolicy,
    mailer: Arc<dyn Mailer>,
    sms_sender: Arc<dyn SmsSender>,
}

impl FactorManager {
    /// Fails with [`MfaError::Config`] when the configuration does not validate.
    pub fn new(config: MfaConfig, store: Arc<dyn FactorStore>, sessions: Arc<dyn SessionStore>) -> Result<Self> {
        config.validate()?;

        let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);
        let sms_sender: Arc<dyn SmsSender> = Arc::new(LogSmsSender);
        let registry = FactorRegistry::from_config(&config, mailer.clone(), sms_sender.clone());
        let policy = config.lock_policy();
        Ok(Self {
            config,
            registry,
            store,
            sessions,
            clock: Arc::new(SystemClock),
            policy,
            mailer,
            sms_sender,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the mail transport used by the email factor
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self.registry = FactorRegistry::from_config(&self.config, self.mailer.clone(), self.sms_sender.clone());
        self
    }

    /// Replace the gateway used by the SMS factor
    pub fn with_sms_sender(mut self, sender: Arc<dyn SmsSender>) -> Self {
        self.sms_sender = sender;
        self.registry = FactorRegistry::from_config(&self.config, self.mailer.clone(), self.sms_sender.clone());
        self
    }

    pub fn config(&self) -> &MfaConfig {
        &self.config
    }

    pub fn registry(&self) -> &FactorRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn FactorStore> {
        &self.store
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    // login flow

    /// Start a login: clear last login's states and open a fresh session.
    pub async fn begin_login(&self, ctx: &AuthContext) -> Result<()> {
        self.store.reset_states_for_login(ctx.user.id).await?;
        self.sessions
            .save(&ctx.session_id, &MfaSession::new(ctx.user.id))
            .await?;

        tracing::debug!(user_id = ctx.user.id, "MFA login started");
        Ok(())
    }

    /// Whether MFA applies to this user at all
    pub fn is_ready(&self, user: &MfaUser) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.config.exempt_site_admins && user.is_site_admin {
            return false;
        }
        self.registry.any_enabled()
    }

    /// Decide whether the request has to be sent to the MFA page. Updates the
    /// session's redirect bookkeeping.
    pub fn should_require_mfa(&self, ctx: &AuthContext, session: &mut MfaSession) -> Result<RedirectDecision> {
        if !self.is_ready(&ctx.user) || session.authenticated {
            return Ok(RedirectDecision::NoRedirect);
        }
        if self
            .config
            .excluded_paths
            .iter()
            .any(|prefix| ctx.path.starts_with(prefix.as_str()))
        {
            return Ok(RedirectDecision::NoRedirect);
        }
        if ctx.prevent_redirect {
            return Err(MfaError::RedirectPrevented);
        }

        if session.redirect_referer.as_deref() == Some(ctx.path.as_str()) {
            session.redirect_count += 1;
        } else {
            session.redirect_referer = Some(ctx.path.clone());
            session.redirect_count = 1;
        }
        if session.redirect_count >= self.config.redirect_loop_threshold {
            tracing::warn!(
                user_id = ctx.user.id,
                path = %ctx.path,
                count = session.redirect_count,
                "MFA redirect loop detected"
            );
            return Err(MfaError::RedirectLoop);
        }

        if session.wants_url.is_none() {
            session.wants_url = Some(ctx.path.clone());
        }
        Ok(RedirectDecision::Redirect)
    }

    /// Gate a request: allow it, challenge for a factor or deny the login.
    pub async fn require_auth(&self, ctx: &AuthContext) -> Result<AuthGate> {
        let mut session = self
            .sessions
            .load(&ctx.session_id)
            .await?
            .filter(|s| s.user_id == ctx.user.id)
            .unwrap_or_else(|| MfaSession::new(ctx.user.id));

        let decision = self.should_require_mfa(ctx, &mut session);
        self.sessions.save(&ctx.session_id, &session).await?;

        if decision? == RedirectDecision::NoRedirect {
            return Ok(AuthGate::Allow);
        }

        let evaluation = match self.evaluate(ctx).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::error!(user_id = ctx.user.id, error = %e, "MFA status unavailable, denying");
                return Ok(AuthGate::Denied(FactorState::Fail));
            }
        };

        match evaluation.status {
            FactorState::Pass => {
                self.set_pass_state(ctx).await?;
                Ok(AuthGate::Allow)
            }
            FactorState::Locked => Ok(AuthGate::Denied(FactorState::Locked)),
            FactorState::Fail if evaluation.vetoed => Ok(AuthGate::Denied(FactorState::Fail)),
            _ => Ok(AuthGate::Challenge {
                factor: evaluation.next,
            }),
        }
    }

    /// Mark the session as having passed MFA. Returns the page the user
    /// originally asked for.
    pub async fn set_pass_state(&self, ctx: &AuthContext) -> Result<Option<String>> {
        let now = self.clock.now();
        let user_id = ctx.user.id;

        let mut session = self
            .sessions
            .load(&ctx.session_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .unwrap_or_else(|| MfaSession::new(user_id));
        session.authenticated = true;
        session.authenticated_at = Some(now);
        session.redirect_referer = None;
        session.redirect_count = 0;
        let wants_url = session.wants_url.take();
        self.sessions.save(&ctx.session_id, &session).await?;

        self.store.record_pass(user_id, now).await?;
        self.store.reset_lock_counters(user_id).await?;
        self.store.delete_issued_codes(user_id).await?;

        self.audit(AuditEntry::new(user_id, AuditEvent::MfaPassed, true, now).ip(ctx.ip_string()))
            .await?;

        Ok(wants_url)
    }

    // status

    /// Current login decision. Errors resolve to `Fail`.
    pub async fn get_status(&self, ctx: &AuthContext) -> AuthStatus {
        match self.resolve_status(ctx).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(user_id = ctx.user.id, error = %e, "MFA status check failed closed");
                FactorState::Fail
            }
        }
    }

    pub async fn resolve_status(&self, ctx: &AuthContext) -> Result<AuthStatus> {
        Ok(self.evaluate(ctx).await?.status)
    }

    /// Next factor to ask for; the fallback once nothing else is left.
    pub async fn next_login_factor(&self, ctx: &AuthContext) -> Result<FactorKind> {
        Ok(self.evaluate(ctx).await?.next)
    }

    /// Full per-factor view of the login
    pub async fn evaluate(&self, ctx: &AuthContext) -> Result<Evaluation> {
        let factors = self.factor_states(ctx).await?;

        let vetoed = factors
            .iter()
            .any(|f| !f.has_input && f.state == FactorState::Fail);
        let status = if vetoed {
            FactorState::Fail
        } else {
            self.aggregate(&factors)
        };
        let next = factors
            .iter()
            .find(|f| f.has_input && !matches!(f.state, FactorState::Pass | FactorState::Locked))
            .map(|f| f.kind)
            .unwrap_or(FactorKind::Fallback);

        Ok(Evaluation {
            status,
            vetoed,
            next,
            factors,
        })
    }

    /// Applicable factors in evaluation order. Input factors count once the
    /// user has an active instance; ambient factors are computed live.
    async fn factor_states(&self, ctx: &AuthContext) -> Result<Vec<FactorStatus>> {
        let mut states = Vec::new();

        for factor in self.registry.ordered() {
            match factor {
                Factor::Fallback(_) => {}
                Factor::IpRange(iprange) => {
                    let rules = self.store.ip_ranges().await?;
                    states.push(FactorStatus {
                        kind: FactorKind::IpRange,
                        weight: factor.weight(),
                        state: iprange.evaluate(&rules, ctx.ip),
                        has_input: false,
                        instance: None,
                    });
                }
                _ => {
                    if let Some(record) = self.store.active_factor(ctx.user.id, factor.kind()).await? {
                        states.push(FactorStatus {
                            kind: factor.kind(),
                            weight: factor.weight(),
                            state: record.state,
                            has_input: true,
                            instance: Some(record.id),
                        });
                    }
                }
            }
        }

        Ok(states)
    }

    /// In all-required mode backup codes are an alternative to the other
    /// input factors rather than one more factor to pass: a passed backup
    /// code is enough, and an unlocked set keeps a locked login recoverable.
    fn aggregate(&self, factors: &[FactorStatus]) -> AuthStatus {
        let inputs: Vec<&FactorStatus> = factors.iter().filter(|f| f.has_input).collect();

        match self.config.aggregation {
            Aggregation::AllRequired => {
                let (backup, primary): (Vec<&FactorStatus>, Vec<&FactorStatus>) = inputs
                    .iter()
                    .copied()
                    .partition(|f| f.kind == FactorKind::BackupCodes);
                let backup_open = backup.iter().any(|f| f.state != FactorState::Locked);
                let primary_locked = primary.iter().any(|f| f.state == FactorState::Locked);

                if inputs.is_empty() {
                    FactorState::Neutral
                } else if backup.iter().any(|f| f.state == FactorState::Pass) {
                    FactorState::Pass
                } else if !primary.is_empty() && primary.iter().all(|f| f.state == FactorState::Pass) {
                    FactorState::Pass
                } else if !backup_open && (primary_locked || primary.is_empty()) {
                    FactorState::Locked
                } else if inputs.iter().all(|f| f.state == FactorState::Neutral) {
                    FactorState::Neutral
                } else {
                    FactorState::Fail
                }
            }
            Aggregation::Weighted => {
                let passed: u32 = factors
                    .iter()
                    .filter(|f| f.state == FactorState::Pass)
                    .map(|f| f.weight)
                    .sum();

                if passed >= self.config.pass_weight {
                    FactorState::Pass
                } else if inputs.is_empty() {
                    FactorState::Neutral
                } else if inputs.iter().all(|f| f.state == FactorState::Locked) {
                    FactorState::Locked
                } else if inputs
                    .iter()
                    .any(|f| matches!(f.state, FactorState::Fail | FactorState::Locked))
                {
                    FactorState::Fail
                } else {
                    FactorState::Neutral
                }
            }
        }
    }

    // verification

    /// Verify input for one factor and return its new state. Errors resolve
    /// to `Fail`.
    pub async fn verify(&self, ctx: &AuthContext, kind: FactorKind, input: FactorInput<'_>) -> FactorState {
        match self.try_verify(ctx, kind, input).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(
                    user_id = ctx.user.id,
                    factor = %kind,
                    error = %e,
                    "Factor verification failed closed"
                );
                let event = match e {
                    MfaError::Store(_) => AuditEvent::StoreFailure,
                    _ => AuditEvent::VerifyRejected,
                };
                let entry = AuditEntry::new(ctx.user.id, event, false, self.clock.now())
                    .factor(kind)
                    .reason(e.to_string())
                    .ip(ctx.ip_string());
                if let Err(audit_error) = self.audit(entry).await {
                    tracing::error!(error = %audit_error, "Could not record verification failure");
                }
                FactorState::Fail
            }
        }
    }

    async fn try_verify(&self, ctx: &AuthContext, kind: FactorKind, input: FactorInput<'_>) -> Result<FactorState> {
        let factor = self.registry.enabled(kind).ok_or(MfaError::FactorDisabled(kind))?;
        if !factor.has_input() {
            return Err(MfaError::NoInput(kind));
        }

        let user_id = ctx.user.id;
        let record = self
            .store
            .active_factor(user_id, kind)
            .await?
            .ok_or(MfaError::NotConfigured(kind))?;
        let now = self.clock.now();

        if record.state == FactorState::Locked {
            self.audit(
                AuditEntry::new(user_id, AuditEvent::AttemptWhileLocked, false, now)
                    .factor(kind)
                    .ip(ctx.ip_string()),
            )
            .await?;
            return Ok(FactorState::Locked);
        }

        let verdict = self.check_input(factor, &record, user_id, input, now).await?;
        let attempt = match verdict {
            Ok(()) => Attempt::Accepted,
            Err(_) => Attempt::Rejected,
        };
        let progress = self.apply_attempt(&record, attempt).await?;

        let entry = match verdict {
            // a concurrent attempt locked the factor after the code was checked
            Ok(()) if progress.is_locked() => {
                tracing::warn!(user_id, factor = %kind, "Accepted code arrived after lockout");
                AuditEntry::new(user_id, AuditEvent::AttemptWhileLocked, false, now)
                    .reason("code consumed after concurrent lockout")
            }
            Ok(()) => {
                self.store.touch_verified(record.id, now).await?;
                AuditEntry::new(user_id, AuditEvent::VerifySucceeded, true, now)
            }
            Err(rejection) if progress.is_locked() => {
                tracing::warn!(user_id, factor = %kind, "Factor locked after repeated failures");
                AuditEntry::new(user_id, AuditEvent::LockedOut, false, now).reason(rejection.to_string())
            }
            Err(rejection) => {
                AuditEntry::new(user_id, AuditEvent::VerifyFailed, false, now).reason(rejection.to_string())
            }
        };
        self.audit(entry.factor(kind).ip(ctx.ip_string())).await?;

        Ok(progress.state)
    }

    async fn check_input(
        &self,
        factor: &Factor,
        record: &UserFactor,
        user_id: i64,
        input: FactorInput<'_>,
        now: i64,
    ) -> Result<Verdict> {
        let store = self.store.as_ref();

        match (factor, input) {
            (Factor::Totp(totp), FactorInput::Code(code)) => totp.check(store, record, code, now).await,
            (Factor::Email(email), FactorInput::Code(code)) => email.check(store, record, code, now).await,
            (Factor::Sms(sms), FactorInput::Code(code)) => sms.check(store, record, code, now).await,
            (Factor::Email(email), FactorInput::EmailLink { instance, token }) => {
                if instance != record.id {
                    return Ok(Err(CodeRejection::Invalid));
                }
                email.check_link(store, user_id, instance, token, now).await
            }
            (Factor::BackupCodes(backup), FactorInput::Code(code)) => {
                let verdict = backup.check(store, record, code, now).await?;
                if verdict.is_ok() {
                    let remaining = backup.remaining(store, user_id).await?;
                    if backup.should_regenerate(remaining) {
                        tracing::info!(user_id, remaining, "Backup codes running low");
                    }
                }
                Ok(verdict)
            }
            _ => Ok(Err(CodeRejection::Malformed)),
        }
    }

    /// Apply an attempt with compare-and-set, re-reading after a lost race.
    async fn apply_attempt(&self, record: &UserFactor, attempt: Attempt) -> Result<FactorProgress> {
        let mut current = record.progress();

        for _ in 0..MAX_CAS_RETRIES {
            let next = current.apply(attempt, &self.policy);
            if next == current {
                return Ok(current);
            }
            if self
                .store
                .compare_and_set_progress(record.id, current, next)
                .await?
            {
                return Ok(next);
            }
            current = self
                .store
                .get_factor(record.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("factor {}", record.id)))?
                .progress();
        }

        Err(StoreError::Conflict(format!("factor {} is updated concurrently", record.id)).into())
    }

    // setup

    /// Start TOTP setup for the user.
    pub async fn setup_totp(&self, ctx: &AuthContext, label: &str) -> Result<TotpEnrollment> {
        let totp = self.enabled_totp()?;
        let now = self.clock.now();
        let enrollment = totp
            .setup(self.store.as_ref(), &ctx.user, label, ctx.ip_string(), now)
            .await?;

        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::FactorSetup, true, now)
                .factor(FactorKind::Totp)
                .ip(ctx.ip_string()),
        )
        .await?;
        Ok(enrollment)
    }

    /// Confirm a pending TOTP instance with its first code.
    pub async fn confirm_totp(&self, ctx: &AuthContext, factor_id: Uuid, code: &str) -> Result<Verdict> {
        let totp = self.enabled_totp()?;
        let now = self.clock.now();
        let verdict = totp
            .confirm(self.store.as_ref(), ctx.user.id, factor_id, code, now)
            .await?;

        let entry = match verdict {
            Ok(()) => AuditEntry::new(ctx.user.id, AuditEvent::FactorConfirmed, true, now),
            Err(rejection) => {
                AuditEntry::new(ctx.user.id, AuditEvent::FactorConfirmed, false, now).reason(rejection.to_string())
            }
        };
        self.audit(entry.factor(FactorKind::Totp).ip(ctx.ip_string())).await?;
        Ok(verdict)
    }

    /// Register the user's email address as a factor.
    pub async fn setup_email(&self, ctx: &AuthContext) -> Result<UserFactor> {
        let email = self
            .registry
            .email()
            .filter(|f| f.config().enabled)
            .ok_or(MfaError::FactorDisabled(FactorKind::Email))?;
        let now = self.clock.now();
        let factor = email
            .setup(self.store.as_ref(), &ctx.user, ctx.ip_string(), now)
            .await?;

        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::FactorSetup, true, now)
                .factor(FactorKind::Email)
                .ip(ctx.ip_string()),
        )
        .await?;
        Ok(factor)
    }

    /// Mail a fresh code to the user's email factor.
    pub async fn send_email_code(&self, ctx: &AuthContext) -> Result<Uuid> {
        let email = self
            .registry
            .email()
            .filter(|f| f.config().enabled)
            .ok_or(MfaError::FactorDisabled(FactorKind::Email))?;
        let factor = self
            .store
            .active_factor(ctx.user.id, FactorKind::Email)
            .await?
            .ok_or(MfaError::NotConfigured(FactorKind::Email))?;
        if factor.state == FactorState::Locked {
            return Err(MfaError::Delivery("email factor is locked".to_string()));
        }

        let now = self.clock.now();
        self.check_send_limit(ctx, FactorKind::Email, &email.config().send_limit, now)
            .await?;
        let code_id = email
            .issue_code(self.store.as_ref(), &factor, ctx.ip_string(), now)
            .await?;

        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::CodeIssued, true, now)
                .factor(FactorKind::Email)
                .ip(ctx.ip_string()),
        )
        .await?;
        Ok(code_id)
    }

    /// Register a phone number and text it the confirmation code. The
    /// returned instance stays pending until [`confirm_sms`](Self::confirm_sms).
    pub async fn setup_sms(&self, ctx: &AuthContext, phone: &str) -> Result<UserFactor> {
        let sms = self.enabled_sms()?;
        let now = self.clock.now();
        self.check_send_limit(ctx, FactorKind::Sms, &sms.config().send_limit, now)
            .await?;

        let factor = sms
            .setup(self.store.as_ref(), &ctx.user, phone, ctx.ip_string(), now)
            .await?;
        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::FactorSetup, true, now)
                .factor(FactorKind::Sms)
                .ip(ctx.ip_string()),
        )
        .await?;

        sms.issue_code(self.store.as_ref(), &factor, ctx.ip_string(), now)
            .await?;
        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::CodeIssued, true, now)
                .factor(FactorKind::Sms)
                .ip(ctx.ip_string()),
        )
        .await?;
        Ok(factor)
    }

    /// Confirm a pending SMS instance with the code sent at setup.
    pub async fn confirm_sms(&self, ctx: &AuthContext, factor_id: Uuid, code: &str) -> Result<Verdict> {
        let sms = self.enabled_sms()?;
        let now = self.clock.now();
        let verdict = sms
            .confirm(self.store.as_ref(), ctx.user.id, factor_id, code, now)
            .await?;

        let entry = match verdict {
            Ok(()) => AuditEntry::new(ctx.user.id, AuditEvent::FactorConfirmed, true, now),
            Err(rejection) => {
                AuditEntry::new(ctx.user.id, AuditEvent::FactorConfirmed, false, now).reason(rejection.to_string())
            }
        };
        self.audit(entry.factor(FactorKind::Sms).ip(ctx.ip_string())).await?;
        Ok(verdict)
    }

    /// Text a fresh code to the user's SMS factor.
    pub async fn send_sms_code(&self, ctx: &AuthContext) -> Result<Uuid> {
        let sms = self.enabled_sms()?;
        let factor = self
            .store
            .active_factor(ctx.user.id, FactorKind::Sms)
            .await?
            .ok_or(MfaError::NotConfigured(FactorKind::Sms))?;
        if factor.state == FactorState::Locked {
            return Err(MfaError::Delivery("sms factor is locked".to_string()));
        }

        let now = self.clock.now();
        self.check_send_limit(ctx, FactorKind::Sms, &sms.config().send_limit, now)
            .await?;
        let code_id = sms
            .issue_code(self.store.as_ref(), &factor, ctx.ip_string(), now)
            .await?;

        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::CodeIssued, true, now)
                .factor(FactorKind::Sms)
                .ip(ctx.ip_string()),
        )
        .await?;
        Ok(code_id)
    }

    /// Refuse to send when the user already got `limit.count` codes of
    /// this kind inside the window. Sends are counted from the audit log.
    async fn check_send_limit(&self, ctx: &AuthContext, kind: FactorKind, limit: &SendLimit, now: i64) -> Result<()> {
        let sent = self
            .store
            .audit_entries(&AuditFilter {
                factor: Some(kind),
                event: Some(AuditEvent::CodeIssued),
                success: Some(true),
                since: Some(limit.window_start(now)),
                ..AuditFilter::for_user(ctx.user.id)
            })
            .await?;

        let Some(retry_after) = limit.retry_after(sent.iter().map(|e| e.created_at), now) else {
            return Ok(());
        };

        tracing::warn!(user_id = ctx.user.id, factor = %kind, retry_after, "Code send rate limit reached");
        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::CodeIssued, false, now)
                .factor(kind)
                .reason(format!("rate limited, retry in {}s", retry_after))
                .ip(ctx.ip_string()),
        )
        .await?;
        Err(MfaError::RateLimited { retry_after })
    }

    /// Generate a new set of backup codes, replacing the old set.
    pub async fn generate_backup_codes(&self, ctx: &AuthContext) -> Result<Vec<String>> {
        let backup = self
            .registry
            .backup_codes()
            .filter(|f| f.config().enabled)
            .ok_or(MfaError::FactorDisabled(FactorKind::BackupCodes))?;
        let now = self.clock.now();
        let codes = backup
            .generate(self.store.as_ref(), ctx.user.id, ctx.ip_string(), now)
            .await?;

        self.audit(
            AuditEntry::new(ctx.user.id, AuditEvent::FactorSetup, true, now)
                .factor(FactorKind::BackupCodes)
                .ip(ctx.ip_string()),
        )
        .await?;
        Ok(codes)
    }

    pub async fn backup_codes_remaining(&self, user_id: i64) -> Result<usize> {
        match self.registry.backup_codes() {
            Some(backup) => backup.remaining(self.store.as_ref(), user_id).await,
            None => Ok(0),
        }
    }

    fn enabled_totp(&self) -> Result<&crate::factor::TotpFactor> {
        self.registry
            .totp()
            .filter(|f| f.config().enabled)
            .ok_or(MfaError::FactorDisabled(FactorKind::Totp))
    }

    fn enabled_sms(&self) -> Result<&crate::factor::SmsFactor> {
        self.registry
            .sms()
            .filter(|f| f.config().enabled)
            .ok_or(MfaError::FactorDisabled(FactorKind::Sms))
    }

    // email links

    /// Handle a "this wasn't me" link: revoke the email factor and end the
    /// user's sessions. Returns false when the link is not valid.
    pub async fn revoke_by_email_link(&self, instance: Uuid, token: &str, ip: Option<String>) -> Result<bool> {
        let email = self
            .registry
            .email()
            .ok_or(MfaError::FactorDisabled(FactorKind::Email))?;
        let now = self.clock.now();

        let factor = match email
            .check_revocation(self.store.as_ref(), instance, token, now)
            .await?
        {
            Ok(factor) => factor,
            Err(rejection) => {
                tracing::warn!(instance = %instance, reason = %rejection, "Rejected email revocation link");
                return Ok(false);
            }
        };

        let user_id = factor.user_id;
        self.store.revoke_factors(user_id, FactorKind::Email).await?;
        self.store.delete_issued_codes(user_id).await?;
        let ended = self.sessions.destroy_user_sessions(user_id).await?;

        let mut entry = AuditEntry::new(user_id, AuditEvent::LinkRevoked, true, now)
            .factor(FactorKind::Email)
            .ip(ip);
        if email.config().suspend_on_revoke {
            entry = entry.reason("account suspension requested");
        }
        self.audit(entry).await?;

        tracing::warn!(user_id, sessions = ended, "Email factor revoked through link");
        Ok(true)
    }

    // administration

    /// True if the user has an active instance of any enabled input factor
    pub async fn user_has_setup_factors(&self, user_id: i64) -> Result<bool> {
        for factor in self.registry.ordered() {
            if !factor.has_input() {
                continue;
            }
            if self.store.active_factor(user_id, factor.kind()).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every instance of the user, revoked ones included
    pub async fn user_factors(&self, user_id: i64) -> Result<Vec<UserFactor>> {
        Ok(self.store.find_factors(user_id, None, true).await?)
    }

    /// Revoke one instance owned by the user.
    pub async fn revoke_factor(&self, user_id: i64, factor_id: Uuid) -> Result<bool> {
        let factor = self
            .store
            .get_factor(factor_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("factor {}", factor_id)))?;
        if factor.user_id != user_id {
            return Err(MfaError::WrongUser);
        }

        let revoked = self.store.revoke_factor(factor_id).await?;
        if revoked {
            self.audit(
                AuditEntry::new(user_id, AuditEvent::FactorRevoked, true, self.clock.now()).factor(factor.kind),
            )
            .await?;
        }
        Ok(revoked)
    }

    /// Revoke all instances of one kind, or of every kind.
    pub async fn revoke_all_factors(&self, user_id: i64, kind: Option<FactorKind>) -> Result<u64> {
        let kinds: Vec<FactorKind> = match kind {
            Some(kind) => vec![kind],
            None => FactorKind::ALL.to_vec(),
        };

        let now = self.clock.now();
        let mut total = 0;
        for kind in kinds {
            let count = self.store.revoke_factors(user_id, kind).await?;
            if count > 0 {
                self.audit(
                    AuditEntry::new(user_id, AuditEvent::FactorRevoked, true, now)
                        .factor(kind)
                        .reason(format!("{} instance(s)", count)),
                )
                .await?;
            }
            total += count;
        }
        Ok(total)
    }

    /// Clear a lock and its counter.
    pub async fn unlock_factor(&self, user_id: i64, kind: FactorKind) -> Result<bool> {
        let Some(factor) = self.store.active_factor(user_id, kind).await? else {
            return Ok(false);
        };

        let unlocked = self
            .store
            .set_progress(factor.id, FactorProgress::unlock())
            .await?;
        if unlocked {
            self.audit(AuditEntry::new(user_id, AuditEvent::FactorUnlocked, true, self.clock.now()).factor(kind))
                .await?;
            tracing::info!(user_id, factor = %kind, "Factor unlocked");
        }
        Ok(unlocked)
    }

    pub async fn audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        Ok(self.store.audit_entries(filter).await?)
    }

    pub async fn last_pass(&self, user_id: i64) -> Result<Option<i64>> {
        Ok(self.store.last_pass(user_id).await?)
    }

    /// Users per factor and the last seven days of audited activity
    pub async fn get_stats(&self) -> Result<MfaStats> {
        let usage = self.store.factor_usage().await?;
        let activity_since = self.clock.now() - STATS_WINDOW;
        let entries = self
            .store
            .audit_entries(&AuditFilter {
                since: Some(activity_since),
                ..Default::default()
            })
            .await?;

        let mut recent_activity: Vec<FactorActivity> = Vec::new();
        for entry in &entries {
            let index = match recent_activity.iter().position(|a| a.factor == entry.factor) {
                Some(index) => index,
                None => {
                    recent_activity.push(FactorActivity {
                        factor: entry.factor,
                        total: 0,
                        successful: 0,
                    });
                    recent_activity.len() - 1
                }
            };
            recent_activity[index].total += 1;
            if entry.success {
                recent_activity[index].successful += 1;
            }
        }
        recent_activity.sort_by_key(|a| {
            a.factor
                .and_then(|f| FactorKind::ALL.iter().position(|k| *k == f))
                .unwrap_or(usize::MAX)
        });

        Ok(MfaStats {
            users_with_mfa: usage.users_with_factors,
            users_by_factor: usage.users_by_kind,
            activity_since,
            recent_activity,
        })
    }

    /// Drop expired email and SMS codes. With `purge_disabled`, also delete every
    /// instance of factors that are switched off.
    pub async fn cleanup_expired(&self, purge_disabled: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            expired_codes: self.store.delete_expired_codes(self.clock.now()).await?,
            purged_factors: 0,
        };

        if purge_disabled {
            for factor in self.registry.all() {
                if factor.has_input() && !factor.enabled() {
                    report.purged_factors += self.store.delete_factors(factor.kind()).await?;
                }
            }
        }

        tracing::info!(
            expired_codes = report.expired_codes,
            purged_factors = report.purged_factors,
            "MFA cleanup finished"
        );
        Ok(report)
    }

    async fn audit(&self, entry: AuditEntry) -> Result<()> {
        entry.trace();
        self.store.append_audit(&entry).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::MemorySessionStore;
    use crate::store::MemoryFactorStore;
    use crate::totp::{TotpGenerator, TotpSecret};

    const NOW: i64 = 1_700_000_000;

    fn manager(config: MfaConfig) -> (FactorManager, MemoryFactorStore) {
        let store = MemoryFactorStore::new();
        let manager = FactorManager::new(config, Arc::new(store.clone()), Arc::new(MemorySessionStore::new()))
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(NOW)));
        (manager, store)
    }

    fn ctx() -> AuthContext {
        AuthContext::new(MfaUser::new(7, "alice"), "session-1").with_path("/course/view.php")
    }

    async fn enrolled_totp(manager: &FactorManager) -> TotpSecret {
        let enrollment = manager.setup_totp(&ctx(), "phone").await.unwrap();
        let secret = TotpSecret::from_base32(&enrollment.secret).unwrap();
        let code = TotpGenerator::new(manager.config().totp.clone())
            .code_for_time(&secret, NOW - 30)
            .unwrap();
        manager
            .confirm_totp(&ctx(), enrollment.factor.id, &code)
            .await
            .unwrap()
            .unwrap();
        manager.begin_login(&ctx()).await.unwrap();
        secret
    }

    fn status(kind: FactorKind, weight: u32, state: FactorState, has_input: bool) -> FactorStatus {
        FactorStatus {
            kind,
            weight,
            state,
            has_input,
            instance: None,
        }
    }

    #[test]
    fn test_all_required_aggregation() {
        let (manager, _) = manager(MfaConfig::default());
        let pass = status(FactorKind::Totp, 100, FactorState::Pass, true);
        let neutral = status(FactorKind::Email, 50, FactorState::Neutral, true);
        let locked = status(FactorKind::Email, 50, FactorState::Locked, true);

        assert_eq!(manager.aggregate(&[]), FactorState::Neutral);
        assert_eq!(manager.aggregate(&[pass.clone()]), FactorState::Pass);
        assert_eq!(manager.aggregate(&[neutral.clone()]), FactorState::Neutral);
        assert_eq!(manager.aggregate(&[pass.clone(), neutral]), FactorState::Fail);
        assert_eq!(manager.aggregate(&[pass, locked]), FactorState::Locked);
    }

    #[test]
    fn test_backup_codes_are_an_alternative() {
        let (manager, _) = manager(MfaConfig::default());
        let totp = |state| status(FactorKind::Totp, 100, state, true);
        let backup = |state| status(FactorKind::BackupCodes, 100, state, true);

        // unused backup codes do not hold up a passed login
        assert_eq!(
            manager.aggregate(&[totp(FactorState::Pass), backup(FactorState::Neutral)]),
            FactorState::Pass
        );
        assert_eq!(
            manager.aggregate(&[totp(FactorState::Neutral), backup(FactorState::Pass)]),
            FactorState::Pass
        );
        assert_eq!(
            manager.aggregate(&[totp(FactorState::Neutral), backup(FactorState::Neutral)]),
            FactorState::Neutral
        );
        // a locked authenticator can still be recovered with a backup code
        assert_eq!(
            manager.aggregate(&[totp(FactorState::Locked), backup(FactorState::Neutral)]),
            FactorState::Fail
        );
        assert_eq!(
            manager.aggregate(&[totp(FactorState::Locked), backup(FactorState::Locked)]),
            FactorState::Locked
        );
        assert_eq!(manager.aggregate(&[backup(FactorState::Locked)]), FactorState::Locked);
        assert_eq!(
            manager.aggregate(&[totp(FactorState::Fail), backup(FactorState::Locked)]),
            FactorState::Fail
        );
    }

    #[test]
    fn test_weighted_aggregation() {
        let (manager, _) = manager(MfaConfig {
            aggregation: Aggregation::Weighted,
            ..MfaConfig::default()
        });
        let email_pass = status(FactorKind::Email, 50, FactorState::Pass, true);
        let ip_pass = status(FactorKind::IpRange, 50, FactorState::Pass, false);
        let totp_locked = status(FactorKind::Totp, 100, FactorState::Locked, true);

        assert_eq!(manager.aggregate(&[email_pass.clone()]), FactorState::Neutral);
        assert_eq!(manager.aggregate(&[email_pass, ip_pass]), FactorState::Pass);
        assert_eq!(manager.aggregate(&[totp_locked.clone()]), FactorState::Locked);
        assert_eq!(
            manager.aggregate(&[totp_locked, status(FactorKind::Email, 50, FactorState::Neutral, true)]),
            FactorState::Fail
        );
    }

    #[tokio::test]
    async fn test_verify_passes_and_audits() {
        let (manager, store) = manager(MfaConfig::default());
        let secret = enrolled_totp(&manager).await;
        let code = TotpGenerator::new(manager.config().totp.clone())
            .code_for_time(&secret, NOW)
            .unwrap();

        let state = manager.verify(&ctx(), FactorKind::Totp, FactorInput::Code(&code)).await;
        assert_eq!(state, FactorState::Pass);
        assert_eq!(manager.get_status(&ctx()).await, FactorState::Pass);

        let entries = store.audit_entries(&AuditFilter::for_user(7)).await.unwrap();
        assert_eq!(entries[0].event, AuditEvent::VerifySucceeded);
    }

    #[tokio::test]
    async fn test_verify_without_instance_fails_closed() {
        let (manager, _) = manager(MfaConfig::default());
        let state = manager
            .verify(&ctx(), FactorKind::Totp, FactorInput::Code("123456"))
            .await;
        assert_eq!(state, FactorState::Fail);
    }

    #[tokio::test]
    async fn test_rejected_verify_is_not_a_store_failure() {
        let (manager, store) = manager(MfaConfig::default());
        manager
            .verify(&ctx(), FactorKind::Totp, FactorInput::Code("123456"))
            .await;
        manager
            .verify(&ctx(), FactorKind::Sms, FactorInput::Code("123456"))
            .await;

        let entries = store.audit_entries(&AuditFilter::for_user(7)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.event == AuditEvent::VerifyRejected));
        let disabled = MfaError::FactorDisabled(FactorKind::Sms).to_string();
        assert!(entries.iter().any(|e| e.reason.as_deref() == Some(disabled.as_str())));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = MfaConfig::default();
        config.totp.period = 0;
        let result = FactorManager::new(config, Arc::new(MemoryFactorStore::new()), Arc::new(MemorySessionStore::new()));
        assert!(matches!(result, Err(MfaError::Config(_))));
    }

    #[tokio::test]
    async fn test_stats_count_users_and_activity() {
        let (manager, _) = manager(MfaConfig::default());
        let secret = enrolled_totp(&manager).await;
        let code = TotpGenerator::new(manager.config().totp.clone())
            .code_for_time(&secret, NOW)
            .unwrap();
        manager.verify(&ctx(), FactorKind::Totp, FactorInput::Code(&code)).await;
        manager.verify(&ctx(), FactorKind::Totp, FactorInput::Code("000000")).await;

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.users_with_mfa, 1);
        assert_eq!(stats.users_by_factor, vec![(FactorKind::Totp, 1)]);
        assert_eq!(stats.activity_since, NOW - 7 * 24 * 3600);

        let totp = &stats.recent_activity[0];
        assert_eq!(totp.factor, Some(FactorKind::Totp));
        // setup, confirmation, one pass and one failure
        assert_eq!(totp.total, 4);
        assert_eq!(totp.successful, 3);
    }

    #[tokio::test]
    async fn test_no_enrolled_factor_falls_back() {
        let (manager, _) = manager(MfaConfig::default());
        assert_eq!(manager.next_login_factor(&ctx()).await.unwrap(), FactorKind::Fallback);
        assert_eq!(
            manager.require_auth(&ctx()).await.unwrap(),
            AuthGate::Challenge {
                factor: FactorKind::Fallback
            }
        );
    }

    #[tokio::test]
    async fn test_excluded_paths_skip_mfa() {
        let (manager, _) = manager(MfaConfig::default());
        let mut session = MfaSession::new(7);
        let ctx = ctx().with_path("/login/logout.php");
        assert_eq!(
            manager.should_require_mfa(&ctx, &mut session).unwrap(),
            RedirectDecision::NoRedirect
        );
        assert_eq!(session.redirect_count, 0);
    }

    #[tokio::test]
    async fn test_prevent_redirect_is_an_error() {
        let (manager, _) = manager(MfaConfig::default());
        let mut session = MfaSession::new(7);
        let mut ctx = ctx();
        ctx.prevent_redirect = true;
        assert!(matches!(
            manager.should_require_mfa(&ctx, &mut session),
            Err(MfaError::RedirectPrevented)
        ));
    }

    #[tokio::test]
    async fn test_exempt_site_admin() {
        let (manager, _) = manager(MfaConfig {
            exempt_site_admins: true,
            ..MfaConfig::default()
        });
        assert!(!manager.is_ready(&MfaUser::new(1, "admin").site_admin()));
        assert!(manager.is_ready(&MfaUser::new(2, "editor")));
    }
}
