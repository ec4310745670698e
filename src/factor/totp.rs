//! Authenticator app factor

use crate::context::MfaUser;
use crate::error::{MfaError, Result};
use crate::factor::{CodeRejection, FactorKind, Verdict};
use crate::store::{FactorStore, UserFactor};
use crate::totp::{self, TotpConfig, TotpGenerator, TotpSecret};
use uuid::Uuid;

/// Result of starting TOTP setup
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    /// Unconfirmed instance
    pub factor: UserFactor,
    /// Base32 secret for manual entry
    pub secret: String,
    pub uri: String,
    pub qr_svg: String,
}

#[derive(Debug, Clone)]
pub struct TotpFactor {
    generator: TotpGenerator,
    issuer: String,
}

impl TotpFactor {
    pub fn new(config: TotpConfig, issuer: impl Into<String>) -> Self {
        Self {
            generator: TotpGenerator::new(config),
            issuer: issuer.into(),
        }
    }

    pub fn config(&self) -> &TotpConfig {
        self.generator.config()
    }

    pub fn generator(&self) -> &TotpGenerator {
        &self.generator
    }

    /// Create an unconfirmed instance with a fresh secret.
    pub async fn setup(
        &self,
        store: &dyn FactorStore,
        user: &MfaUser,
        label: &str,
        ip: Option<String>,
        now: i64,
    ) -> Result<TotpEnrollment> {
        let secret = TotpSecret::generate(self.config().secret_bytes);
        let encoded = secret.to_base32();

        let mut factor = UserFactor::new(user.id, FactorKind::Totp, label, now);
        factor.secret = Some(encoded.clone());
        factor.created_from_ip = ip;
        store.insert_factor(&factor).await?;

        let account = format!("{}@{}", user.username, self.issuer);
        let uri = totp::provisioning_uri(&secret, &account, &self.issuer);
        let qr_svg = totp::qr_svg(&uri)?;

        tracing::debug!(user_id = user.id, factor_id = %factor.id, "TOTP setup started");

        Ok(TotpEnrollment {
            factor,
            secret: encoded,
            uri,
            qr_svg,
        })
    }

    /// Confirm a pending instance with its first code. The confirmed instance
    /// replaces any earlier TOTP instance of the user.
    pub async fn confirm(
        &self,
        store: &dyn FactorStore,
        user_id: i64,
        factor_id: Uuid,
        code: &str,
        now: i64,
    ) -> Result<Verdict> {
        let factor = store
            .get_factor(factor_id)
            .await?
            .ok_or(MfaError::NotConfigured(FactorKind::Totp))?;
        if factor.user_id != user_id {
            return Err(MfaError::WrongUser);
        }
        if factor.revoked || factor.kind != FactorKind::Totp {
            return Err(MfaError::NotConfigured(FactorKind::Totp));
        }

        if let Err(rejection) = self.check(store, &factor, code, now).await? {
            return Ok(Err(rejection));
        }

        for old in store.find_factors(user_id, Some(FactorKind::Totp), false).await? {
            if old.id != factor.id {
                store.revoke_factor(old.id).await?;
            }
        }
        store.confirm_factor(factor.id).await?;

        Ok(Ok(()))
    }

    /// Check a code against the instance's secret and advance the replay
    /// marker.
    pub async fn check(
        &self,
        store: &dyn FactorStore,
        factor: &UserFactor,
        code: &str,
        now: i64,
    ) -> Result<Verdict> {
        let code = normalize_code(code);
        if code.len() != self.config().digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Err(CodeRejection::Malformed));
        }

        let secret = factor
            .secret
            .as_deref()
            .ok_or(MfaError::InvalidSecret)
            .and_then(TotpSecret::from_base32)?;

        let Some(counter) = self.generator.verify(&secret, &code, now)? else {
            return Ok(Err(CodeRejection::Invalid));
        };

        if !store.advance_totp_counter(factor.id, counter).await? {
            return Ok(Err(CodeRejection::Replayed));
        }

        Ok(Ok(()))
    }
}

/// Strip the separators people type into codes.
fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}
