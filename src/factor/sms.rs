//! SMS code factor
//!
//! The user registers a phone number and proves it owns the number by
//! typing the first code sent there. Each later login gets a fresh code.
//! Numbers are kept in E.164 form and masked whenever they are logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::issued::{self, SendLimit};
use crate::context::MfaUser;
use crate::error::{MfaError, Result};
use crate::factor::{CodeRejection, FactorKind, Verdict};
use crate::store::{FactorStore, UserFactor};

/// E.164 allows at most 15 digits; 7 rules out short codes
const PHONE_DIGITS: std::ops::RangeInclusive<usize> = 7..=15;

/// SMS factor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub enabled: bool,
    pub weight: u32,
    /// Code lifetime in seconds
    pub duration: i64,
    pub code_length: usize,
    /// Wrong guesses allowed per code
    pub max_attempts: u32,
    /// Prepended to numbers entered without a leading `+`
    pub default_country_code: String,
    pub send_limit: SendLimit,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: 75,
            duration: 600,
            code_length: 6,
            max_attempts: 3,
            default_country_code: "1".to_string(),
            send_limit: SendLimit::default(),
        }
    }
}

/// A text message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSms {
    /// E.164 number
    pub to: String,
    pub body: String,
    pub code: String,
    pub expires_at: i64,
}

/// Delivery seam for SMS codes, one implementation per gateway
#[async_trait]
pub trait SmsSender: Send + Sync + std::fmt::Debug {
    async fn send(&self, message: &OutgoingSms) -> Result<()>;
}

/// Writes a log line instead of sending the message
#[derive(Debug, Default, Clone)]
pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send(&self, message: &OutgoingSms) -> Result<()> {
        tracing::info!(to = %mask_phone(&message.to), "SMS code delivery (log only)");
        Ok(())
    }
}

/// Keeps sent messages in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySmsSender {
    sent: Arc<Mutex<Vec<OutgoingSms>>>,
    fail: bool,
}

impl MemorySmsSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sender whose every delivery fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<OutgoingSms> {
        self.sent.lock().await.clone()
    }

    pub async fn last(&self) -> Option<OutgoingSms> {
        self.sent.lock().await.last().cloned()
    }
}

#[async_trait]
impl SmsSender for MemorySmsSender {
    async fn send(&self, message: &OutgoingSms) -> Result<()> {
        if self.fail {
            return Err(MfaError::Delivery(format!("gateway refused {}", mask_phone(&message.to))));
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SmsFactor {
    config: SmsConfig,
    site_name: String,
    sender: Arc<dyn SmsSender>,
}

impl SmsFactor {
    pub fn new(config: SmsConfig, site_name: impl Into<String>, sender: Arc<dyn SmsSender>) -> Self {
        Self {
            config,
            site_name: site_name.into(),
            sender,
        }
    }

    pub fn config(&self) -> &SmsConfig {
        &self.config
    }

    /// Create an unconfirmed instance for `phone`. It becomes active once
    /// the first code sent to it is confirmed.
    pub async fn setup(
        &self,
        store: &dyn FactorStore,
        user: &MfaUser,
        phone: &str,
        ip: Option<String>,
        now: i64,
    ) -> Result<UserFactor> {
        let phone = normalize_phone(phone, &self.config.default_country_code)?;

        let mut factor = UserFactor::new(user.id, FactorKind::Sms, phone, now);
        factor.created_from_ip = ip;
        store.insert_factor(&factor).await?;

        tracing::debug!(user_id = user.id, phone = %mask_phone(&factor.label), "SMS setup started");
        Ok(factor)
    }

    /// Generate and text a new code, invalidating older unused ones.
    pub async fn issue_code(
        &self,
        store: &dyn FactorStore,
        factor: &UserFactor,
        ip: Option<String>,
        now: i64,
    ) -> Result<Uuid> {
        let fresh = issued::generate(factor, self.config.code_length, self.config.duration, ip, now);
        store.replace_issued_code(&fresh.record).await?;

        let minutes = (self.config.duration + 59) / 60;
        let message = OutgoingSms {
            to: factor.label.clone(),
            body: format!(
                "Your {} verification code is: {}. Valid for {} minutes. Do not share this code.",
                self.site_name, fresh.code, minutes
            ),
            code: fresh.code,
            expires_at: fresh.record.expires_at,
        };
        self.sender.send(&message).await?;

        Ok(fresh.record.id)
    }

    /// Check a typed code against the latest code sent to the instance.
    pub async fn check(
        &self,
        store: &dyn FactorStore,
        factor: &UserFactor,
        code: &str,
        now: i64,
    ) -> Result<Verdict> {
        let Some(record) = store.latest_issued_code(factor.id).await? else {
            return Ok(Err(CodeRejection::NotIssued));
        };
        if let Err(rejection) = issued::check_usable(&record, now, self.config.max_attempts) {
            return Ok(Err(rejection));
        }

        let matches = issued::code_matches(&record, code, self.config.code_length);
        issued::settle(store, &record, matches).await
    }

    /// Confirm a pending instance with the code sent at setup. The confirmed
    /// instance replaces any earlier SMS instance of the user.
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
            .ok_or(MfaError::NotConfigured(FactorKind::Sms))?;
        if factor.user_id != user_id {
            return Err(MfaError::WrongUser);
        }
        if factor.revoked || factor.kind != FactorKind::Sms {
            return Err(MfaError::NotConfigured(FactorKind::Sms));
        }

        if let Err(rejection) = self.check(store, &factor, code, now).await? {
            return Ok(Err(rejection));
        }

        for old in store.find_factors(user_id, Some(FactorKind::Sms), false).await? {
            if old.id != factor.id {
                store.revoke_factor(old.id).await?;
            }
        }
        store.confirm_factor(factor.id).await?;

        Ok(Ok(()))
    }
}

/// Reduce a typed number to E.164: keep digits and `+`, and prefix the
/// default country code when there is no leading `+`.
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Result<String> {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    let phone = if kept.starts_with('+') {
        kept
    } else {
        format!("+{}{}", default_country_code, kept)
    };

    let digits = &phone[1..];
    if !PHONE_DIGITS.contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MfaError::InvalidPhone(mask_phone(&phone)));
    }
    Ok(phone)
}

/// `+1555***567` style masking for logs and screens
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() < 7 {
        return "***".to_string();
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{}***{}", head, tail)
}
