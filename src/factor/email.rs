//! Email code factor
//!
//! A short numeric code plus a pair of links is mailed to the user. The
//! accept link passes the factor like the code does; the "not me" link lets
//! the owner of the mailbox kill the instance and every session of the
//! account. Codes and link tokens are stored hashed.

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

/// Email factor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub weight: u32,
    /// Code lifetime in seconds
    pub duration: i64,
    pub code_length: usize,
    /// Wrong guesses allowed per code
    pub max_attempts: u32,
    /// Suspend the account when the "not me" link is used
    pub suspend_on_revoke: bool,
    /// Page that handles the links
    pub base_url: String,
    pub sender: String,
    pub send_limit: SendLimit,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 50,
            duration: 1800,
            code_length: 6,
            max_attempts: 5,
            suspend_on_revoke: false,
            base_url: "https://localhost/mfa/email".to_string(),
            sender: "noreply@localhost".to_string(),
            send_limit: SendLimit::default(),
        }
    }
}

/// A message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub code: String,
    pub accept_link: String,
    pub revoke_link: String,
    pub expires_at: i64,
}

impl OutgoingEmail {
    /// Plain-text body
    pub fn body(&self) -> String {
        format!(
            "Your verification code is {}\n\n\
             Or confirm it was you: {}\n\n\
             If this was not you, block this login attempt: {}\n",
            self.code, self.accept_link, self.revoke_link
        )
    }
}

/// Delivery seam for email codes
#[async_trait]
pub trait Mailer: Send + Sync + std::fmt::Debug {
    async fn send(&self, message: &OutgoingEmail) -> Result<()>;
}

/// Writes a log line instead of sending mail
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &OutgoingEmail) -> Result<()> {
        tracing::info!(to = %message.to, subject = %message.subject, "Email code delivery (log only)");
        Ok(())
    }
}

/// Keeps sent messages in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryMailer {
    sent: Arc<Mutex<Vec<OutgoingEmail>>>,
    fail: bool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose every delivery fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn last(&self) -> Option<OutgoingEmail> {
        self.sent.lock().await.last().cloned()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &OutgoingEmail) -> Result<()> {
        if self.fail {
            return Err(MfaError::Delivery(format!("cannot reach mailbox {}", message.to)));
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailFactor {
    config: EmailConfig,
    mailer: Arc<dyn Mailer>,
}

impl EmailFactor {
    pub fn new(config: EmailConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self { config, mailer }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    /// Register the user's address as a confirmed instance.
    pub async fn setup(
        &self,
        store: &dyn FactorStore,
        user: &MfaUser,
        ip: Option<String>,
        now: i64,
    ) -> Result<UserFactor> {
        let email = user
            .email
            .as_deref()
            .ok_or_else(|| MfaError::Delivery("user has no email address".to_string()))?;

        store.revoke_factors(user.id, FactorKind::Email).await?;

        let mut factor = UserFactor::new(user.id, FactorKind::Email, email, now);
        factor.confirmed = true;
        factor.created_from_ip = ip;
        store.insert_factor(&factor).await?;

        Ok(factor)
    }

    /// Generate and mail a new code, invalidating older unused ones.
    pub async fn issue_code(
        &self,
        store: &dyn FactorStore,
        factor: &UserFactor,
        ip: Option<String>,
        now: i64,
    ) -> Result<Uuid> {
        let issued::FreshCode { record, code, token } =
            issued::generate(factor, self.config.code_length, self.config.duration, ip, now);
        store.replace_issued_code(&record).await?;

        let link = format!("{}?instance={}&secret={}", self.config.base_url, factor.id, token);
        let message = OutgoingEmail {
            from: self.config.sender.clone(),
            to: factor.label.clone(),
            subject: "Your verification code".to_string(),
            code,
            accept_link: format!("{}&pass=1", link),
            revoke_link: link,
            expires_at: record.expires_at,
        };
        self.mailer.send(&message).await?;

        Ok(record.id)
    }

    /// Check a typed code against the latest issued code.
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

    /// Check the token of an accept link. The link must belong to the user
    /// who is logging in.
    pub async fn check_link(
        &self,
        store: &dyn FactorStore,
        user_id: i64,
        instance: Uuid,
        token: &str,
        now: i64,
    ) -> Result<Verdict> {
        let factor = self.link_instance(store, instance).await?;
        if factor.user_id != user_id {
            return Err(MfaError::WrongUser);
        }

        let Some(record) = store.latest_issued_code(factor.id).await? else {
            return Ok(Err(CodeRejection::NotIssued));
        };
        if let Err(rejection) = issued::check_usable(&record, now, self.config.max_attempts) {
            return Ok(Err(rejection));
        }

        let matches = issued::token_matches(&record, token);
        issued::settle(store, &record, matches).await
    }

    /// Validate a "not me" link without consuming anything. Returns the
    /// instance the link was issued for.
    pub async fn check_revocation(
        &self,
        store: &dyn FactorStore,
        instance: Uuid,
        token: &str,
        now: i64,
    ) -> Result<std::result::Result<UserFactor, CodeRejection>> {
        let factor = self.link_instance(store, instance).await?;
        let Some(record) = store.latest_issued_code(factor.id).await? else {
            return Ok(Err(CodeRejection::NotIssued));
        };
        if now > record.expires_at {
            return Ok(Err(CodeRejection::Expired));
        }
        if !issued::token_matches(&record, token) {
            return Ok(Err(CodeRejection::Invalid));
        }
        Ok(Ok(factor))
    }

    async fn link_instance(&self, store: &dyn FactorStore, instance: Uuid) -> Result<UserFactor> {
        match store.get_factor(instance).await? {
            Some(factor) if factor.kind == FactorKind::Email => Ok(factor),
            _ => Err(MfaError::NotConfigured(FactorKind::Email)),
        }
    }
}
