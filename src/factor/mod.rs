//! Authentication factors
//!
//! Every factor the site can use is a variant of [`Factor`]; there is no
//! lookup by string at verification time. Names are only parsed at the
//! edges (configuration, CLI, stored rows).

pub mod backup;
pub mod email;
pub mod fallback;
pub mod iprange;
mod issued;
pub mod registry;
pub mod sms;
pub mod totp;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::error::MfaError;

pub use backup::{BackupCodeConfig, BackupCodeFactor};
pub use email::{EmailConfig, EmailFactor, LogMailer, Mailer, MemoryMailer, OutgoingEmail};
pub use fallback::FallbackFactor;
pub use iprange::{IpRangeConfig, IpRangeFactor};
pub use issued::SendLimit;
pub use registry::FactorRegistry;
pub use sms::{LogSmsSender, MemorySmsSender, OutgoingSms, SmsConfig, SmsFactor, SmsSender};
pub use totp::{TotpEnrollment, TotpFactor};

/// Factor identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorKind {
    Totp,
    Email,
    Sms,
    BackupCodes,
    IpRange,
    Fallback,
}

impl FactorKind {
    /// Registration order
    pub const ALL: [FactorKind; 6] = [
        FactorKind::Totp,
        FactorKind::Email,
        FactorKind::Sms,
        FactorKind::BackupCodes,
        FactorKind::IpRange,
        FactorKind::Fallback,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FactorKind::Totp => "totp",
            FactorKind::Email => "email",
            FactorKind::Sms => "sms",
            FactorKind::BackupCodes => "backupcodes",
            FactorKind::IpRange => "iprange",
            FactorKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FactorKind {
    type Err = MfaError;

    /// Accepts plain names and the `factor_` plugin form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let name = lowered.strip_prefix("factor_").unwrap_or(&lowered);
        match name {
            "totp" => Ok(FactorKind::Totp),
            "email" => Ok(FactorKind::Email),
            "sms" => Ok(FactorKind::Sms),
            "backupcodes" | "backup" => Ok(FactorKind::BackupCodes),
            "iprange" => Ok(FactorKind::IpRange),
            "fallback" => Ok(FactorKind::Fallback),
            _ => Err(MfaError::UnknownFactor(s.to_string())),
        }
    }
}

/// What the user submitted for a factor
#[derive(Debug, Clone, Copy)]
pub enum FactorInput<'a> {
    /// Typed code
    Code(&'a str),
    /// Followed the accept link of an email
    EmailLink { instance: Uuid, token: &'a str },
}

/// Internal reason a submission was refused. Never shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodeRejection {
    #[error("malformed code")]
    Malformed,
    #[error("invalid code")]
    Invalid,
    #[error("code expired")]
    Expired,
    #[error("code already used")]
    AlreadyUsed,
    #[error("too many attempts")]
    TooManyAttempts,
    #[error("code replayed")]
    Replayed,
    #[error("no code issued")]
    NotIssued,
    #[error("factor locked")]
    Locked,
}

/// Outcome of checking a submission against stored secrets
pub type Verdict = std::result::Result<(), CodeRejection>;

/// A configured factor
#[derive(Debug, Clone)]
pub enum Factor {
    Totp(TotpFactor),
    Email(EmailFactor),
    Sms(SmsFactor),
    BackupCodes(BackupCodeFactor),
    IpRange(IpRangeFactor),
    Fallback(FallbackFactor),
}

impl Factor {
    pub fn kind(&self) -> FactorKind {
        match self {
            Factor::Totp(_) => FactorKind::Totp,
            Factor::Email(_) => FactorKind::Email,
            Factor::Sms(_) => FactorKind::Sms,
            Factor::BackupCodes(_) => FactorKind::BackupCodes,
            Factor::IpRange(_) => FactorKind::IpRange,
            Factor::Fallback(_) => FactorKind::Fallback,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            Factor::Totp(f) => f.config().weight,
            Factor::Email(f) => f.config().weight,
            Factor::Sms(f) => f.config().weight,
            Factor::BackupCodes(f) => f.config().weight,
            Factor::IpRange(f) => f.config().weight,
            Factor::Fallback(_) => 0,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Factor::Totp(f) => f.config().enabled,
            Factor::Email(f) => f.config().enabled,
            Factor::Sms(f) => f.config().enabled,
            Factor::BackupCodes(f) => f.config().enabled,
            Factor::IpRange(f) => f.config().enabled,
            Factor::Fallback(_) => true,
        }
    }

    /// Whether the user types or clicks something for this factor
    pub fn has_input(&self) -> bool {
        matches!(
            self,
            Factor::Totp(_) | Factor::Email(_) | Factor::Sms(_) | Factor::BackupCodes(_)
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Factor::Totp(_) => "Authenticator app",
            Factor::Email(_) => "Email verification code",
            Factor::Sms(_) => "SMS verification code",
            Factor::BackupCodes(_) => "Backup codes",
            Factor::IpRange(_) => "Trusted network",
            Factor::Fallback(_) => "Set up additional authentication",
        }
    }
}
