//! Factor registry
//!
//! Factors are registered in a fixed order (totp, email, sms, backupcodes,
//! iprange) with the fallback last. Evaluation order is descending weight;
//! the sort is stable, so equal weights keep registration order.

use std::sync::Arc;

use super::{
    BackupCodeFactor, EmailFactor, Factor, FactorKind, FallbackFactor, IpRangeFactor, Mailer,
    SmsFactor, SmsSender, TotpFactor,
};
use crate::config::MfaConfig;

#[derive(Debug, Clone)]
pub struct FactorRegistry {
    factors: Vec<Factor>,
}

impl FactorRegistry {
    /// Registers the given factors, appending the fallback if missing.
    pub fn new(mut factors: Vec<Factor>) -> Self {
        if !factors.iter().any(|f| f.kind() == FactorKind::Fallback) {
            factors.push(Factor::Fallback(FallbackFactor));
        }
        Self { factors }
    }

    pub fn from_config(config: &MfaConfig, mailer: Arc<dyn Mailer>, sms: Arc<dyn SmsSender>) -> Self {
        Self::new(vec![
            Factor::Totp(TotpFactor::new(config.totp.clone(), config.issuer.clone())),
            Factor::Email(EmailFactor::new(config.email.clone(), mailer)),
            Factor::Sms(SmsFactor::new(config.sms.clone(), config.issuer.clone(), sms)),
            Factor::BackupCodes(BackupCodeFactor::new(config.backup_codes.clone())),
            Factor::IpRange(IpRangeFactor::new(config.iprange.clone())),
        ])
    }

    /// Every registered factor in registration order
    pub fn all(&self) -> &[Factor] {
        &self.factors
    }

    pub fn get(&self, kind: FactorKind) -> Option<&Factor> {
        self.factors.iter().find(|f| f.kind() == kind)
    }

    /// Enabled factor of the given kind
    pub fn enabled(&self, kind: FactorKind) -> Option<&Factor> {
        self.get(kind).filter(|f| f.enabled())
    }

    /// Enabled factors by descending weight, ties in registration order
    pub fn ordered(&self) -> Vec<&Factor> {
        let mut factors: Vec<&Factor> = self.factors.iter().filter(|f| f.enabled()).collect();
        factors.sort_by(|a, b| b.weight().cmp(&a.weight()));
        factors
    }

    /// True if any factor other than the fallback is enabled
    pub fn any_enabled(&self) -> bool {
        self.factors
            .iter()
            .any(|f| f.enabled() && f.kind() != FactorKind::Fallback)
    }

    pub fn totp(&self) -> Option<&TotpFactor> {
        match self.get(FactorKind::Totp) {
            Some(Factor::Totp(f)) => Some(f),
            _ => None,
        }
    }

    pub fn email(&self) -> Option<&EmailFactor> {
        match self.get(FactorKind::Email) {
            Some(Factor::Email(f)) => Some(f),
            _ => None,
        }
    }

    pub fn sms(&self) -> Option<&SmsFactor> {
        match self.get(FactorKind::Sms) {
            Some(Factor::Sms(f)) => Some(f),
            _ => None,
        }
    }

    pub fn backup_codes(&self) -> Option<&BackupCodeFactor> {
        match self.get(FactorKind::BackupCodes) {
            Some(Factor::BackupCodes(f)) => Some(f),
            _ => None,
        }
    }

    pub fn iprange(&self) -> Option<&IpRangeFactor> {
        match self.get(FactorKind::IpRange) {
            Some(Factor::IpRange(f)) => Some(f),
            _ => None,
        }
    }
}
