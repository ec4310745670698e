//! # nexo-mfa
//!
//! Multi-factor authentication core for the NexoSupport platform.
//!
//! This crate provides the factor framework used during login: TOTP
//! authenticator apps, emailed codes and links, texted codes, one-time
//! backup codes and IP range rules, combined by a [`FactorManager`] with per-factor lockout
//! and an append-only audit log.

pub mod audit;
pub mod base32;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod factor;
pub mod logging;
pub mod manager;
pub mod state;
pub mod store;
pub mod totp;

pub use config::{Aggregation, MfaConfig};
pub use context::{AuthContext, MemorySessionStore, MfaSession, MfaUser, SessionStore};
pub use error::{MfaError, Result, StoreError};
pub use factor::{CodeRejection, Factor, FactorInput, FactorKind, FactorRegistry};
pub use manager::{AuthGate, AuthStatus, FactorManager, MfaStats, RedirectDecision};
pub use state::{FactorState, LockPolicy};
pub use store::{FactorStore, MemoryFactorStore, SqliteFactorStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MfaError::UnknownFactor("sms".to_string());
        assert!(err.to_string().contains("sms"));
    }
}
