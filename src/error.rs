//! Error types for the MFA core.

use crate::base32::Base32Error;
use crate::factor::FactorKind;
use thiserror::Error;

/// Result type alias for MFA operations
pub type Result<T> = std::result::Result<T, MfaError>;

/// Error types for MFA operations
#[derive(Debug, Error)]
pub enum MfaError {
    /// Secret material could not be decoded
    #[error("Invalid base32 input: {0}")]
    Base32(#[from] Base32Error),

    /// Factor is disabled site-wide
    #[error("Factor not enabled: {0}")]
    FactorDisabled(FactorKind),

    /// Factor does not accept user input
    #[error("Factor does not take input: {0}")]
    NoInput(FactorKind),

    /// Factor has not been set up for this user
    #[error("Factor not configured for user: {0}")]
    NotConfigured(FactorKind),

    /// Factor name could not be resolved
    #[error("Unknown factor: {0}")]
    UnknownFactor(String),

    /// Instance belongs to a different user
    #[error("Factor instance does not belong to user")]
    WrongUser,

    /// Invalid secret format
    #[error("Invalid secret format")]
    InvalidSecret,

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Cryptographic error
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// QR code generation failed
    #[error("QR code generation failed: {0}")]
    QrCode(String),

    /// Email or SMS delivery failed
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Too many codes sent recently
    #[error("Too many codes sent, retry in {retry_after}s")]
    RateLimited { retry_after: i64 },

    /// Phone number is not E.164
    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source could not be read
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// The redirect guard gave up
    #[error("Redirect loop detected")]
    RedirectLoop,

    /// MFA is pending but the page cannot be redirected
    #[error("MFA required but redirect is not possible on this page")]
    RedirectPrevented,
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored value could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Conditional write kept losing against concurrent writers
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Store is not reachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
