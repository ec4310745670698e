//! TOTP (Time-based One-Time Password) Implementation
//!
//! HOTP per RFC 4226 with the RFC 6238 time counter. Everything here is a
//! pure function of the secret, the counter and the configuration; replay
//! tracking and persistence live in the TOTP factor.

use hmac::{Hmac, Mac};
use qrcode::render::svg;
use qrcode::QrCode;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::base32;
use crate::error::{MfaError, Result};

/// TOTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpConfig {
    /// Enable/disable the TOTP factor
    pub enabled: bool,
    /// Factor weight (0-100)
    pub weight: u32,
    /// Number of digits (6 to 8)
    pub digits: u32,
    /// Time step in seconds
    pub period: u64,
    /// Accepted drift in time steps on either side of the current one
    pub window: u8,
    /// Length of generated secrets in bytes
    pub secret_bytes: usize,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 100,
            digits: 6,
            period: 30,
            window: 1,
            secret_bytes: 20,
        }
    }
}

/// Shared secret, wiped from memory on drop
#[derive(Clone)]
pub struct TotpSecret {
    bytes: Zeroizing<Vec<u8>>,
}

impl TotpSecret {
    /// Generate a new random secret of `len` bytes
    pub fn generate(len: usize) -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(MfaError::InvalidSecret);
        }
        Ok(Self {
            bytes: Zeroizing::new(bytes.to_vec()),
        })
    }

    /// Create from a base32 string as shown to users
    pub fn from_base32(encoded: &str) -> Result<Self> {
        let bytes = base32::decode(encoded)?;
        Self::from_bytes(&bytes)
    }

    /// Base32 form without padding
    pub fn to_base32(&self) -> String {
        base32::encode_unpadded(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for TotpSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpSecret")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Accepted code lengths
pub const DIGITS_RANGE: std::ops::RangeInclusive<u32> = 6..=8;

/// Compute an HOTP value for `counter`.
pub fn hotp(secret: &[u8], counter: u64, digits: u32) -> Result<String> {
    if !DIGITS_RANGE.contains(&digits) {
        return Err(MfaError::Config(format!("totp digits must be 6 to 8, got {}", digits)));
    }

    let mut mac = Hmac::<Sha1>::new_from_slice(secret)
        .map_err(|e| MfaError::Crypto(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 section 5.3)
    let offset = (hash[hash.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(hash[offset]) & 0x7f) << 24
        | u32::from(hash[offset + 1]) << 16
        | u32::from(hash[offset + 2]) << 8
        | u32::from(hash[offset + 3]);

    let code = binary % 10u32.pow(digits);
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Time-step counter for a Unix timestamp. Times before the epoch map to 0.
pub fn time_counter(unix_time: i64, period: u64) -> Result<u64> {
    u64::try_from(unix_time)
        .unwrap_or(0)
        .checked_div(period)
        .ok_or_else(|| MfaError::Config("totp period must be positive".to_string()))
}

/// TOTP generator and verifier
#[derive(Debug, Clone)]
pub struct TotpGenerator {
    config: TotpConfig,
}

impl TotpGenerator {
    pub fn new(config: TotpConfig) -> Self {
        Self { config }
    }

    /// Code for an explicit time-step counter
    pub fn code_at(&self, secret: &TotpSecret, counter: u64) -> Result<String> {
        hotp(secret.as_bytes(), counter, self.config.digits)
    }

    /// Code for a Unix timestamp
    pub fn code_for_time(&self, secret: &TotpSecret, unix_time: i64) -> Result<String> {
        self.code_at(secret, time_counter(unix_time, self.config.period)?)
    }

    /// Check `code` against the counters around `unix_time`.
    ///
    /// Returns the counter that matched, so callers can refuse to accept the
    /// same time step twice.
    pub fn verify(&self, secret: &TotpSecret, code: &str, unix_time: i64) -> Result<Option<u64>> {
        if code.len() != self.config.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }

        let current = time_counter(unix_time, self.config.period)?;
        let window = u64::from(self.config.window);
        let first = current.saturating_sub(window);
        let last = current.saturating_add(window);

        let mut matched = None;
        for counter in first..=last {
            let expected = self.code_at(secret, counter)?;
            // keep scanning after a hit so timing does not reveal the offset
            if bool::from(expected.as_bytes().ct_eq(code.as_bytes())) && matched.is_none() {
                matched = Some(counter);
            }
        }

        Ok(matched)
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }
}

/// Build an `otpauth://` provisioning URI.
pub fn provisioning_uri(secret: &TotpSecret, label: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{}?secret={}&issuer={}",
        urlencoding::encode(label),
        secret.to_base32(),
        urlencoding::encode(issuer)
    )
}

/// Render a provisioning URI as an SVG QR code.
pub fn qr_svg(uri: &str) -> Result<String> {
    let code = QrCode::new(uri.as_bytes()).map_err(|e| MfaError::QrCode(e.to_string()))?;

    Ok(code
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .build())
}
