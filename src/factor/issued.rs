//! One-time codes shared by the email and SMS factors
//!
//! Codes are stored as salted SHA-256, link tokens as plain SHA-256. Both
//! are compared in constant time.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::Result;
use crate::factor::{CodeRejection, Verdict};
use crate::store::{FactorStore, IssuedCode, UserFactor};

const LINK_TOKEN_LENGTH: usize = 32;

/// How many codes a user may request per factor in a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendLimit {
    pub count: u32,
    /// Window length in seconds
    pub window: i64,
}

impl Default for SendLimit {
    fn default() -> Self {
        Self {
            count: 5,
            window: 3600,
        }
    }
}

impl SendLimit {
    /// Start of the window ending at `now`, inclusive
    pub fn window_start(&self, now: i64) -> i64 {
        now - self.window + 1
    }

    /// Seconds until another code may be sent, given the send times inside
    /// the current window. `None` when sending is allowed now.
    pub fn retry_after(&self, sent_at: impl IntoIterator<Item = i64>, now: i64) -> Option<i64> {
        let start = self.window_start(now);
        let recent: Vec<i64> = sent_at.into_iter().filter(|t| *t >= start).collect();
        if recent.len() < self.count as usize {
            return None;
        }
        let oldest = recent.iter().copied().min().unwrap_or(now);
        Some((self.window - (now - oldest)).max(0))
    }
}

/// A code just generated, before delivery
pub(crate) struct FreshCode {
    pub record: IssuedCode,
    pub code: String,
    pub token: String,
}

/// Generate a code and link token for `factor` and hash them into a record.
pub(crate) fn generate(
    factor: &UserFactor,
    code_length: usize,
    lifetime: i64,
    ip: Option<String>,
    now: i64,
) -> FreshCode {
    let code = random_digits(code_length);
    let token: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(LINK_TOKEN_LENGTH)
        .map(char::from)
        .collect();

    let mut salt = [0u8; 16];
    thread_rng().fill_bytes(&mut salt);
    let salt = STANDARD.encode(salt);

    let record = IssuedCode {
        id: Uuid::new_v4(),
        factor_id: factor.id,
        user_id: factor.user_id,
        code_hash: hash_code(&salt, &code),
        salt,
        link_token_hash: hash_token(&token),
        created_at: now,
        expires_at: now + lifetime,
        attempts: 0,
        used: false,
        created_from_ip: ip,
    };

    FreshCode { record, code, token }
}

/// Order matters: a used or expired code is reported as such even when
/// the guess is also wrong.
pub(crate) fn check_usable(record: &IssuedCode, now: i64, max_attempts: u32) -> Verdict {
    if record.used {
        return Err(CodeRejection::AlreadyUsed);
    }
    if now > record.expires_at {
        return Err(CodeRejection::Expired);
    }
    if record.attempts >= max_attempts {
        return Err(CodeRejection::TooManyAttempts);
    }
    Ok(())
}

/// Typed code against the stored hash. Whitespace and dashes are ignored.
pub(crate) fn code_matches(record: &IssuedCode, code: &str, code_length: usize) -> bool {
    let code: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    code.len() == code_length
        && code.bytes().all(|b| b.is_ascii_digit())
        && constant_time_eq(&hash_code(&record.salt, &code), &record.code_hash)
}

pub(crate) fn token_matches(record: &IssuedCode, token: &str) -> bool {
    constant_time_eq(&hash_token(token), &record.link_token_hash)
}

/// Record a wrong guess, or consume the code on a match.
pub(crate) async fn settle(store: &dyn FactorStore, record: &IssuedCode, matches: bool) -> Result<Verdict> {
    if !matches {
        store.record_code_attempt(record.id).await?;
        return Ok(Err(CodeRejection::Invalid));
    }
    if !store.consume_issued_code(record.id).await? {
        return Ok(Err(CodeRejection::AlreadyUsed));
    }
    Ok(Ok(()))
}

fn random_digits(len: usize) -> String {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn hash_code(salt: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(code.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn hash_token(token: &str) -> String {
    STANDARD.encode(Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
