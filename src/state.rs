//! Factor state machine
//!
//! ```text
//! Neutral --accept--> Pass
//!    |                 |
//!  reject            reject
//!    v                 v
//!   Fail --reject (counter >= threshold)--> Locked
//! ```
//!
//! `Locked` only leaves through [`FactorProgress::unlock`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verification state of one factor for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FactorState {
    /// Not attempted in this login
    #[default]
    Neutral,
    /// Last attempt succeeded
    Pass,
    /// Last attempt failed
    Fail,
    /// Too many failures; attempts are refused without evaluation
    Locked,
}

impl FactorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorState::Neutral => "neutral",
            FactorState::Pass => "pass",
            FactorState::Fail => "fail",
            FactorState::Locked => "locked",
        }
    }
}

impl fmt::Display for FactorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "neutral" | "unknown" => Ok(FactorState::Neutral),
            "pass" => Ok(FactorState::Pass),
            "fail" => Ok(FactorState::Fail),
            "locked" => Ok(FactorState::Locked),
            other => Err(format!("unknown factor state: {}", other)),
        }
    }
}

/// Result of evaluating a submitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Accepted,
    Rejected,
}

/// Lockout settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Consecutive failures that lock the factor
    pub threshold: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self { threshold: 10 }
    }
}

/// Persisted state plus lock counter of a user's factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FactorProgress {
    pub state: FactorState,
    pub lock_counter: u32,
}

impl FactorProgress {
    pub fn new(state: FactorState, lock_counter: u32) -> Self {
        Self {
            state,
            lock_counter,
        }
    }

    /// Next progress after an attempt.
    pub fn apply(self, attempt: Attempt, policy: &LockPolicy) -> Self {
        if self.state == FactorState::Locked {
            return self;
        }

        match attempt {
            Attempt::Accepted => Self::new(FactorState::Pass, 0),
            Attempt::Rejected => {
                let lock_counter = self.lock_counter.saturating_add(1);
                let state = if lock_counter >= policy.threshold {
                    FactorState::Locked
                } else {
                    FactorState::Fail
                };
                Self::new(state, lock_counter)
            }
        }
    }

    /// Reset at the start of a login. The counter and a lock survive.
    pub fn begin_attempt(self) -> Self {
        match self.state {
            FactorState::Locked => self,
            _ => Self::new(FactorState::Neutral, self.lock_counter),
        }
    }

    /// Administrative reset
    pub fn unlock() -> Self {
        Self::new(FactorState::Neutral, 0)
    }

    pub fn is_locked(&self) -> bool {
        self.state == FactorState::Locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_resets_counter() {
        let policy = LockPolicy::default();
        let progress = FactorProgress::new(FactorState::Fail, 4);

        let next = progress.apply(Attempt::Accepted, &policy);
        assert_eq!(next, FactorProgress::new(FactorState::Pass, 0));
    }

    #[test]
    fn test_reject_counts_up_to_lock() {
        let policy = LockPolicy { threshold: 3 };
        let mut progress = FactorProgress::default();

        progress = progress.apply(Attempt::Rejected, &policy);
        assert_eq!(progress, FactorProgress::new(FactorState::Fail, 1));
        progress = progress.apply(Attempt::Rejected, &policy);
        assert_eq!(progress, FactorProgress::new(FactorState::Fail, 2));
        progress = progress.apply(Attempt::Rejected, &policy);
        assert_eq!(progress, FactorProgress::new(FactorState::Locked, 3));
    }

    #[test]
    fn test_locked_is_sticky() {
        let policy = LockPolicy { threshold: 1 };
        let locked = FactorProgress::default().apply(Attempt::Rejected, &policy);
        assert!(locked.is_locked());

        assert_eq!(locked.apply(Attempt::Accepted, &policy), locked);
        assert_eq!(locked.apply(Attempt::Rejected, &policy), locked);
        assert_eq!(locked.begin_attempt(), locked);
        assert_eq!(FactorProgress::unlock(), FactorProgress::new(FactorState::Neutral, 0));
    }

    #[test]
    fn test_begin_attempt_keeps_counter() {
        let progress = FactorProgress::new(FactorState::Fail, 7).begin_attempt();
        assert_eq!(progress, FactorProgress::new(FactorState::Neutral, 7));
    }

    #[test]
    fn test_state_parsing() {
        for state in [
            FactorState::Neutral,
            FactorState::Pass,
            FactorState::Fail,
            FactorState::Locked,
        ] {
            assert_eq!(state.as_str().parse::<FactorState>().unwrap(), state);
        }
        assert_eq!("unknown".parse::<FactorState>().unwrap(), FactorState::Neutral);
        assert!("bogus".parse::<FactorState>().is_err());
    }
}
