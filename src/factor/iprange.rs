//! Trusted network factor

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::state::FactorState;
use crate::store::{IpRangeRule, IpRuleKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpRangeConfig {
    pub enabled: bool,
    pub weight: u32,
}

impl Default for IpRangeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpRangeFactor {
    config: IpRangeConfig,
}

impl IpRangeFactor {
    pub fn new(config: IpRangeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IpRangeConfig {
        &self.config
    }

    /// Deny rules win over allow rules. An address no enabled rule
    /// mentions, or an unknown address, leaves the factor neutral.
    pub fn evaluate(&self, rules: &[IpRangeRule], ip: Option<IpAddr>) -> FactorState {
        let Some(ip) = ip else {
            return FactorState::Neutral;
        };

        let matching = |kind: IpRuleKind| {
            rules
                .iter()
                .any(|r| r.enabled && r.kind == kind && r.contains(&ip))
        };

        if matching(IpRuleKind::Deny) {
            FactorState::Fail
        } else if matching(IpRuleKind::Allow) {
            FactorState::Pass
        } else {
            FactorState::Neutral
        }
    }
}
