//! Placeholder shown when nothing else can be attempted.

use crate::state::FactorState;

/// Weight 0, takes no input and never counts towards a pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackFactor;

impl FallbackFactor {
    pub fn state(&self) -> FactorState {
        FactorState::Neutral
    }
}
