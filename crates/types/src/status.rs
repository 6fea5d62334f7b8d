//! Closed sum types. Every match over these must be exhaustive at finalize
//! and scheduler dispatch — no wildcard arms in `futarchy-engine`.

use serde::{Deserialize, Serialize};

/// `Uninitialized -> Pending -> Finalized`. No backward transitions; see
/// `futarchy-engine::proposal` for the transition guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Uninitialized,
    Pending,
    Finalized,
}

/// Mirrors the adapter contract's `state()` accessor (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSourceState {
    Uninitialized,
    Trading,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultState {
    Uninitialized,
    Trading,
    Finalized,
}

/// `ScheduledTask.kind`. Task keys are formatted `"{kind}-{moderator}-{proposal}"`;
/// `as_key_prefix` is the canonical string used by both the scheduler and
/// recovery so the two never drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledTaskKind {
    TwapCrank,
    PriceRecord,
    SpotPriceRecord,
    Finalize,
}

impl ScheduledTaskKind {
    pub fn as_key_prefix(&self) -> &'static str {
        match self {
            Self::TwapCrank => "twap-crank",
            Self::PriceRecord => "price-record",
            Self::SpotPriceRecord => "spot-price-record",
            Self::Finalize => "finalize",
        }
    }

    pub fn is_periodic(&self) -> bool {
        match self {
            Self::TwapCrank | Self::PriceRecord | Self::SpotPriceRecord => true,
            Self::Finalize => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_is_one_shot() {
        assert!(!ScheduledTaskKind::Finalize.is_periodic());
        assert!(ScheduledTaskKind::TwapCrank.is_periodic());
        assert!(ScheduledTaskKind::PriceRecord.is_periodic());
        assert!(ScheduledTaskKind::SpotPriceRecord.is_periodic());
    }
}
