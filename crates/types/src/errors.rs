//! The error taxonomy of the engine's error-handling design: one kind per
//! row of the trigger/policy table, not one variant per call site.
//!
//! Every variant carries the `(moderator_id, proposal_id)` pair it
//! happened against and a short human message — the "user-visible
//! failures" contract. No variant carries a backtrace.

use crate::ids::{ModeratorId, ProposalId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing authority, bad decimals, unknown pool. Fatal at create.
    #[error("config error for moderator {moderator:?}: {message}")]
    Config {
        moderator: Option<ModeratorId>,
        message: String,
    },

    /// Operation illegal for the current status (e.g. finalize on
    /// Uninitialized). Surfaced; no side effects.
    #[error("state error for proposal {proposal:?}: {message}")]
    State {
        proposal: Option<ProposalId>,
        message: String,
    },

    /// N out of [2,4], negative `maxChange`, `timePassed <= 0` at fetch.
    /// Fatal at construction or fetch time.
    #[error("numeric error: {message}")]
    Numeric { message: String },

    /// Price fetch or tx submission failure. Logged, retried next tick, no
    /// state mutation.
    #[error("transient RPC error for proposal {proposal:?}: {message}")]
    TransientRpc {
        proposal: Option<ProposalId>,
        message: String,
    },

    /// `withdraw/confirm` failure. Fails `create_proposal`; the moderator's
    /// counter still advances (see DESIGN.md Open Question 1).
    #[error("withdraw API error for moderator {moderator:?}: {message}")]
    WithdrawApi {
        moderator: ModeratorId,
        message: String,
    },

    /// `removeLiquidity` or vault-finalize failure during finalize. Logged
    /// per market; other markets continue; status still advances.
    #[error("settlement error for proposal {proposal:?} market {market}: {message}")]
    Settlement {
        proposal: ProposalId,
        market: usize,
        message: String,
    },

    /// DB write failure. Fatal to the operation; caller retries; state is
    /// not considered committed.
    #[error("persistence error: {message}")]
    Persistence { message: String },
}

impl EngineError {
    pub fn config(moderator: Option<ModeratorId>, message: impl Into<String>) -> Self {
        Self::Config {
            moderator,
            message: message.into(),
        }
    }

    pub fn state(proposal: Option<ProposalId>, message: impl Into<String>) -> Self {
        Self::State {
            proposal,
            message: message.into(),
        }
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        Self::Numeric {
            message: message.into(),
        }
    }

    pub fn transient_rpc(proposal: Option<ProposalId>, message: impl Into<String>) -> Self {
        Self::TransientRpc {
            proposal,
            message: message.into(),
        }
    }

    pub fn withdraw_api(moderator: ModeratorId, message: impl Into<String>) -> Self {
        Self::WithdrawApi {
            moderator,
            message: message.into(),
        }
    }

    pub fn settlement(proposal: ProposalId, market: usize, message: impl Into<String>) -> Self {
        Self::Settlement {
            proposal,
            market,
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
