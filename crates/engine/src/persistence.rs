//! The persistence boundary (spec §3, §6): the system of record. Every
//! in-memory structure in this crate is a derivable cache; every mutation
//! of a `Moderator` or `Proposal` is paired with a call through this
//! trait. `crates/store` supplies the Postgres-backed implementation;
//! `mock::InMemoryStore` (test-only) backs the scenario tests.

use async_trait::async_trait;
use futarchy_types::errors::EngineResult;
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::rows::{
    ModeratorRow, PriceHistoryRow, ProposalRow, TradeHistoryRow, TwapHistoryRow, WithdrawalRow,
};

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_moderator(&self, row: ModeratorRow) -> EngineResult<()>;
    async fn load_moderators(&self) -> EngineResult<Vec<ModeratorRow>>;

    async fn save_proposal(&self, row: ProposalRow) -> EngineResult<()>;
    async fn load_proposal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<Option<ProposalRow>>;

    /// All rows with `status = Pending`, across every moderator. Driven by
    /// `Router::recover_pending_proposals` on startup.
    async fn load_pending_proposals(&self) -> EngineResult<Vec<ProposalRow>>;

    async fn save_withdrawal(&self, row: WithdrawalRow) -> EngineResult<()>;
    async fn load_withdrawal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<Option<WithdrawalRow>>;

    async fn record_price(&self, row: PriceHistoryRow) -> EngineResult<()>;
    async fn record_twap(&self, row: TwapHistoryRow) -> EngineResult<()>;
    async fn record_trade(&self, row: TradeHistoryRow) -> EngineResult<()>;
}
