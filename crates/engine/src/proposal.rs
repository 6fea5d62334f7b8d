//! The per-proposal state machine (spec §4.2): `Uninitialized -> Pending
//! -> Finalized`, binding N `PriceSource`s, two `Vault`s, and one
//! `TwapOracle`. Grounded on the fetch-compute-check-submit shape of the
//! teacher's `Keeper::update_market`, generalized from "update one
//! market's on-chain commitment" to "finalize a proposal's N markets,
//! logging and continuing past any single market's settlement failure".

use crate::sources::{PriceSource, TransactionSigner, Vault};
use futarchy_oracle::{CrankGate, TwapConfig, TwapOracle};
use futarchy_types::errors::EngineResult;
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::status::ProposalStatus;
use rust_decimal::Decimal;

/// Frozen at `Proposal::new`; mirrors the `Proposal` row of the data model.
#[derive(Debug, Clone)]
pub struct ProposalConfig {
    pub id: ProposalId,
    pub moderator_id: ModeratorId,
    pub title: String,
    pub description: Option<String>,
    pub markets: usize,
    pub labels: Vec<String>,
    pub created_at_ms: i64,
    pub proposal_length_ms: i64,
    pub twap_config: TwapConfig,
    pub base_mint: String,
    pub quote_mint: String,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub spot_pool_address: Option<String>,
    pub total_supply: Option<u128>,
}

impl ProposalConfig {
    pub fn finalized_at_ms(&self) -> i64 {
        self.created_at_ms + self.proposal_length_ms
    }
}

/// Result of one `Proposal::crank` call, distinguishing the three
/// `CrankGate` outcomes so the scheduler can decide whether a
/// `twap_history` row exists to record.
#[derive(Debug, Clone)]
pub enum CrankOutcome {
    PastFinalization,
    Throttled,
    Cranked {
        twaps: Vec<Decimal>,
        aggregations: Vec<Decimal>,
    },
}

#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub status: ProposalStatus,
    pub winner_index: Option<usize>,
    pub winner_label: Option<String>,
    pub winner_base_mint: Option<String>,
    pub winner_quote_mint: Option<String>,
}

pub struct Proposal {
    config: ProposalConfig,
    status: ProposalStatus,
    oracle: TwapOracle,
    price_sources: Vec<Box<dyn PriceSource>>,
    base_vault: Box<dyn Vault>,
    quote_vault: Box<dyn Vault>,
    /// Samples the underlying spot pool for `SpotPriceRecord`; present
    /// only when the proposal has a `spot_pool_address`. Reuses the
    /// `PriceSource` capability trait rather than a bespoke spot-pool
    /// adapter, since its observable surface is the same `fetch_price`.
    spot_price_source: Option<Box<dyn PriceSource>>,
}

impl Proposal {
    /// `N = len(labels) = len(price_sources) = oracle.markets` is checked
    /// here, not trusted from the caller.
    pub fn new(
        config: ProposalConfig,
        price_sources: Vec<Box<dyn PriceSource>>,
        base_vault: Box<dyn Vault>,
        quote_vault: Box<dyn Vault>,
        spot_price_source: Option<Box<dyn PriceSource>>,
    ) -> EngineResult<Self> {
        if config.labels.len() != config.markets || price_sources.len() != config.markets {
            return Err(futarchy_types::errors::EngineError::config(
                Some(config.moderator_id),
                format!(
                    "proposal {} market count mismatch: markets={}, labels={}, sources={}",
                    config.id,
                    config.markets,
                    config.labels.len(),
                    price_sources.len()
                ),
            ));
        }

        let oracle = TwapOracle::new(
            config.twap_config,
            config.markets,
            config.created_at_ms,
            config.finalized_at_ms(),
        )?;

        Ok(Self {
            config,
            status: ProposalStatus::Uninitialized,
            oracle,
            price_sources,
            base_vault,
            quote_vault,
            spot_price_source,
        })
    }

    pub fn id(&self) -> ProposalId {
        self.config.id
    }

    pub fn moderator_id(&self) -> ModeratorId {
        self.config.moderator_id
    }

    pub fn config(&self) -> &ProposalConfig {
        &self.config
    }

    pub fn status(&self) -> ProposalStatus {
        self.status
    }

    pub fn oracle(&self) -> &TwapOracle {
        &self.oracle
    }

    pub fn finalized_at_ms(&self) -> i64 {
        self.config.finalized_at_ms()
    }

    /// Reconstructs a `Proposal` already past `initialize`, for recovery.
    /// Used by `Moderator` when rehydrating a Pending proposal from its
    /// persisted row; skips straight to `Pending`/`Finalized` without
    /// re-running `initialize`'s side effects.
    pub fn from_parts(
        config: ProposalConfig,
        status: ProposalStatus,
        oracle: TwapOracle,
        price_sources: Vec<Box<dyn PriceSource>>,
        base_vault: Box<dyn Vault>,
        quote_vault: Box<dyn Vault>,
        spot_price_source: Option<Box<dyn PriceSource>>,
    ) -> Self {
        Self {
            config,
            status,
            oracle,
            price_sources,
            base_vault,
            quote_vault,
            spot_price_source,
        }
    }

    /// Current price of each conditional market, without mutating the
    /// oracle — used by the `PriceRecord` scheduled task, which samples
    /// independently of the crank cadence.
    pub async fn fetch_market_prices(&self) -> EngineResult<Vec<Decimal>> {
        let mut prices = Vec::with_capacity(self.price_sources.len());
        for source in &self.price_sources {
            prices.push(source.fetch_price().await?);
        }
        Ok(prices)
    }

    /// `None` when this proposal has no spot pool bound.
    pub async fn fetch_spot_price(&self) -> EngineResult<Option<Decimal>> {
        match &self.spot_price_source {
            Some(source) => Ok(Some(source.fetch_price().await?)),
            None => Ok(None),
        }
    }

    /// Fails if not `Uninitialized`. On any failure the status stays
    /// `Uninitialized`; reconciling partially-created external resources
    /// is the caller's responsibility (spec §7).
    pub async fn initialize(&mut self, base_amount: u128, quote_amount: u128) -> EngineResult<()> {
        if self.status != ProposalStatus::Uninitialized {
            return Err(futarchy_types::errors::EngineError::state(
                Some(self.config.id),
                format!("initialize called in status {:?}", self.status),
            ));
        }

        self.base_vault.initialize().await?;
        self.quote_vault.initialize().await?;

        for source in &mut self.price_sources {
            source.initialize(base_amount, quote_amount).await?;
        }

        // Sources are owned directly by the Proposal rather than bound
        // into the oracle (the oracle never touches I/O) — see DESIGN.md.
        self.status = ProposalStatus::Pending;
        Ok(())
    }

    /// Steps 1 and 3 of spec §4.1's `crank`, surfaced so the scheduler can
    /// skip the price-fetch RPC round trip when it would be wasted.
    pub fn crank_gate(&self, now_ms: i64) -> CrankGate {
        self.oracle.crank_gate(now_ms)
    }

    /// Fetches a fresh price from every `PriceSource` and integrates them
    /// into the oracle. A fetch failure on any single source aborts the
    /// whole tick (per spec §4.1 step 4) without advancing
    /// `lastUpdateMs` — the next tick retries all N sources.
    pub async fn crank(&mut self, now_ms: i64) -> EngineResult<CrankOutcome> {
        match self.oracle.crank_gate(now_ms) {
            CrankGate::PastFinalization => Ok(CrankOutcome::PastFinalization),
            CrankGate::Throttled => Ok(CrankOutcome::Throttled),
            CrankGate::Ready => {
                let mut prices = Vec::with_capacity(self.price_sources.len());
                for source in &self.price_sources {
                    prices.push(source.fetch_price().await?);
                }
                self.oracle.crank(now_ms, &prices)?;
                let (twaps, aggregations) = self.oracle.fetch_twaps(now_ms);
                Ok(CrankOutcome::Cranked { twaps, aggregations })
            }
        }
    }

    /// Fails if `Uninitialized`. Returns `(Pending, None)` without
    /// mutating state if called early. Otherwise runs steps 1-7 of spec
    /// §4.2, logging and continuing past any single market's settlement
    /// failure rather than aborting the whole finalize.
    pub async fn finalize(
        &mut self,
        now_ms: i64,
        authority_address: &str,
        authority_key_name: &str,
        signer: &dyn TransactionSigner,
    ) -> EngineResult<(ProposalStatus, Option<usize>)> {
        if self.status == ProposalStatus::Uninitialized {
            return Err(futarchy_types::errors::EngineError::state(
                Some(self.config.id),
                "finalize called on an uninitialized proposal",
            ));
        }
        if now_ms < self.finalized_at_ms() {
            return Ok((ProposalStatus::Pending, None));
        }

        // Step 1: one last crank. `now_ms >= finalized_at_ms` here, so
        // `crank_gate` is guaranteed `PastFinalization` and this call is a
        // provable no-op on the oracle's own state — no price fetch is
        // actually needed, so a zero-length integration is passed.
        let dummy_prices = vec![Decimal::ZERO; self.config.markets];
        self.oracle.crank(now_ms, &dummy_prices)?;

        // Step 2.
        self.status = ProposalStatus::Finalized;

        // Step 3: remove liquidity per market, non-fatally.
        for (i, source) in self.price_sources.iter_mut().enumerate() {
            if source.state() == futarchy_types::status::PriceSourceState::Finalized {
                continue;
            }
            if let Err(err) = source.remove_liquidity().await {
                tracing::error!(
                    proposal = %self.config.id,
                    market = i,
                    error = %err,
                    "remove_liquidity failed during finalize; continuing"
                );
            }
        }

        // Step 4.
        let winner_idx = self.oracle.fetch_highest_index(now_ms);

        // Step 5: finalize both vaults against the winning conditional
        // mint.
        let base_mint = self
            .base_vault
            .conditional_mints()
            .get(winner_idx)
            .cloned();
        let quote_mint = self
            .quote_vault
            .conditional_mints()
            .get(winner_idx)
            .cloned();

        if let Some(mint) = &base_mint {
            if let Err(err) = self.base_vault.finalize(mint).await {
                tracing::error!(proposal = %self.config.id, error = %err, "base vault finalize failed");
            }
        }
        if let Some(mint) = &quote_mint {
            if let Err(err) = self.quote_vault.finalize(mint).await {
                tracing::error!(proposal = %self.config.id, error = %err, "quote vault finalize failed");
            }
        }

        // Step 6: redeem the authority's winning conditional tokens on
        // both vaults; failure is logged, never fatal to finalize.
        for vault in [&self.base_vault, &self.quote_vault] {
            let redeem = async {
                let unsigned = vault.build_redeem_winning_tokens_tx(authority_address).await?;
                let signed = signer.sign(authority_key_name, &unsigned)?;
                vault.execute_redeem_winning_tokens_tx(signed).await
            }
            .await;
            if let Err(err) = redeem {
                tracing::error!(
                    proposal = %self.config.id,
                    error = %err,
                    "redeem_winning_tokens failed during finalize; continuing"
                );
            }
        }

        // Step 7.
        Ok((ProposalStatus::Finalized, Some(winner_idx)))
    }

    pub fn get_status_info(&self, now_ms: i64) -> StatusInfo {
        if self.status == ProposalStatus::Uninitialized {
            return StatusInfo {
                status: self.status,
                winner_index: None,
                winner_label: None,
                winner_base_mint: None,
                winner_quote_mint: None,
            };
        }

        let winner_index = self.oracle.fetch_highest_index(now_ms);
        StatusInfo {
            status: self.status,
            winner_index: Some(winner_index),
            winner_label: self.config.labels.get(winner_index).cloned(),
            winner_base_mint: self.base_vault.conditional_mints().get(winner_index).cloned(),
            winner_quote_mint: self.quote_vault.conditional_mints().get(winner_index).cloned(),
        }
    }
}

impl std::fmt::Debug for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proposal")
            .field("id", &self.config.id)
            .field("status", &self.status)
            .field("markets", &self.config.markets)
            .finish()
    }
}
