//! Process-wide registry of moderators (spec §4.5, §9 registry+id
//! pattern). Grounded on the process-wide-container-resolving-by-handle
//! shape of `feels-indexer`'s `infrastructure::ServiceContainer`: the
//! Scheduler never holds a `Moderator` reference, only an id it resolves
//! through this Router on every tick.
//!
//! Each moderator is wrapped in its own `Arc<Mutex<Moderator>>` rather
//! than living directly in the registry map, so the outer registry lock
//! is only ever held for the synchronous `HashMap` lookup/insert — never
//! across an `.await`. A slow tick or the mandated post-finalize delay
//! blocks only the moderator it belongs to, not every other moderator in
//! the process (spec §5 / §9's per-proposal concurrency guarantee).

use crate::moderator::Moderator;
use crate::persistence::PersistenceStore;
use crate::proposal::CrankOutcome;
use crate::scheduler::Scheduler;
use crate::sources::{PriceSourceFactory, TransactionSigner, VaultFactory, WithdrawApi};
use futarchy_types::errors::{EngineError, EngineResult};
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::rows::{PriceHistoryRow, TwapHistoryRow};
use futarchy_types::status::ProposalStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type ModeratorHandle = Arc<Mutex<Moderator>>;

pub struct Router {
    moderators: Mutex<HashMap<ModeratorId, ModeratorHandle>>,
    store: Arc<dyn PersistenceStore>,
    price_source_factory: Arc<dyn PriceSourceFactory>,
    vault_factory: Arc<dyn VaultFactory>,
    withdraw_api: Option<Arc<dyn WithdrawApi>>,
    signer: Arc<dyn TransactionSigner>,
}

impl Router {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        price_source_factory: Arc<dyn PriceSourceFactory>,
        vault_factory: Arc<dyn VaultFactory>,
        withdraw_api: Option<Arc<dyn WithdrawApi>>,
        signer: Arc<dyn TransactionSigner>,
    ) -> Self {
        Self {
            moderators: Mutex::new(HashMap::new()),
            store,
            price_source_factory,
            vault_factory,
            withdraw_api,
            signer,
        }
    }

    /// Resolves `moderator_id` to its handle with only a brief registry
    /// lock, for callers that go on to do an unknown-moderator ->
    /// `ConfigError`.
    async fn handle_for_moderator(&self, moderator_id: ModeratorId) -> EngineResult<ModeratorHandle> {
        self.moderators
            .lock()
            .await
            .get(&moderator_id)
            .cloned()
            .ok_or_else(|| EngineError::config(Some(moderator_id), "unknown moderator"))
    }

    /// Same resolution, but for callers operating on a specific proposal
    /// where an unknown moderator is a `StateError` against that
    /// proposal rather than a `ConfigError`.
    async fn handle_for_proposal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<ModeratorHandle> {
        self.moderators
            .lock()
            .await
            .get(&moderator_id)
            .cloned()
            .ok_or_else(|| EngineError::state(Some(proposal_id), "moderator not found"))
    }

    /// Reads every moderator row and instantiates each, logging and
    /// skipping a single row's deserialization failure rather than
    /// aborting startup for every other pool.
    pub async fn load_moderators(&self) -> EngineResult<usize> {
        let rows = self.store.load_moderators().await?;
        let mut loaded = 0;
        for row in rows {
            let id = row.id;
            match Moderator::from_row(
                row,
                self.store.clone(),
                self.price_source_factory.clone(),
                self.vault_factory.clone(),
                self.withdraw_api.clone(),
                self.signer.clone(),
            ) {
                Ok(moderator) => {
                    self.moderators
                        .lock()
                        .await
                        .insert(id, Arc::new(Mutex::new(moderator)));
                    loaded += 1;
                }
                Err(err) => {
                    tracing::error!(moderator = %id, error = %err, "failed to load moderator; skipping");
                }
            }
        }
        Ok(loaded)
    }

    /// Called once on startup, after `load_moderators`. For every
    /// persisted Pending proposal: finalize immediately if its window has
    /// already elapsed, otherwise reschedule all task kinds with their
    /// original intervals and finalize time. A failure on one proposal
    /// never blocks recovery of the others (spec §4.5). Each row only
    /// holds its own moderator's lock, so recovering a proposal under one
    /// moderator never blocks recovering a proposal under another.
    pub async fn recover_pending_proposals(
        &self,
        scheduler: &Scheduler,
        now_ms: i64,
    ) -> EngineResult<()> {
        let rows = self.store.load_pending_proposals().await?;

        for row in rows {
            let moderator_id = row.moderator_id;
            let proposal_id = row.proposal_id;
            let Some(handle) = self.moderators.lock().await.get(&moderator_id).cloned() else {
                tracing::error!(
                    moderator = %moderator_id,
                    proposal = %proposal_id,
                    "pending proposal references unknown moderator; skipping recovery"
                );
                continue;
            };

            let finalized_at_ms = row.finalized_at.timestamp_millis();
            let min_update_interval_ms =
                serde_json::from_value::<futarchy_oracle::TwapConfig>(row.twap_config_json.clone())
                    .map(|c| c.min_update_interval_ms)
                    .unwrap_or(1_000);
            let has_spot = row.spot_pool_address.is_some();

            let mut moderator = handle.lock().await;
            if let Err(err) = moderator.rehydrate_proposal(row).await {
                tracing::error!(
                    moderator = %moderator_id,
                    proposal = %proposal_id,
                    error = %err,
                    "failed to rehydrate pending proposal; skipping"
                );
                continue;
            }

            if now_ms >= finalized_at_ms {
                if let Err(err) = moderator.finalize_proposal(proposal_id, now_ms).await {
                    tracing::error!(
                        moderator = %moderator_id,
                        proposal = %proposal_id,
                        error = %err,
                        "recovery finalize failed; continuing with other proposals"
                    );
                }
                drop(moderator);
            } else {
                drop(moderator);
                scheduler
                    .schedule_proposal_tasks(
                        moderator_id,
                        proposal_id,
                        min_update_interval_ms,
                        finalized_at_ms,
                        has_spot,
                    )
                    .await;
            }
        }
        Ok(())
    }

    pub async fn insert_moderator(&self, moderator: Moderator) {
        let id = moderator.id();
        self.moderators
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(moderator)));
    }

    /// Resolves `moderator_id` and delegates to
    /// `Moderator::create_proposal`. A thin pass-through, but keeps test
    /// and `crates/service` callers from needing direct access to the
    /// `Moderator` the registry owns.
    pub async fn create_proposal(
        &self,
        moderator_id: ModeratorId,
        params: crate::moderator::CreateProposalParams,
        scheduler: &Scheduler,
    ) -> EngineResult<ProposalId> {
        let handle = self.handle_for_moderator(moderator_id).await?;
        let mut moderator = handle.lock().await;
        moderator.create_proposal(params, scheduler).await
    }

    pub async fn moderator_count(&self) -> usize {
        self.moderators.lock().await.len()
    }

    pub async fn proposal_status(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> Option<ProposalStatus> {
        let handle = self.moderators.lock().await.get(&moderator_id).cloned()?;
        let moderator = handle.lock().await;
        moderator.proposal(proposal_id).map(|p| p.status())
    }

    pub async fn proposal_finalized_at_ms(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> Option<i64> {
        let handle = self.moderators.lock().await.get(&moderator_id).cloned()?;
        let moderator = handle.lock().await;
        moderator.proposal(proposal_id).map(|p| p.finalized_at_ms())
    }

    /// Drives one `TwapCrank` tick and, on a successful crank, records
    /// the resulting twap/aggregation vector. The registry lock is
    /// released as soon as the moderator handle is cloned; only that
    /// moderator's own lock is held across the price fetch.
    pub async fn crank_proposal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        now_ms: i64,
    ) -> EngineResult<()> {
        let handle = self.handle_for_proposal(moderator_id, proposal_id).await?;
        let outcome = {
            let mut moderator = handle.lock().await;
            moderator.crank_proposal(proposal_id, now_ms).await?
        };

        if let CrankOutcome::Cranked { twaps, aggregations } = outcome {
            self.store
                .record_twap(TwapHistoryRow {
                    id: 0,
                    timestamp: chrono::Utc::now(),
                    moderator_id,
                    proposal_id,
                    twaps,
                    aggregations,
                })
                .await?;
        }
        Ok(())
    }

    /// Drives one `PriceRecord` tick: one row per market, `market` being
    /// the market's index.
    pub async fn record_price_history(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        now_ms: i64,
    ) -> EngineResult<()> {
        let handle = self.handle_for_proposal(moderator_id, proposal_id).await?;
        let prices = {
            let moderator = handle.lock().await;
            moderator.sample_market_prices(proposal_id).await?
        };

        for (market, price) in prices.into_iter().enumerate() {
            self.store
                .record_price(PriceHistoryRow {
                    id: 0,
                    timestamp: chrono::Utc::now(),
                    moderator_id,
                    proposal_id,
                    market: market as i32,
                    price,
                })
                .await?;
        }
        let _ = now_ms;
        Ok(())
    }

    /// Drives one `SpotPriceRecord` tick: `market = -1` per the
    /// persistence contract's convention.
    pub async fn record_spot_price_history(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        now_ms: i64,
    ) -> EngineResult<()> {
        let handle = self.handle_for_proposal(moderator_id, proposal_id).await?;
        let price = {
            let moderator = handle.lock().await;
            moderator.sample_spot_price(proposal_id).await?
        };

        if let Some(price) = price {
            self.store
                .record_price(PriceHistoryRow {
                    id: 0,
                    timestamp: chrono::Utc::now(),
                    moderator_id,
                    proposal_id,
                    market: -1,
                    price,
                })
                .await?;
        }
        let _ = now_ms;
        Ok(())
    }

    /// Drives the one-shot `Finalize` task. Only the owning moderator's
    /// lock is held across the mandated post-finalize settlement delay
    /// (`Moderator::finalize_proposal`'s 2s sleep) — every other
    /// moderator keeps ticking uninterrupted.
    pub async fn finalize_proposal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        now_ms: i64,
    ) -> EngineResult<()> {
        let handle = self.handle_for_proposal(moderator_id, proposal_id).await?;
        let mut moderator = handle.lock().await;
        moderator.finalize_proposal(proposal_id, now_ms).await
    }
}
