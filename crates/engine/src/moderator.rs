//! Per-pool owner of a numbered proposal sequence (spec §4.3). Grounded on
//! the owner-of-a-config-list shape of `KeeperConfig`/`MarketConfig`,
//! generalized from a static market list to a persistence-backed,
//! monotonically numbered proposal sequence.

use crate::persistence::PersistenceStore;
use crate::proposal::{Proposal, ProposalConfig};
use crate::sources::{PoolKind, PriceSourceFactory, TransactionSigner, VaultFactory, WithdrawApi};
use futarchy_oracle::TwapConfig;
use futarchy_types::errors::{EngineError, EngineResult};
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::rows::{ModeratorRow, ProposalRow, WithdrawalRow};
use futarchy_types::status::ProposalStatus;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ModeratorConfig {
    pub base_mint: String,
    pub quote_mint: String,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub rpc_endpoint: String,
    /// Pool address -> signing key name. No fallback: an address absent
    /// here is a hard `ConfigError`, never a default key.
    pub pool_authorities: HashMap<String, String>,
    /// `0..=50`; `None`/`Some(0)` both mean "no pre-proposal withdrawal".
    pub damm_withdrawal_percentage: Option<u8>,
}

impl ModeratorConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(pct) = self.damm_withdrawal_percentage {
            if pct > 50 {
                return Err(EngineError::config(
                    None,
                    format!("damm_withdrawal_percentage must be <= 50, got {pct}"),
                ));
            }
        }
        Ok(())
    }
}

pub struct CreateProposalParams {
    pub title: String,
    pub description: Option<String>,
    pub markets: usize,
    pub labels: Vec<String>,
    pub proposal_length_ms: i64,
    pub twap_config: TwapConfig,
    pub base_amount: u128,
    pub quote_amount: u128,
    pub spot_pool_address: String,
    pub total_supply: Option<u128>,
    pub now_ms: i64,
}

/// Per-pool owner; authoritative signing key selection and the
/// persistence boundary for its proposal sequence.
pub struct Moderator {
    id: ModeratorId,
    protocol_name: Option<String>,
    config: ModeratorConfig,
    proposal_id_counter: i64,
    proposals: HashMap<ProposalId, Proposal>,
    store: Arc<dyn PersistenceStore>,
    price_source_factory: Arc<dyn PriceSourceFactory>,
    vault_factory: Arc<dyn VaultFactory>,
    withdraw_api: Option<Arc<dyn WithdrawApi>>,
    signer: Arc<dyn TransactionSigner>,
}

impl Moderator {
    pub fn new(
        id: ModeratorId,
        protocol_name: Option<String>,
        config: ModeratorConfig,
        proposal_id_counter: i64,
        store: Arc<dyn PersistenceStore>,
        price_source_factory: Arc<dyn PriceSourceFactory>,
        vault_factory: Arc<dyn VaultFactory>,
        withdraw_api: Option<Arc<dyn WithdrawApi>>,
        signer: Arc<dyn TransactionSigner>,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            id,
            protocol_name,
            config,
            proposal_id_counter,
            proposals: HashMap::new(),
            store,
            price_source_factory,
            vault_factory,
            withdraw_api,
            signer,
        })
    }

    pub fn id(&self) -> ModeratorId {
        self.id
    }

    pub fn proposal_id_counter(&self) -> i64 {
        self.proposal_id_counter
    }

    pub fn proposal(&self, id: ProposalId) -> Option<&Proposal> {
        self.proposals.get(&id)
    }

    pub fn proposal_mut(&mut self, id: ProposalId) -> Option<&mut Proposal> {
        self.proposals.get_mut(&id)
    }

    pub fn pending_proposal_ids(&self) -> Vec<ProposalId> {
        self.proposals
            .iter()
            .filter(|(_, p)| p.status() == ProposalStatus::Pending)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn from_row(
        row: ModeratorRow,
        store: Arc<dyn PersistenceStore>,
        price_source_factory: Arc<dyn PriceSourceFactory>,
        vault_factory: Arc<dyn VaultFactory>,
        withdraw_api: Option<Arc<dyn WithdrawApi>>,
        signer: Arc<dyn TransactionSigner>,
    ) -> EngineResult<Self> {
        let json: ModeratorConfigJson = serde_json::from_value(row.config_json)
            .map_err(|e| EngineError::persistence(e.to_string()))?;
        let config = ModeratorConfig {
            base_mint: json.base_mint,
            quote_mint: json.quote_mint,
            base_decimals: json.base_decimals,
            quote_decimals: json.quote_decimals,
            rpc_endpoint: json.rpc_endpoint,
            pool_authorities: json.pool_authorities,
            damm_withdrawal_percentage: json.damm_withdrawal_percentage,
        };
        Self::new(
            row.id,
            row.protocol_name,
            config,
            row.proposal_id_counter,
            store,
            price_source_factory,
            vault_factory,
            withdraw_api,
            signer,
        )
    }

    /// Rehydrates a `Proposal` from its persisted row into this
    /// moderator's in-memory cache, for use by
    /// `Router::recover_pending_proposals` (spec §4.5). Does not re-run
    /// `initialize`'s side effects — the proposal is already Pending or
    /// Finalized in the store.
    pub async fn rehydrate_proposal(&mut self, row: ProposalRow) -> EngineResult<ProposalId> {
        let twap_config: TwapConfig = serde_json::from_value(row.twap_config_json)
            .map_err(|e| EngineError::persistence(e.to_string()))?;
        let oracle: futarchy_oracle::TwapOracle =
            serde_json::from_value(row.twap_oracle_data_json)
                .map_err(|e| EngineError::persistence(e.to_string()))?;

        let mut price_sources = Vec::with_capacity(row.market_labels.len());
        for label in &row.market_labels {
            price_sources.push(self.price_source_factory.create(label).await?);
        }
        let conditional_mints: Vec<String> = (0..row.markets as usize)
            .map(|i| format!("{}-cond-{i}", row.proposal_id))
            .collect();
        let base_vault = self.vault_factory.create(conditional_mints.clone()).await?;
        let quote_vault = self.vault_factory.create(conditional_mints).await?;
        let spot_price_source = match &row.spot_pool_address {
            Some(addr) if !addr.is_empty() => {
                Some(self.price_source_factory.create("spot").await?)
            }
            _ => None,
        };

        let config = ProposalConfig {
            id: row.proposal_id,
            moderator_id: row.moderator_id,
            title: row.title,
            description: row.description,
            markets: row.markets as usize,
            labels: row.market_labels,
            created_at_ms: row.created_at.timestamp_millis(),
            proposal_length_ms: row.proposal_length_ms,
            twap_config,
            base_mint: row.base_mint,
            quote_mint: row.quote_mint,
            base_decimals: row.base_decimals as u8,
            quote_decimals: row.quote_decimals as u8,
            spot_pool_address: row.spot_pool_address,
            total_supply: row.total_supply.and_then(|s| s.parse().ok()),
        };

        let proposal_id = config.id;
        let proposal = Proposal::from_parts(
            config,
            row.status,
            oracle,
            price_sources,
            base_vault,
            quote_vault,
            spot_price_source,
        );
        self.proposals.insert(proposal_id, proposal);
        Ok(proposal_id)
    }

    /// Ticks the `TwapCrank` task for `proposal_id`: fetches prices,
    /// integrates the oracle, and persists the proposal's new oracle
    /// state before returning, per spec §4.4's "database is the source of
    /// truth" rule.
    pub async fn crank_proposal(
        &mut self,
        proposal_id: ProposalId,
        now_ms: i64,
    ) -> EngineResult<crate::proposal::CrankOutcome> {
        let proposal = self.proposals.get_mut(&proposal_id).ok_or_else(|| {
            EngineError::state(Some(proposal_id), "crank_proposal called on unknown proposal")
        })?;
        let outcome = proposal.crank(now_ms).await?;
        self.store.save_proposal(proposal_row(proposal)?).await?;
        Ok(outcome)
    }

    /// Ticks the `PriceRecord` task: one `price_history` row per market.
    pub async fn sample_market_prices(
        &self,
        proposal_id: ProposalId,
    ) -> EngineResult<Vec<Decimal>> {
        let proposal = self.proposals.get(&proposal_id).ok_or_else(|| {
            EngineError::state(Some(proposal_id), "sample_market_prices called on unknown proposal")
        })?;
        proposal.fetch_market_prices().await
    }

    /// Ticks the `SpotPriceRecord` task. `None` when the proposal has no
    /// spot pool bound, which the scheduler never schedules for in the
    /// first place, but is handled defensively here too.
    pub async fn sample_spot_price(&self, proposal_id: ProposalId) -> EngineResult<Option<Decimal>> {
        let proposal = self.proposals.get(&proposal_id).ok_or_else(|| {
            EngineError::state(Some(proposal_id), "sample_spot_price called on unknown proposal")
        })?;
        proposal.fetch_spot_price().await
    }

    /// Required; no silent fallback to a default signer.
    pub fn get_authority_for_pool(&self, pool_address: &str) -> EngineResult<&str> {
        self.config
            .pool_authorities
            .get(pool_address)
            .map(String::as_str)
            .ok_or_else(|| {
                EngineError::config(
                    Some(self.id),
                    format!("no signing authority registered for pool {pool_address}"),
                )
            })
    }

    fn to_row(&self) -> EngineResult<ModeratorRow> {
        Ok(ModeratorRow {
            id: self.id,
            proposal_id_counter: self.proposal_id_counter,
            config_json: serde_json::to_value(ModeratorConfigJson::from(&self.config))
                .map_err(|e| EngineError::persistence(e.to_string()))?,
            protocol_name: self.protocol_name.clone(),
            updated_at: chrono::Utc::now(),
        })
    }

    /// Persists the moderator row; called on every counter mutation so a
    /// crash between bump and persist is never observable (spec §4.3
    /// step 5 / §4.5 restart-equivalence).
    async fn persist_self(&self) -> EngineResult<()> {
        self.store.save_moderator(self.to_row()?).await
    }

    /// Spec §4.3 `createProposal`, steps 1-7. The counter advances by
    /// exactly one on *every* call, success or failure — Open Question 1:
    /// kept as specified, not silently fixed (see DESIGN.md).
    pub async fn create_proposal(
        &mut self,
        params: CreateProposalParams,
        scheduler: &crate::scheduler::Scheduler,
    ) -> EngineResult<ProposalId> {
        let proposal_id = ProposalId(self.proposal_id_counter + 1);
        let outcome = self.create_proposal_inner(proposal_id, &params).await;

        self.proposal_id_counter += 1;
        if let Err(err) = self.persist_self().await {
            tracing::error!(
                moderator = %self.id,
                error = %err,
                "failed to persist moderator after proposal-counter bump"
            );
        }

        let (proposal, withdrawal, finalized_at_ms) = outcome?;

        self.proposals.insert(proposal_id, proposal);
        if let Some(row) = withdrawal {
            if let Err(err) = self.store.save_withdrawal(row).await {
                tracing::error!(
                    moderator = %self.id,
                    proposal = %proposal_id,
                    error = %err,
                    "failed to persist withdrawal record"
                );
            }
        }

        scheduler
            .schedule_proposal_tasks(
                self.id,
                proposal_id,
                params.twap_config.min_update_interval_ms,
                finalized_at_ms,
                params.spot_pool_address.len() > 0,
            )
            .await;

        Ok(proposal_id)
    }

    async fn create_proposal_inner(
        &mut self,
        proposal_id: ProposalId,
        params: &CreateProposalParams,
    ) -> EngineResult<(Proposal, Option<WithdrawalRow>, i64)> {
        if params.spot_pool_address.is_empty() {
            return Err(EngineError::config(
                Some(self.id),
                "spot_pool_address is required to create a proposal",
            ));
        }
        let authority_key = self
            .get_authority_for_pool(&params.spot_pool_address)?
            .to_string();

        let withdrawal = self.maybe_withdraw_liquidity(proposal_id, params, &authority_key).await?;

        let config = ProposalConfig {
            id: proposal_id,
            moderator_id: self.id,
            title: params.title.clone(),
            description: params.description.clone(),
            markets: params.markets,
            labels: params.labels.clone(),
            created_at_ms: params.now_ms,
            proposal_length_ms: params.proposal_length_ms,
            twap_config: params.twap_config,
            base_mint: self.config.base_mint.clone(),
            quote_mint: self.config.quote_mint.clone(),
            base_decimals: self.config.base_decimals,
            quote_decimals: self.config.quote_decimals,
            spot_pool_address: Some(params.spot_pool_address.clone()),
            total_supply: params.total_supply,
        };
        let finalized_at_ms = config.finalized_at_ms();

        let mut price_sources = Vec::with_capacity(params.markets);
        for label in &params.labels {
            price_sources.push(self.price_source_factory.create(label).await?);
        }
        let conditional_mints: Vec<String> = (0..params.markets)
            .map(|i| format!("{}-cond-{i}", proposal_id))
            .collect();
        let base_vault = self.vault_factory.create(conditional_mints.clone()).await?;
        let quote_vault = self.vault_factory.create(conditional_mints).await?;
        let spot_price_source = if params.spot_pool_address.is_empty() {
            None
        } else {
            Some(self.price_source_factory.create("spot").await?)
        };

        let mut proposal = Proposal::new(
            config,
            price_sources,
            base_vault,
            quote_vault,
            spot_price_source,
        )?;
        proposal
            .initialize(params.base_amount, params.quote_amount)
            .await?;

        self.store
            .save_proposal(proposal_row(&proposal)?)
            .await?;

        Ok((proposal, withdrawal, finalized_at_ms))
    }

    async fn maybe_withdraw_liquidity(
        &self,
        proposal_id: ProposalId,
        params: &CreateProposalParams,
        authority_key: &str,
    ) -> EngineResult<Option<WithdrawalRow>> {
        let percentage = match self.config.damm_withdrawal_percentage {
            Some(pct) if pct > 0 => pct,
            _ => return Ok(None),
        };
        let api = self.withdraw_api.as_ref().ok_or_else(|| {
            EngineError::withdraw_api(self.id, "withdrawal configured but no withdraw API bound")
        })?;

        let build = api
            .build_withdraw(PoolKind::Damm, percentage, &params.spot_pool_address)
            .await
            .map_err(|e| EngineError::withdraw_api(self.id, e.to_string()))?;
        let signed = self
            .signer
            .sign(authority_key, &build.unsigned_transaction)?;
        let confirmed = api
            .confirm_withdraw(&build.request_id, signed)
            .await
            .map_err(|e| EngineError::withdraw_api(self.id, e.to_string()))?;

        // Authoritative spot price from confirmed amounts, never from a
        // book quote.
        let spot_price = if confirmed.amount_token_b == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(confirmed.amount_token_a) / Decimal::from(confirmed.amount_token_b)
        };

        Ok(Some(WithdrawalRow {
            moderator_id: self.id,
            proposal_id,
            withdrawal_request_id: build.request_id,
            withdrawal_signature: confirmed.signature,
            withdrawal_percentage: percentage as i16,
            withdrawn_token_a: confirmed.amount_token_a.to_string(),
            withdrawn_token_b: confirmed.amount_token_b.to_string(),
            spot_price,
            needs_deposit_back: true,
            deposit_signature: None,
            deposited_token_a: None,
            deposited_token_b: None,
            deposited_at: None,
            pool_address: confirmed.pool_address,
        }))
    }

    /// Loads the proposal, finalizes it, persists, and — if the status
    /// advanced — waits for settlement to propagate before executing
    /// deposit-back.
    pub async fn finalize_proposal(&mut self, id: ProposalId, now_ms: i64) -> EngineResult<()> {
        let authority_key = match self
            .proposals
            .get(&id)
            .and_then(|p| p.config().spot_pool_address.clone())
        {
            Some(pool) => self.get_authority_for_pool(&pool)?.to_string(),
            None => String::new(),
        };

        let proposal = self.proposals.get_mut(&id).ok_or_else(|| {
            EngineError::state(Some(id), "finalize_proposal called on unknown proposal")
        })?;

        let (status, _winner) = proposal
            .finalize(now_ms, &authority_key, &authority_key, self.signer.as_ref())
            .await?;

        self.store.save_proposal(proposal_row(proposal)?).await?;

        if status == ProposalStatus::Finalized {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            self.attempt_deposit_back(id).await;
        }
        Ok(())
    }

    async fn attempt_deposit_back(&mut self, id: ProposalId) {
        let Some(api) = self.withdraw_api.as_ref() else {
            return;
        };
        let Some(pool) = self
            .proposals
            .get(&id)
            .and_then(|p| p.config().spot_pool_address.clone())
        else {
            return;
        };
        let Ok(authority_key) = self.get_authority_for_pool(&pool) else {
            return;
        };

        match api.cleanup_swap_and_deposit(&pool, authority_key).await {
            Ok(Some(_resp)) => {
                tracing::info!(moderator = %self.id, proposal = %id, "deposit-back completed");
            }
            Ok(None) => {
                tracing::info!(moderator = %self.id, proposal = %id, "nothing to deposit back");
            }
            Err(err) => {
                // Logged; `needs_deposit_back` remains true so cleanup can
                // be retried manually (spec §7).
                tracing::error!(
                    moderator = %self.id,
                    proposal = %id,
                    error = %err,
                    "deposit-back failed; needs_deposit_back left set"
                );
            }
        }
    }
}

/// JSON-shaped mirror of `ModeratorConfig`, kept separate so field
/// renames on the Rust struct don't silently reshape the persisted
/// `config_json` column.
#[derive(serde::Serialize, serde::Deserialize)]
struct ModeratorConfigJson {
    base_mint: String,
    quote_mint: String,
    base_decimals: u8,
    quote_decimals: u8,
    rpc_endpoint: String,
    pool_authorities: HashMap<String, String>,
    damm_withdrawal_percentage: Option<u8>,
}

impl From<&ModeratorConfig> for ModeratorConfigJson {
    fn from(c: &ModeratorConfig) -> Self {
        Self {
            base_mint: c.base_mint.clone(),
            quote_mint: c.quote_mint.clone(),
            base_decimals: c.base_decimals,
            quote_decimals: c.quote_decimals,
            rpc_endpoint: c.rpc_endpoint.clone(),
            pool_authorities: c.pool_authorities.clone(),
            damm_withdrawal_percentage: c.damm_withdrawal_percentage,
        }
    }
}

fn proposal_row(proposal: &Proposal) -> EngineResult<ProposalRow> {
    let config = proposal.config();
    Ok(ProposalRow {
        moderator_id: proposal.moderator_id(),
        proposal_id: proposal.id(),
        title: config.title.clone(),
        description: config.description.clone(),
        status: proposal.status(),
        created_at: chrono::DateTime::from_timestamp_millis(config.created_at_ms)
            .unwrap_or_else(chrono::Utc::now),
        finalized_at: chrono::DateTime::from_timestamp_millis(proposal.finalized_at_ms())
            .unwrap_or_else(chrono::Utc::now),
        proposal_length_ms: config.proposal_length_ms,
        base_mint: config.base_mint.clone(),
        quote_mint: config.quote_mint.clone(),
        base_decimals: config.base_decimals as i16,
        quote_decimals: config.quote_decimals as i16,
        markets: config.markets as i16,
        market_labels: config.labels.clone(),
        amm_config_json: serde_json::Value::Null,
        twap_config_json: serde_json::to_value(config.twap_config)
            .map_err(|e| EngineError::persistence(e.to_string()))?,
        amm_data_json: Vec::new(),
        twap_oracle_data_json: serde_json::to_value(proposal.oracle())
            .map_err(|e| EngineError::persistence(e.to_string()))?,
        vault_data_json: serde_json::Value::Null,
        spot_pool_address: config.spot_pool_address.clone(),
        total_supply: config.total_supply.map(|v| v.to_string()),
    })
}
