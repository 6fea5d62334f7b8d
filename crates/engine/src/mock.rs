//! In-memory fixtures for the scenario tests of spec §8. Compiled under
//! `cfg(test)` for the engine's own suite, and also under the
//! `mock-adapters` feature so `crates/service` can wire a runnable binary
//! without the concrete AMM/vault/withdraw-API backends spec §6 places
//! out of core scope — the same role `feels-indexer`'s `mock-geyser`
//! feature plays for a Geyser backend that isn't configured.

#![cfg(any(test, feature = "mock-adapters"))]

use crate::persistence::PersistenceStore;
use crate::sources::{
    DepositBackResponse, PoolKind, PriceSource, PriceSourceFactory, TransactionSigner, Vault,
    VaultFactory, WithdrawApi, WithdrawBuildResponse, WithdrawConfirmResponse,
};
use async_trait::async_trait;
use futarchy_types::errors::{EngineError, EngineResult};
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::rows::{
    ModeratorRow, PriceHistoryRow, ProposalRow, TradeHistoryRow, TwapHistoryRow, WithdrawalRow,
};
use futarchy_types::status::{PriceSourceState, ProposalStatus, VaultState};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared, externally-settable price — the test drives the market by
/// mutating this handle directly, simulating the AMM moving.
pub type PriceHandle = Arc<Mutex<Decimal>>;

#[derive(Debug)]
pub struct MockPriceSource {
    label: String,
    price: PriceHandle,
    state: Arc<Mutex<PriceSourceState>>,
    liquidity: u128,
}

#[async_trait]
impl PriceSource for MockPriceSource {
    fn state(&self) -> PriceSourceState {
        *self.state.lock().unwrap()
    }

    async fn initialize(&mut self, _base_amount: u128, _quote_amount: u128) -> EngineResult<()> {
        *self.state.lock().unwrap() = PriceSourceState::Trading;
        Ok(())
    }

    async fn fetch_price(&self) -> EngineResult<Decimal> {
        Ok(*self.price.lock().unwrap())
    }

    async fn fetch_liquidity(&self) -> EngineResult<u128> {
        Ok(self.liquidity)
    }

    async fn remove_liquidity(&mut self) -> EngineResult<String> {
        let mut state = self.state.lock().unwrap();
        if *state == PriceSourceState::Finalized {
            return Err(EngineError::settlement(
                ProposalId(0),
                0,
                format!("{} already finalized", self.label),
            ));
        }
        *state = PriceSourceState::Finalized;
        Ok(format!("mock-settlement-sig-{}", self.label))
    }

    fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "label": self.label,
            "price": self.price.lock().unwrap().to_string(),
            "state": format!("{:?}", *self.state.lock().unwrap()),
        }))
        .unwrap_or_default()
    }
}

pub struct MockPriceSourceFactory {
    default_price: Decimal,
    handles: Mutex<HashMap<String, PriceHandle>>,
}

impl MockPriceSourceFactory {
    pub fn new(default_price: Decimal) -> Self {
        Self {
            default_price,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared price handle for `label`, creating it at the
    /// default price if this is the first reference — lets a test set up
    /// the factory, create a proposal, then grab handles by label to
    /// drive prices tick by tick.
    pub fn handle(&self, label: &str) -> PriceHandle {
        self.handles
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(self.default_price)))
            .clone()
    }
}

#[async_trait]
impl PriceSourceFactory for MockPriceSourceFactory {
    async fn create(&self, market_label: &str) -> EngineResult<Box<dyn PriceSource>> {
        Ok(Box::new(MockPriceSource {
            label: market_label.to_string(),
            price: self.handle(market_label),
            state: Arc::new(Mutex::new(PriceSourceState::Uninitialized)),
            liquidity: 1_000_000,
        }))
    }

    fn deserialize(&self, bytes: &[u8]) -> EngineResult<Box<dyn PriceSource>> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EngineError::persistence(e.to_string()))?;
        let label = value["label"].as_str().unwrap_or("unknown").to_string();
        let price: Decimal = value["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.default_price);
        Ok(Box::new(MockPriceSource {
            price: self.handle(&label),
            label,
            state: Arc::new(Mutex::new(PriceSourceState::Trading)),
            liquidity: 1_000_000,
        }))
    }
}

#[derive(Debug)]
pub struct MockVault {
    conditional_mints: Vec<String>,
    state: VaultState,
}

#[async_trait]
impl Vault for MockVault {
    fn state(&self) -> VaultState {
        self.state
    }

    fn conditional_mints(&self) -> &[String] {
        &self.conditional_mints
    }

    async fn initialize(&mut self) -> EngineResult<()> {
        self.state = VaultState::Trading;
        Ok(())
    }

    async fn build_split_tx(&self, _user: &str, _amount: u128) -> EngineResult<Vec<u8>> {
        Ok(b"split".to_vec())
    }

    async fn execute_split_tx(&self, _signed_tx: Vec<u8>) -> EngineResult<String> {
        Ok("mock-split-sig".to_string())
    }

    async fn build_merge_tx(&self, _user: &str, _amount: u128) -> EngineResult<Vec<u8>> {
        Ok(b"merge".to_vec())
    }

    async fn execute_merge_tx(&self, _signed_tx: Vec<u8>) -> EngineResult<String> {
        Ok("mock-merge-sig".to_string())
    }

    async fn finalize(&mut self, _winning_mint: &str) -> EngineResult<()> {
        self.state = VaultState::Finalized;
        Ok(())
    }

    async fn build_redeem_winning_tokens_tx(&self, _user: &str) -> EngineResult<Vec<u8>> {
        Ok(b"redeem".to_vec())
    }

    async fn execute_redeem_winning_tokens_tx(&self, _signed_tx: Vec<u8>) -> EngineResult<String> {
        Ok("mock-redeem-sig".to_string())
    }

    fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "mints": self.conditional_mints,
            "state": format!("{:?}", self.state),
        }))
        .unwrap_or_default()
    }
}

pub struct MockVaultFactory;

#[async_trait]
impl VaultFactory for MockVaultFactory {
    async fn create(&self, conditional_mints: Vec<String>) -> EngineResult<Box<dyn Vault>> {
        Ok(Box::new(MockVault {
            conditional_mints,
            state: VaultState::Uninitialized,
        }))
    }

    fn deserialize(&self, bytes: &[u8]) -> EngineResult<Box<dyn Vault>> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EngineError::persistence(e.to_string()))?;
        let mints = value["mints"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(MockVault {
            conditional_mints: mints,
            state: VaultState::Trading,
        }))
    }
}

/// Always succeeds with fixed amounts; sufficient for the scenario tests,
/// none of which exercise the withdrawal percentage path.
pub struct MockWithdrawApi;

#[async_trait]
impl WithdrawApi for MockWithdrawApi {
    async fn build_withdraw(
        &self,
        _pool_kind: PoolKind,
        _percentage: u8,
        pool_address: &str,
    ) -> EngineResult<WithdrawBuildResponse> {
        Ok(WithdrawBuildResponse {
            request_id: format!("req-{pool_address}"),
            unsigned_transaction: b"withdraw".to_vec(),
            estimated_token_a: 1_000,
            estimated_token_b: 500,
            token_a_mint: "mockA".to_string(),
            token_b_mint: "mockB".to_string(),
            decimals_a: 9,
            decimals_b: 9,
        })
    }

    async fn confirm_withdraw(
        &self,
        request_id: &str,
        _signed_transaction: Vec<u8>,
    ) -> EngineResult<WithdrawConfirmResponse> {
        Ok(WithdrawConfirmResponse {
            signature: format!("sig-{request_id}"),
            amount_token_a: 1_000,
            amount_token_b: 500,
            pool_address: "mock-pool".to_string(),
        })
    }

    async fn cleanup_swap_and_deposit(
        &self,
        _pool_address: &str,
        _signer_key: &str,
    ) -> EngineResult<Option<DepositBackResponse>> {
        Ok(None)
    }
}

pub struct MockSigner;

impl TransactionSigner for MockSigner {
    fn sign(&self, _authority_key: &str, unsigned_tx: &[u8]) -> EngineResult<Vec<u8>> {
        let mut signed = b"signed:".to_vec();
        signed.extend_from_slice(unsigned_tx);
        Ok(signed)
    }
}

#[derive(Default)]
struct InMemoryStoreState {
    moderators: HashMap<ModeratorId, ModeratorRow>,
    proposals: HashMap<(ModeratorId, ProposalId), ProposalRow>,
    withdrawals: HashMap<(ModeratorId, ProposalId), WithdrawalRow>,
    prices: Vec<PriceHistoryRow>,
    twaps: Vec<TwapHistoryRow>,
    trades: Vec<TradeHistoryRow>,
}

/// The `PersistenceStore` fake used by every engine-level test: a plain
/// `Mutex`-guarded in-memory mirror of the table set, with no actual I/O
/// suspension.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryStoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn price_history_len(&self) -> usize {
        self.state.lock().unwrap().prices.len()
    }

    pub fn twap_history_len(&self) -> usize {
        self.state.lock().unwrap().twaps.len()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_moderator(&self, row: ModeratorRow) -> EngineResult<()> {
        self.state.lock().unwrap().moderators.insert(row.id, row);
        Ok(())
    }

    async fn load_moderators(&self) -> EngineResult<Vec<ModeratorRow>> {
        Ok(self.state.lock().unwrap().moderators.values().cloned().collect())
    }

    async fn save_proposal(&self, row: ProposalRow) -> EngineResult<()> {
        self.state
            .lock()
            .unwrap()
            .proposals
            .insert((row.moderator_id, row.proposal_id), row);
        Ok(())
    }

    async fn load_proposal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<Option<ProposalRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .proposals
            .get(&(moderator_id, proposal_id))
            .cloned())
    }

    async fn load_pending_proposals(&self) -> EngineResult<Vec<ProposalRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .proposals
            .values()
            .filter(|row| matches!(row.status, ProposalStatus::Pending))
            .cloned()
            .collect())
    }

    async fn save_withdrawal(&self, row: WithdrawalRow) -> EngineResult<()> {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .insert((row.moderator_id, row.proposal_id), row);
        Ok(())
    }

    async fn load_withdrawal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<Option<WithdrawalRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .withdrawals
            .get(&(moderator_id, proposal_id))
            .cloned())
    }

    async fn record_price(&self, row: PriceHistoryRow) -> EngineResult<()> {
        self.state.lock().unwrap().prices.push(row);
        Ok(())
    }

    async fn record_twap(&self, row: TwapHistoryRow) -> EngineResult<()> {
        self.state.lock().unwrap().twaps.push(row);
        Ok(())
    }

    async fn record_trade(&self, row: TradeHistoryRow) -> EngineResult<()> {
        self.state.lock().unwrap().trades.push(row);
        Ok(())
    }
}
