//! The adapter contracts this engine needs from its external collaborators
//! (spec §6): the AMM backend behind each conditional market, the two
//! token vaults, and the liquidity-withdraw HTTP API. These are narrow —
//! only the observable-price/liquidity/settlement surface and the
//! split/merge/redeem surface, nothing of the AMM math or on-chain program
//! logic itself. Dynamic polymorphism via trait objects, per §9's design
//! note: a capability interface, with concrete backends selected by
//! configuration.

use async_trait::async_trait;
use futarchy_types::errors::EngineResult;
use futarchy_types::status::{PriceSourceState, VaultState};
use rust_decimal::Decimal;
use std::fmt;

/// One conditional market's AMM, reduced to the surface this engine reads
/// and the settlement calls it issues.
#[async_trait]
pub trait PriceSource: Send + Sync + fmt::Debug {
    fn state(&self) -> PriceSourceState;

    /// Seeds the pool; idempotent once `Trading`.
    async fn initialize(&mut self, base_amount: u128, quote_amount: u128) -> EngineResult<()>;

    /// Current mid price, base per quote.
    async fn fetch_price(&self) -> EngineResult<Decimal>;

    async fn fetch_liquidity(&self) -> EngineResult<u128>;

    /// Terminal: subsequent calls fail. Returns a settlement signature.
    async fn remove_liquidity(&mut self) -> EngineResult<String>;

    /// Opaque snapshot for the persistence layer; paired with a
    /// `PriceSourceFactory::deserialize` of the same backend.
    fn serialize(&self) -> Vec<u8>;
}

/// Builds a `PriceSource` for a new market, or rehydrates one from its
/// serialized snapshot after a restart. One implementation per AMM
/// backend; selected by configuration, not by this engine.
#[async_trait]
pub trait PriceSourceFactory: Send + Sync {
    async fn create(&self, market_label: &str) -> EngineResult<Box<dyn PriceSource>>;
    fn deserialize(&self, bytes: &[u8]) -> EngineResult<Box<dyn PriceSource>>;
}

/// One of the two token vaults (base or quote), each holding N conditional
/// mints — one per market.
#[async_trait]
pub trait Vault: Send + Sync + fmt::Debug {
    fn state(&self) -> VaultState;

    /// One mint id per market, in market order.
    fn conditional_mints(&self) -> &[String];

    async fn initialize(&mut self) -> EngineResult<()>;

    async fn build_split_tx(&self, user: &str, amount: u128) -> EngineResult<Vec<u8>>;
    async fn execute_split_tx(&self, signed_tx: Vec<u8>) -> EngineResult<String>;

    async fn build_merge_tx(&self, user: &str, amount: u128) -> EngineResult<Vec<u8>>;
    async fn execute_merge_tx(&self, signed_tx: Vec<u8>) -> EngineResult<String>;

    /// Closes splitting/merging against `winning_mint`; the vault is
    /// expected to become idempotent-finalized after success.
    async fn finalize(&mut self, winning_mint: &str) -> EngineResult<()>;

    async fn build_redeem_winning_tokens_tx(&self, user: &str) -> EngineResult<Vec<u8>>;
    async fn execute_redeem_winning_tokens_tx(&self, signed_tx: Vec<u8>) -> EngineResult<String>;

    fn serialize(&self) -> Vec<u8>;
}

#[async_trait]
pub trait VaultFactory: Send + Sync {
    async fn create(&self, conditional_mints: Vec<String>) -> EngineResult<Box<dyn Vault>>;
    fn deserialize(&self, bytes: &[u8]) -> EngineResult<Box<dyn Vault>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Damm,
    Dlmm,
}

#[derive(Debug, Clone)]
pub struct WithdrawBuildResponse {
    pub request_id: String,
    pub unsigned_transaction: Vec<u8>,
    pub estimated_token_a: u128,
    pub estimated_token_b: u128,
    pub token_a_mint: String,
    pub token_b_mint: String,
    pub decimals_a: u8,
    pub decimals_b: u8,
}

#[derive(Debug, Clone)]
pub struct WithdrawConfirmResponse {
    pub signature: String,
    pub amount_token_a: u128,
    pub amount_token_b: u128,
    pub pool_address: String,
}

#[derive(Debug, Clone)]
pub struct DepositBackResponse {
    pub signature: String,
    pub deposited: bool,
}

/// The external liquidity-withdraw HTTP API (spec §6). Out of core scope
/// as an implementation, but the engine calls it through this trait during
/// `Moderator::create_proposal` and the post-finalize deposit-back flow.
#[async_trait]
pub trait WithdrawApi: Send + Sync {
    async fn build_withdraw(
        &self,
        pool_kind: PoolKind,
        percentage: u8,
        pool_address: &str,
    ) -> EngineResult<WithdrawBuildResponse>;

    async fn confirm_withdraw(
        &self,
        request_id: &str,
        signed_transaction: Vec<u8>,
    ) -> EngineResult<WithdrawConfirmResponse>;

    async fn cleanup_swap_and_deposit(
        &self,
        pool_address: &str,
        signer_key: &str,
    ) -> EngineResult<Option<DepositBackResponse>>;
}

/// Produces a signed transaction from an unsigned one using a named
/// per-pool authority key. Key material and its encryption at rest are out
/// of core scope (spec §1); this trait is the narrow seam the moderator
/// calls through.
pub trait TransactionSigner: Send + Sync {
    fn sign(&self, authority_key: &str, unsigned_tx: &[u8]) -> EngineResult<Vec<u8>>;
}
