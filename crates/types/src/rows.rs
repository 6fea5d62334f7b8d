//! Wire-format structs mirroring the persistence contract's table set
//! (spec §6). These are the shapes `futarchy-store` maps to/from SQL rows
//! and the shapes `futarchy-engine` serializes into/out of when recreating
//! in-memory state from the store — field-per-column, the way the
//! teacher's own `models/market.rs`/`models/swap.rs` mirror their tables.

use crate::ids::{ModeratorId, ProposalId};
use crate::status::ProposalStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorRow {
    pub id: ModeratorId,
    pub proposal_id_counter: i64,
    pub config_json: serde_json::Value,
    pub protocol_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRow {
    pub moderator_id: ModeratorId,
    pub proposal_id: ProposalId,
    pub title: String,
    pub description: Option<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub proposal_length_ms: i64,
    pub base_mint: String,
    pub quote_mint: String,
    pub base_decimals: i16,
    pub quote_decimals: i16,
    pub markets: i16,
    pub market_labels: Vec<String>,
    pub amm_config_json: serde_json::Value,
    pub twap_config_json: serde_json::Value,
    pub amm_data_json: Vec<serde_json::Value>,
    pub twap_oracle_data_json: serde_json::Value,
    /// `{"base": <Vault::serialize output>, "quote": <...>}`. Not named in
    /// the table contract directly, but implied by the same mechanism the
    /// contract specifies for `amm_data_json`; vaults need the same
    /// serialize/deserialize round trip as price sources (spec §8).
    pub vault_data_json: serde_json::Value,
    pub spot_pool_address: Option<String>,
    pub total_supply: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRow {
    pub moderator_id: ModeratorId,
    pub proposal_id: ProposalId,
    pub withdrawal_request_id: String,
    pub withdrawal_signature: String,
    pub withdrawal_percentage: i16,
    pub withdrawn_token_a: String,
    pub withdrawn_token_b: String,
    pub spot_price: Decimal,
    pub needs_deposit_back: bool,
    pub deposit_signature: Option<String>,
    pub deposited_token_a: Option<String>,
    pub deposited_token_b: Option<String>,
    pub deposited_at: Option<DateTime<Utc>>,
    pub pool_address: String,
}

/// `market = -1` indicates spot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistoryRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub moderator_id: ModeratorId,
    pub proposal_id: ProposalId,
    pub market: i32,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapHistoryRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub moderator_id: ModeratorId,
    pub proposal_id: ProposalId,
    pub twaps: Vec<Decimal>,
    pub aggregations: Vec<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistoryRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub moderator_id: ModeratorId,
    pub proposal_id: ProposalId,
    pub market: i32,
    pub user: String,
    pub direction: String,
    pub amount_in: String,
    pub amount_out: String,
    pub price: Decimal,
    pub tx_signature: Option<String>,
}
