//! Postgres-backed `PersistenceStore`. *Grounded on*
//! `feels-indexer/src/database/postgres_runtime.rs`'s `PostgresManager`:
//! a `PgPool` behind an upsert-by-primary-key API, runtime (not
//! compile-time checked) `sqlx::query`, and manual `row.get` mapping
//! rather than `query_as!`, since this repo has no `DATABASE_URL` to run
//! `cargo sqlx prepare` against at build time.

use async_trait::async_trait;
use futarchy_engine::PersistenceStore;
use futarchy_types::errors::{EngineError, EngineResult};
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::rows::{
    ModeratorRow, PriceHistoryRow, ProposalRow, TradeHistoryRow, TwapHistoryRow, WithdrawalRow,
};
use futarchy_types::status::ProposalStatus;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};

fn status_to_str(status: ProposalStatus) -> &'static str {
    match status {
        ProposalStatus::Uninitialized => "uninitialized",
        ProposalStatus::Pending => "pending",
        ProposalStatus::Finalized => "finalized",
    }
}

fn str_to_status(s: &str) -> EngineResult<ProposalStatus> {
    match s {
        "uninitialized" => Ok(ProposalStatus::Uninitialized),
        "pending" => Ok(ProposalStatus::Pending),
        "finalized" => Ok(ProposalStatus::Finalized),
        other => Err(EngineError::persistence(format!("unknown proposal status {other:?}"))),
    }
}

fn map_sqlx_err(err: sqlx::Error) -> EngineError {
    EngineError::persistence(err.to_string())
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::persistence(e.to_string()))
    }

    /// A `LISTEN price_history_inserted` handle, one notification per
    /// `price_history` row inserted by any process sharing this database —
    /// the change-feed side of the table the scheduler's `PriceRecord`/
    /// `SpotPriceRecord` ticks write at their 5s/60s cadence.
    pub async fn listen_price_history(&self) -> EngineResult<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        listener
            .listen("price_history_inserted")
            .await
            .map_err(map_sqlx_err)?;
        Ok(listener)
    }

    fn proposal_row_from_sql(row: &sqlx::postgres::PgRow) -> EngineResult<ProposalRow> {
        let status_str: String = row.try_get("status").map_err(map_sqlx_err)?;
        let amm_data_json: serde_json::Value = row.try_get("amm_data_json").map_err(map_sqlx_err)?;
        let amm_data_json = amm_data_json
            .as_array()
            .cloned()
            .ok_or_else(|| EngineError::persistence("amm_data_json column was not a JSON array"))?;

        Ok(ProposalRow {
            moderator_id: ModeratorId(row.try_get::<i64, _>("moderator_id").map_err(map_sqlx_err)?),
            proposal_id: ProposalId(row.try_get::<i64, _>("proposal_id").map_err(map_sqlx_err)?),
            title: row.try_get("title").map_err(map_sqlx_err)?,
            description: row.try_get("description").map_err(map_sqlx_err)?,
            status: str_to_status(&status_str)?,
            created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
            finalized_at: row.try_get("finalized_at").map_err(map_sqlx_err)?,
            proposal_length_ms: row.try_get("proposal_length_ms").map_err(map_sqlx_err)?,
            base_mint: row.try_get("base_mint").map_err(map_sqlx_err)?,
            quote_mint: row.try_get("quote_mint").map_err(map_sqlx_err)?,
            base_decimals: row.try_get("base_decimals").map_err(map_sqlx_err)?,
            quote_decimals: row.try_get("quote_decimals").map_err(map_sqlx_err)?,
            markets: row.try_get("markets").map_err(map_sqlx_err)?,
            market_labels: row.try_get("market_labels").map_err(map_sqlx_err)?,
            amm_config_json: row.try_get("amm_config_json").map_err(map_sqlx_err)?,
            twap_config_json: row.try_get("twap_config_json").map_err(map_sqlx_err)?,
            amm_data_json,
            twap_oracle_data_json: row.try_get("twap_oracle_data_json").map_err(map_sqlx_err)?,
            vault_data_json: row.try_get("vault_data_json").map_err(map_sqlx_err)?,
            spot_pool_address: row.try_get("spot_pool_address").map_err(map_sqlx_err)?,
            total_supply: row.try_get("total_supply").map_err(map_sqlx_err)?,
        })
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn save_moderator(&self, row: ModeratorRow) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO moderators (id, proposal_id_counter, config_json, protocol_name, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                proposal_id_counter = EXCLUDED.proposal_id_counter,
                config_json = EXCLUDED.config_json,
                protocol_name = EXCLUDED.protocol_name,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.id.0)
        .bind(row.proposal_id_counter)
        .bind(&row.config_json)
        .bind(&row.protocol_name)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn load_moderators(&self) -> EngineResult<Vec<ModeratorRow>> {
        let rows = sqlx::query("SELECT id, proposal_id_counter, config_json, protocol_name, updated_at FROM moderators")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(ModeratorRow {
                    id: ModeratorId(row.try_get::<i64, _>("id").map_err(map_sqlx_err)?),
                    proposal_id_counter: row.try_get("proposal_id_counter").map_err(map_sqlx_err)?,
                    config_json: row.try_get("config_json").map_err(map_sqlx_err)?,
                    protocol_name: row.try_get("protocol_name").map_err(map_sqlx_err)?,
                    updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
                })
            })
            .collect()
    }

    async fn save_proposal(&self, row: ProposalRow) -> EngineResult<()> {
        let amm_data_json = serde_json::Value::Array(row.amm_data_json.clone());
        sqlx::query(
            r#"
            INSERT INTO proposals (
                moderator_id, proposal_id, title, description, status, created_at,
                finalized_at, proposal_length_ms, base_mint, quote_mint, base_decimals,
                quote_decimals, markets, market_labels, amm_config_json, twap_config_json,
                amm_data_json, twap_oracle_data_json, vault_data_json, spot_pool_address,
                total_supply
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21
            )
            ON CONFLICT (moderator_id, proposal_id) DO UPDATE SET
                status = EXCLUDED.status,
                finalized_at = EXCLUDED.finalized_at,
                amm_data_json = EXCLUDED.amm_data_json,
                twap_oracle_data_json = EXCLUDED.twap_oracle_data_json,
                vault_data_json = EXCLUDED.vault_data_json
            "#,
        )
        .bind(row.moderator_id.0)
        .bind(row.proposal_id.0)
        .bind(&row.title)
        .bind(&row.description)
        .bind(status_to_str(row.status))
        .bind(row.created_at)
        .bind(row.finalized_at)
        .bind(row.proposal_length_ms)
        .bind(&row.base_mint)
        .bind(&row.quote_mint)
        .bind(row.base_decimals)
        .bind(row.quote_decimals)
        .bind(row.markets)
        .bind(&row.market_labels)
        .bind(&row.amm_config_json)
        .bind(&row.twap_config_json)
        .bind(&amm_data_json)
        .bind(&row.twap_oracle_data_json)
        .bind(&row.vault_data_json)
        .bind(&row.spot_pool_address)
        .bind(&row.total_supply)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn load_proposal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<Option<ProposalRow>> {
        let row = sqlx::query("SELECT * FROM proposals WHERE moderator_id = $1 AND proposal_id = $2")
            .bind(moderator_id.0)
            .bind(proposal_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(Self::proposal_row_from_sql).transpose()
    }

    async fn load_pending_proposals(&self) -> EngineResult<Vec<ProposalRow>> {
        let rows = sqlx::query("SELECT * FROM proposals WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter().map(Self::proposal_row_from_sql).collect()
    }

    async fn save_withdrawal(&self, row: WithdrawalRow) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO withdrawals (
                moderator_id, proposal_id, withdrawal_request_id, withdrawal_signature,
                withdrawal_percentage, withdrawn_token_a, withdrawn_token_b, spot_price,
                needs_deposit_back, deposit_signature, deposited_token_a, deposited_token_b,
                deposited_at, pool_address
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (moderator_id, proposal_id) DO UPDATE SET
                needs_deposit_back = EXCLUDED.needs_deposit_back,
                deposit_signature = EXCLUDED.deposit_signature,
                deposited_token_a = EXCLUDED.deposited_token_a,
                deposited_token_b = EXCLUDED.deposited_token_b,
                deposited_at = EXCLUDED.deposited_at
            "#,
        )
        .bind(row.moderator_id.0)
        .bind(row.proposal_id.0)
        .bind(&row.withdrawal_request_id)
        .bind(&row.withdrawal_signature)
        .bind(row.withdrawal_percentage)
        .bind(&row.withdrawn_token_a)
        .bind(&row.withdrawn_token_b)
        .bind(row.spot_price)
        .bind(row.needs_deposit_back)
        .bind(&row.deposit_signature)
        .bind(&row.deposited_token_a)
        .bind(&row.deposited_token_b)
        .bind(row.deposited_at)
        .bind(&row.pool_address)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn load_withdrawal(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> EngineResult<Option<WithdrawalRow>> {
        let row = sqlx::query("SELECT * FROM withdrawals WHERE moderator_id = $1 AND proposal_id = $2")
            .bind(moderator_id.0)
            .bind(proposal_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(WithdrawalRow {
            moderator_id: ModeratorId(row.try_get::<i64, _>("moderator_id").map_err(map_sqlx_err)?),
            proposal_id: ProposalId(row.try_get::<i64, _>("proposal_id").map_err(map_sqlx_err)?),
            withdrawal_request_id: row.try_get("withdrawal_request_id").map_err(map_sqlx_err)?,
            withdrawal_signature: row.try_get("withdrawal_signature").map_err(map_sqlx_err)?,
            withdrawal_percentage: row.try_get("withdrawal_percentage").map_err(map_sqlx_err)?,
            withdrawn_token_a: row.try_get("withdrawn_token_a").map_err(map_sqlx_err)?,
            withdrawn_token_b: row.try_get("withdrawn_token_b").map_err(map_sqlx_err)?,
            spot_price: row.try_get("spot_price").map_err(map_sqlx_err)?,
            needs_deposit_back: row.try_get("needs_deposit_back").map_err(map_sqlx_err)?,
            deposit_signature: row.try_get("deposit_signature").map_err(map_sqlx_err)?,
            deposited_token_a: row.try_get("deposited_token_a").map_err(map_sqlx_err)?,
            deposited_token_b: row.try_get("deposited_token_b").map_err(map_sqlx_err)?,
            deposited_at: row.try_get("deposited_at").map_err(map_sqlx_err)?,
            pool_address: row.try_get("pool_address").map_err(map_sqlx_err)?,
        }))
    }

    async fn record_price(&self, row: PriceHistoryRow) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO price_history (timestamp, moderator_id, proposal_id, market, price) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(row.timestamp)
        .bind(row.moderator_id.0)
        .bind(row.proposal_id.0)
        .bind(row.market)
        .bind(row.price)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn record_twap(&self, row: TwapHistoryRow) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO twap_history (timestamp, moderator_id, proposal_id, twaps, aggregations) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(row.timestamp)
        .bind(row.moderator_id.0)
        .bind(row.proposal_id.0)
        .bind(&row.twaps)
        .bind(&row.aggregations)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn record_trade(&self, row: TradeHistoryRow) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_history (
                timestamp, moderator_id, proposal_id, market, "user", direction,
                amount_in, amount_out, price, tx_signature
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(row.timestamp)
        .bind(row.moderator_id.0)
        .bind(row.proposal_id.0)
        .bind(row.market)
        .bind(&row.user)
        .bind(&row.direction)
        .bind(&row.amount_in)
        .bind(&row.amount_out)
        .bind(row.price)
        .bind(&row.tx_signature)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}
