//! The clamped time-weighted-average-price oracle: a deterministic,
//! tick-driven, bounded-rate aggregator of N price observations. This crate
//! has no I/O and no async runtime dependency — `crank` takes prices that
//! have already been fetched by the caller, so the only suspension point in
//! the real system (the RPC fetch) lives outside this crate.
//!
//! Arithmetic is `rust_decimal::Decimal` throughout: round-half-to-even,
//! exact at the scale this needs, never `f64`/`f32`.

use futarchy_types::EngineError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const MIN_MARKETS: usize = 2;
pub const MAX_MARKETS: usize = 4;

/// Immutable knobs for one oracle, frozen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwapConfig {
    pub initial_twap_value: Decimal,
    /// `None` disables clamping entirely (observations track price exactly).
    pub twap_max_observation_change_per_update: Option<Decimal>,
    pub twap_start_delay_ms: i64,
    /// Retained for forward compatibility with the pass/fail oracle
    /// variant; unused by `fetch_highest_index` (see DESIGN.md Open
    /// Question 2).
    pub pass_threshold_bps: u16,
    pub min_update_interval_ms: i64,
}

impl TwapConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.initial_twap_value < Decimal::ZERO {
            return Err(EngineError::numeric("initial_twap_value must be >= 0"));
        }
        if let Some(max_change) = self.twap_max_observation_change_per_update {
            if max_change < Decimal::ZERO {
                return Err(EngineError::numeric(
                    "twap_max_observation_change_per_update must be >= 0",
                ));
            }
        }
        if self.twap_start_delay_ms < 0 {
            return Err(EngineError::numeric("twap_start_delay_ms must be >= 0"));
        }
        if self.pass_threshold_bps > 10_000 {
            return Err(EngineError::numeric("pass_threshold_bps must be in [0, 10000]"));
        }
        if self.min_update_interval_ms <= 0 {
            return Err(EngineError::numeric("min_update_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// What `crank` would do if called right now, without actually fetching
/// prices or mutating state. The caller (`Proposal::crank`) checks this
/// before paying for an RPC round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrankGate {
    /// `now >= finalized_at`; crank is a no-op.
    PastFinalization,
    /// `now < last_update_ms + min_update_interval_ms`; crank is throttled.
    Throttled,
    /// Proceed: fetch prices and call `crank`.
    Ready,
}

/// The N-vector oracle state: N clamped observations and N cumulative
/// aggregations, plus the bookkeeping the crank algorithm needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapOracle {
    config: TwapConfig,
    markets: usize,
    observations: Vec<Decimal>,
    aggregations: Vec<Decimal>,
    created_at_ms: i64,
    finalized_at_ms: i64,
    last_update_ms: i64,
}

impl TwapOracle {
    pub fn new(
        config: TwapConfig,
        markets: usize,
        created_at_ms: i64,
        finalized_at_ms: i64,
    ) -> Result<Self, EngineError> {
        if !(MIN_MARKETS..=MAX_MARKETS).contains(&markets) {
            return Err(EngineError::numeric(format!(
                "markets must be in [{MIN_MARKETS}, {MAX_MARKETS}], got {markets}"
            )));
        }
        config.validate()?;
        if finalized_at_ms <= created_at_ms {
            return Err(EngineError::numeric(
                "finalized_at_ms must be greater than created_at_ms",
            ));
        }

        Ok(Self {
            observations: vec![config.initial_twap_value; markets],
            aggregations: vec![Decimal::ZERO; markets],
            config,
            markets,
            created_at_ms,
            finalized_at_ms,
            last_update_ms: created_at_ms,
        })
    }

    pub fn markets(&self) -> usize {
        self.markets
    }

    pub fn config(&self) -> &TwapConfig {
        &self.config
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn finalized_at_ms(&self) -> i64 {
        self.finalized_at_ms
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    pub fn observations(&self) -> &[Decimal] {
        &self.observations
    }

    pub fn aggregations(&self) -> &[Decimal] {
        &self.aggregations
    }

    fn twap_start_ms(&self) -> i64 {
        self.created_at_ms + self.config.twap_start_delay_ms
    }

    /// Steps 1 and 3 of the crank algorithm, without touching any state.
    pub fn crank_gate(&self, now_ms: i64) -> CrankGate {
        if now_ms >= self.finalized_at_ms {
            return CrankGate::PastFinalization;
        }
        if now_ms < self.last_update_ms + self.config.min_update_interval_ms {
            return CrankGate::Throttled;
        }
        CrankGate::Ready
    }

    /// Steps 4-7 of the crank algorithm: clamp each observation toward the
    /// freshly fetched price, integrate into the aggregations once past the
    /// start delay, and advance `last_update_ms`. `prices` must have one
    /// entry per market; the caller is responsible for having already
    /// checked `crank_gate` and fetched `prices` only when it returned
    /// `Ready` — this method re-checks `PastFinalization` defensively and
    /// is a no-op in that case, but does not re-check throttling (a caller
    /// that ignores the gate and cranks early will integrate early, which
    /// is the caller's bug, not a state corruption).
    pub fn crank(&mut self, now_ms: i64, prices: &[Decimal]) -> Result<(), EngineError> {
        if prices.len() != self.markets {
            return Err(EngineError::numeric(format!(
                "expected {} prices, got {}",
                self.markets,
                prices.len()
            )));
        }
        if now_ms >= self.finalized_at_ms {
            return Ok(());
        }

        for i in 0..self.markets {
            self.observations[i] = clamp_observation(
                self.observations[i],
                prices[i],
                self.config.twap_max_observation_change_per_update,
            );
        }

        let twap_start = self.twap_start_ms();
        if now_ms > twap_start {
            let effective_last = self.last_update_ms.max(twap_start);
            let effective_now = now_ms.min(self.finalized_at_ms);
            let dt = effective_now - effective_last;
            if dt > 0 {
                let dt_decimal = Decimal::from(dt);
                for i in 0..self.markets {
                    self.aggregations[i] += self.observations[i] * dt_decimal;
                }
            }
        }

        self.last_update_ms = now_ms;
        Ok(())
    }

    /// `(twaps[N], aggregations[N])` as of `now_ms`.
    pub fn fetch_twaps(&self, now_ms: i64) -> (Vec<Decimal>, Vec<Decimal>) {
        let twap_start = self.twap_start_ms();
        let clamped_now = now_ms.min(self.finalized_at_ms);

        if clamped_now <= twap_start {
            return (self.observations.clone(), vec![Decimal::ZERO; self.markets]);
        }

        let dt = Decimal::from(clamped_now - twap_start);
        let twaps = self
            .aggregations
            .iter()
            .map(|agg| agg / dt)
            .collect::<Vec<_>>();
        (twaps, self.aggregations.clone())
    }

    /// Argmax over `fetch_twaps(now_ms).0`; ties broken by lowest index.
    pub fn fetch_highest_index(&self, now_ms: i64) -> usize {
        let (twaps, _) = self.fetch_twaps(now_ms);
        let mut best = 0;
        for i in 1..twaps.len() {
            if twaps[i] > twaps[best] {
                best = i;
            }
        }
        best
    }
}

fn clamp_observation(current: Decimal, price: Decimal, max_change: Option<Decimal>) -> Decimal {
    match max_change {
        None => price,
        Some(max_change) => {
            if price > current {
                price.min(current + max_change)
            } else {
                price.max((current - max_change).max(Decimal::ZERO))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn config(max_change: Option<Decimal>, start_delay_ms: i64, min_interval_ms: i64) -> TwapConfig {
        TwapConfig {
            initial_twap_value: dec!(0.5),
            twap_max_observation_change_per_update: max_change,
            twap_start_delay_ms: start_delay_ms,
            pass_threshold_bps: 5000,
            min_update_interval_ms: min_interval_ms,
        }
    }

    #[test]
    fn rejects_out_of_range_market_counts() {
        let cfg = config(None, 0, 1000);
        assert!(TwapOracle::new(cfg, 1, 0, 10_000).is_err());
        assert!(TwapOracle::new(cfg, 5, 0, 10_000).is_err());
        assert!(TwapOracle::new(cfg, 2, 0, 10_000).is_ok());
        assert!(TwapOracle::new(cfg, 4, 0, 10_000).is_ok());
    }

    #[test]
    fn rejects_non_positive_window() {
        let cfg = config(None, 0, 1000);
        assert!(TwapOracle::new(cfg, 2, 10_000, 10_000).is_err());
        assert!(TwapOracle::new(cfg, 2, 10_000, 5_000).is_err());
    }

    /// Scenario 1: two-market, no clamp.
    #[test]
    fn scenario_two_market_no_clamp() {
        let cfg = config(None, 0, 1000);
        let mut oracle = TwapOracle::new(cfg, 2, 0, 10_000).unwrap();

        assert_eq!(oracle.crank_gate(1000), CrankGate::Ready);
        oracle.crank(1000, &[dec!(0.6), dec!(0.4)]).unwrap();
        assert_eq!(oracle.crank_gate(2000), CrankGate::Ready);
        oracle.crank(2000, &[dec!(0.7), dec!(0.3)]).unwrap();

        assert_eq!(oracle.aggregations(), &[dec!(1300), dec!(700)]);

        let (twaps, _) = oracle.fetch_twaps(2000);
        assert_eq!(twaps, vec![dec!(0.65), dec!(0.35)]);
        assert_eq!(oracle.fetch_highest_index(2000), 0);
    }

    /// Scenario 2: clamp saturates.
    #[test]
    fn scenario_clamp_saturates() {
        let cfg = config(Some(dec!(0.05)), 0, 1000);
        let mut oracle = TwapOracle::new(cfg, 2, 0, 10_000).unwrap();

        oracle.crank(1000, &[dec!(1.0), dec!(0.5)]).unwrap();
        assert_eq!(oracle.observations()[0], dec!(0.55));
    }

    /// Scenario 3: start-delay gating.
    #[test]
    fn scenario_start_delay_gating() {
        let cfg = config(None, 5000, 1000);
        let mut oracle = TwapOracle::new(cfg, 2, 0, 10_000).unwrap();

        oracle.crank(1000, &[dec!(0.6), dec!(0.4)]).unwrap();
        oracle.crank(3000, &[dec!(0.7), dec!(0.3)]).unwrap();
        assert_eq!(oracle.aggregations(), &[Decimal::ZERO, Decimal::ZERO]);

        oracle.crank(6000, &[dec!(0.8), dec!(0.2)]).unwrap();
        assert_eq!(oracle.aggregations(), &[dec!(800), dec!(200)]);
    }

    /// Scenario 4: post-finalization freeze.
    #[test]
    fn scenario_post_finalization_freeze() {
        let cfg = config(None, 0, 100);
        let mut oracle = TwapOracle::new(cfg, 2, 0, 10_000).unwrap();

        oracle.crank(9500, &[dec!(0.6), dec!(0.4)]).unwrap();
        let agg_before = oracle.aggregations().to_vec();

        assert_eq!(oracle.crank_gate(10_000), CrankGate::PastFinalization);
        oracle.crank(10_000, &[dec!(0.9), dec!(0.1)]).unwrap();
        assert_eq!(oracle.aggregations(), agg_before.as_slice());
        oracle.crank(11_000, &[dec!(0.9), dec!(0.1)]).unwrap();
        assert_eq!(oracle.aggregations(), agg_before.as_slice());

        let (twaps_at_15k, _) = oracle.fetch_twaps(15_000);
        let (twaps_at_10k, _) = oracle.fetch_twaps(10_000);
        assert_eq!(twaps_at_15k, twaps_at_10k);
    }

    #[test]
    fn ties_break_to_lowest_index() {
        let cfg = config(None, 0, 1000);
        let mut oracle = TwapOracle::new(cfg, 3, 0, 10_000).unwrap();
        oracle.crank(1000, &[dec!(0.5), dec!(0.5), dec!(0.5)]).unwrap();
        assert_eq!(oracle.fetch_highest_index(1000), 0);
    }

    #[test]
    fn zero_min_interval_runs_every_tick() {
        let cfg = config(None, 0, 0);
        let mut oracle = TwapOracle::new(cfg, 2, 0, 10_000).unwrap();
        assert_eq!(oracle.crank_gate(0), CrankGate::Ready);
        oracle.crank(0, &[dec!(0.5), dec!(0.5)]).unwrap();
        assert_eq!(oracle.crank_gate(0), CrankGate::Ready);
    }

    #[test]
    fn zero_max_change_freezes_observations() {
        let cfg = config(Some(Decimal::ZERO), 0, 1000);
        let mut oracle = TwapOracle::new(cfg, 2, 0, 10_000).unwrap();
        oracle.crank(1000, &[dec!(0.9), dec!(0.1)]).unwrap();
        assert_eq!(oracle.observations(), &[dec!(0.5), dec!(0.5)]);
    }

    #[test]
    fn serde_round_trip_preserves_behavior() {
        let cfg = config(Some(dec!(0.1)), 1000, 500);
        let mut oracle = TwapOracle::new(cfg, 3, 0, 20_000).unwrap();
        oracle.crank(1500, &[dec!(0.6), dec!(0.4), dec!(0.3)]).unwrap();

        let bytes = serde_json::to_vec(&oracle).unwrap();
        let restored: TwapOracle = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(restored.observations(), oracle.observations());
        assert_eq!(restored.aggregations(), oracle.aggregations());
        assert_eq!(restored.last_update_ms(), oracle.last_update_ms());
        assert_eq!(restored.fetch_highest_index(5000), oracle.fetch_highest_index(5000));
    }

    fn decimal_strategy() -> impl Strategy<Value = Decimal> {
        (0i64..=1_000_000).prop_map(|cents| Decimal::new(cents, 4))
    }

    proptest! {
        /// For all oracles and all tick sequences: `Agg[i]` is non-decreasing.
        #[test]
        fn aggregations_never_decrease(
            ticks in prop::collection::vec((1i64..2000, decimal_strategy(), decimal_strategy()), 1..20),
        ) {
            let cfg = config(None, 0, 1);
            let mut oracle = TwapOracle::new(cfg, 2, 0, 1_000_000).unwrap();
            let mut now = 0i64;
            let mut prev = oracle.aggregations().to_vec();

            for (step, p0, p1) in ticks {
                now += step;
                oracle.crank(now, &[p0, p1]).unwrap();
                let current = oracle.aggregations().to_vec();
                for i in 0..2 {
                    prop_assert!(current[i] >= prev[i]);
                }
                prev = current;
            }
        }

        /// When `maxChange != null`, a single crank moves each observation
        /// by at most `maxChange`.
        #[test]
        fn clamp_bounds_single_tick_movement(
            max_change in decimal_strategy(),
            price in decimal_strategy(),
        ) {
            let cfg = config(Some(max_change), 0, 0);
            let mut oracle = TwapOracle::new(cfg, 2, 0, 1_000_000).unwrap();
            let before = oracle.observations()[0];
            oracle.crank(1, &[price, price]).unwrap();
            let after = oracle.observations()[0];
            prop_assert!((after - before).abs() <= max_change);
        }

        /// No crank before `createdAt + twapStartDelayMs` modifies `Agg`.
        #[test]
        fn pre_start_cranks_never_modify_aggregations(
            start_delay in 100i64..5000,
            now in 0i64..100,
            price in decimal_strategy(),
        ) {
            let cfg = config(None, start_delay, 1);
            let mut oracle = TwapOracle::new(cfg, 2, 0, 1_000_000).unwrap();
            prop_assume!(now < start_delay);
            oracle.crank(now, &[price, price]).unwrap();
            prop_assert_eq!(oracle.aggregations(), &[Decimal::ZERO, Decimal::ZERO]);
        }

        /// No crank at or after `finalizedAt` modifies any field.
        #[test]
        fn post_finalize_cranks_are_total_no_ops(
            price in decimal_strategy(),
        ) {
            let cfg = config(None, 0, 1);
            let mut oracle = TwapOracle::new(cfg, 2, 0, 1000).unwrap();
            oracle.crank(500, &[price, price]).unwrap();
            let snapshot_obs = oracle.observations().to_vec();
            let snapshot_agg = oracle.aggregations().to_vec();
            let snapshot_last = oracle.last_update_ms();

            oracle.crank(1000, &[Decimal::ZERO, Decimal::ZERO]).unwrap();
            oracle.crank(5000, &[Decimal::ONE, Decimal::ONE]).unwrap();

            prop_assert_eq!(oracle.observations(), snapshot_obs.as_slice());
            prop_assert_eq!(oracle.aggregations(), snapshot_agg.as_slice());
            prop_assert_eq!(oracle.last_update_ms(), snapshot_last);
        }
    }
}
