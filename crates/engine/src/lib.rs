//! The proposal lifecycle engine: `Proposal`'s state machine, the
//! per-pool `Moderator`, the process-wide `Router` + `Scheduler`, and the
//! adapter/persistence traits they're built against. `futarchy-oracle`
//! supplies the pure TWAP core this crate drives.

pub mod mock;
pub mod moderator;
pub mod persistence;
pub mod proposal;
pub mod router;
pub mod scheduler;
pub mod sources;

pub use moderator::{CreateProposalParams, Moderator, ModeratorConfig};
pub use persistence::PersistenceStore;
pub use proposal::{CrankOutcome, Proposal, ProposalConfig, StatusInfo};
pub use router::Router;
pub use scheduler::Scheduler;

#[cfg(test)]
mod tests {
    use crate::mock::{InMemoryStore, MockPriceSourceFactory, MockSigner, MockVaultFactory};
    use crate::moderator::{CreateProposalParams, Moderator, ModeratorConfig};
    use crate::proposal::{Proposal, ProposalConfig};
    use crate::router::Router;
    use crate::scheduler::Scheduler;
    use futarchy_oracle::TwapConfig;
    use futarchy_types::ids::{ModeratorId, ProposalId};
    use futarchy_types::status::{ProposalStatus, ScheduledTaskKind};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn twap_config() -> TwapConfig {
        TwapConfig {
            initial_twap_value: dec!(0.5),
            twap_max_observation_change_per_update: None,
            twap_start_delay_ms: 0,
            pass_threshold_bps: 5000,
            min_update_interval_ms: 100,
        }
    }

    fn moderator_config(pool_address: &str) -> ModeratorConfig {
        let mut pool_authorities = HashMap::new();
        pool_authorities.insert(pool_address.to_string(), "authority-key".to_string());
        ModeratorConfig {
            base_mint: "BASE".to_string(),
            quote_mint: "QUOTE".to_string(),
            base_decimals: 9,
            quote_decimals: 6,
            rpc_endpoint: "https://example.invalid".to_string(),
            pool_authorities,
            damm_withdrawal_percentage: None,
        }
    }

    /// Scenario 5: Proposal finalize with market 1 as winner. Constructed
    /// directly against `Proposal` (rather than through `Moderator`) since
    /// the scenario names only the state machine under test.
    #[tokio::test]
    async fn scenario_proposal_finalize_market_one_wins() {
        let price_factory = MockPriceSourceFactory::new(dec!(0.5));
        let vault_factory = MockVaultFactory;

        let labels = vec!["yes".to_string(), "no".to_string()];
        let mut price_sources = Vec::new();
        for label in &labels {
            price_sources.push(
                futarchy_engine_test_factory_create(&price_factory, label).await,
            );
        }
        let base_vault = vault_factory_create(&vault_factory, vec!["m0".into(), "m1".into()]).await;
        let quote_vault = vault_factory_create(&vault_factory, vec!["m0".into(), "m1".into()]).await;

        let config = ProposalConfig {
            id: ProposalId(1),
            moderator_id: ModeratorId(1),
            title: "test".to_string(),
            description: None,
            markets: 2,
            labels,
            created_at_ms: 0,
            proposal_length_ms: 10_000,
            twap_config: twap_config(),
            base_mint: "BASE".to_string(),
            quote_mint: "QUOTE".to_string(),
            base_decimals: 9,
            quote_decimals: 6,
            spot_pool_address: None,
            total_supply: None,
        };

        let mut proposal = Proposal::new(config, price_sources, base_vault, quote_vault, None).unwrap();
        proposal.initialize(1_000_000, 1_000_000).await.unwrap();

        // Drive market 1 ("no") above market 0 so it wins the TWAP.
        *price_factory.handle("yes").lock().unwrap() = dec!(0.4);
        *price_factory.handle("no").lock().unwrap() = dec!(0.6);
        proposal.crank(1_000).await.unwrap();
        *price_factory.handle("yes").lock().unwrap() = dec!(0.3);
        *price_factory.handle("no").lock().unwrap() = dec!(0.7);
        proposal.crank(5_000).await.unwrap();

        let signer = MockSigner;
        let (status, winner) = proposal
            .finalize(10_000, "authority", "authority-key", &signer)
            .await
            .unwrap();

        assert_eq!(status, ProposalStatus::Finalized);
        assert_eq!(winner, Some(1));
    }

    // Small local helpers so the scenario test above doesn't need to spell
    // out the async-trait call syntax inline.
    async fn futarchy_engine_test_factory_create(
        factory: &MockPriceSourceFactory,
        label: &str,
    ) -> Box<dyn crate::sources::PriceSource> {
        crate::sources::PriceSourceFactory::create(factory, label)
            .await
            .unwrap()
    }

    async fn vault_factory_create(
        factory: &MockVaultFactory,
        mints: Vec<String>,
    ) -> Box<dyn crate::sources::Vault> {
        crate::sources::VaultFactory::create(factory, mints).await.unwrap()
    }

    fn test_params(now_ms: i64, length_ms: i64) -> CreateProposalParams {
        CreateProposalParams {
            title: "proposal".to_string(),
            description: None,
            markets: 2,
            labels: vec!["yes".to_string(), "no".to_string()],
            proposal_length_ms: length_ms,
            twap_config: twap_config(),
            base_amount: 1_000_000,
            quote_amount: 1_000_000,
            spot_pool_address: "pool-1".to_string(),
            total_supply: None,
            now_ms,
        }
    }

    /// Scenario 6: scheduler recovery. A Pending proposal whose
    /// `finalizedAt` is already a minute in the past is recovered by
    /// finalizing it immediately, with none of its four task keys left
    /// scheduled.
    #[tokio::test]
    async fn scenario_scheduler_recovery_finalizes_overdue_proposal() {
        let store = Arc::new(InMemoryStore::new());
        let price_factory = Arc::new(MockPriceSourceFactory::new(dec!(0.5)));
        let vault_factory = Arc::new(MockVaultFactory);
        let signer = Arc::new(MockSigner);

        // "First session": create a proposal whose window already elapsed.
        let created_at_ms = 0;
        let length_ms = 1_000;
        let moderator = Moderator::new(
            ModeratorId(7),
            None,
            moderator_config("pool-1"),
            0,
            store.clone(),
            price_factory.clone(),
            vault_factory.clone(),
            None,
            signer.clone(),
        )
        .unwrap();

        let router = Arc::new(Router::new(
            store.clone(),
            price_factory.clone(),
            vault_factory.clone(),
            None,
            signer.clone(),
        ));
        router.insert_moderator(moderator).await;
        let scheduler = Scheduler::new(router.clone());

        let proposal_id = router
            .create_proposal(ModeratorId(7), test_params(created_at_ms, length_ms), &scheduler)
            .await
            .unwrap();
        scheduler.cancel_proposal_tasks(ModeratorId(7), proposal_id).await;

        // "Restart": a fresh Router + Scheduler over the same store.
        let router2 = Arc::new(Router::new(
            store.clone(),
            price_factory.clone(),
            vault_factory.clone(),
            None,
            signer.clone(),
        ));
        router2.load_moderators().await.unwrap();
        let scheduler2 = Scheduler::new(router2.clone());

        let now_ms = created_at_ms + length_ms + 60_000;
        router2
            .recover_pending_proposals(&scheduler2, now_ms)
            .await
            .unwrap();

        assert_eq!(
            router2.proposal_status(ModeratorId(7), proposal_id).await,
            Some(ProposalStatus::Finalized)
        );
        for kind in [
            ScheduledTaskKind::TwapCrank,
            ScheduledTaskKind::PriceRecord,
            ScheduledTaskKind::SpotPriceRecord,
            ScheduledTaskKind::Finalize,
        ] {
            assert!(!scheduler2.has_task(kind, ModeratorId(7), proposal_id).await);
        }
    }

    /// Scheduler idempotence: `schedule(k); schedule(k)` leaves exactly
    /// one live task for `k`.
    #[tokio::test]
    async fn scheduler_schedule_is_idempotent_per_key() {
        let store = Arc::new(InMemoryStore::new());
        let price_factory = Arc::new(MockPriceSourceFactory::new(dec!(0.5)));
        let vault_factory = Arc::new(MockVaultFactory);
        let signer = Arc::new(MockSigner);
        let router = Arc::new(Router::new(
            store,
            price_factory,
            vault_factory,
            None,
            signer,
        ));
        let scheduler = Scheduler::new(router);

        let moderator_id = ModeratorId(1);
        let proposal_id = ProposalId(1);
        scheduler
            .schedule_proposal_tasks(moderator_id, proposal_id, 1_000, 10_000_000, false)
            .await;
        let count_after_first = scheduler.task_count().await;
        scheduler
            .schedule_proposal_tasks(moderator_id, proposal_id, 1_000, 10_000_000, false)
            .await;
        let count_after_second = scheduler.task_count().await;

        assert_eq!(count_after_first, count_after_second);
        scheduler.cancel_proposal_tasks(moderator_id, proposal_id).await;
        assert_eq!(scheduler.task_count().await, 0);
    }

    /// A moderator's withdraw-api-less, never-matched pool address is
    /// rejected with `ConfigError`, not a silent default signer.
    #[tokio::test]
    async fn get_authority_for_pool_has_no_fallback() {
        let store = Arc::new(InMemoryStore::new());
        let price_factory = Arc::new(MockPriceSourceFactory::new(dec!(0.5)));
        let vault_factory = Arc::new(MockVaultFactory);
        let signer = Arc::new(MockSigner);
        let moderator = Moderator::new(
            ModeratorId(1),
            None,
            moderator_config("pool-1"),
            0,
            store,
            price_factory,
            vault_factory,
            None,
            signer,
        )
        .unwrap();

        assert!(moderator.get_authority_for_pool("pool-1").is_ok());
        assert!(moderator.get_authority_for_pool("unknown-pool").is_err());
    }

    /// `proposalIdCounter` advances by exactly one per `create_proposal`
    /// call, success or failure (Open Question 1 — see DESIGN.md).
    #[tokio::test]
    async fn proposal_id_counter_advances_on_failure_too() {
        let store = Arc::new(InMemoryStore::new());
        let price_factory = Arc::new(MockPriceSourceFactory::new(dec!(0.5)));
        let vault_factory = Arc::new(MockVaultFactory);
        let signer = Arc::new(MockSigner);
        let moderator = Moderator::new(
            ModeratorId(3),
            None,
            moderator_config("pool-1"),
            0,
            store.clone(),
            price_factory.clone(),
            vault_factory.clone(),
            None,
            signer.clone(),
        )
        .unwrap();
        let router = Arc::new(Router::new(store, price_factory, vault_factory, None, signer));
        router.insert_moderator(moderator).await;
        let scheduler = Scheduler::new(router.clone());

        // Missing spot_pool_address is a ConfigError in create_proposal_inner.
        let mut bad_params = test_params(0, 1_000);
        bad_params.spot_pool_address = String::new();
        let result = router.create_proposal(ModeratorId(3), bad_params, &scheduler).await;
        assert!(result.is_err());

        let good_params = test_params(0, 1_000);
        let ok = router.create_proposal(ModeratorId(3), good_params, &scheduler).await;
        assert!(ok.is_ok());
        // The failed call consumed id 1; the successful one got id 2.
        assert_eq!(ok.unwrap(), ProposalId(2));
    }
}
