//! Round-trip integration tests against a real Postgres instance. Skipped
//! entirely when `DATABASE_URL` isn't set — there is no Postgres reachable
//! in this environment, so these exist for a CI job that does set it.

use futarchy_engine::PersistenceStore;
use futarchy_store::PostgresStore;
use futarchy_types::ids::ModeratorId;
use futarchy_types::rows::ModeratorRow;

async fn connect() -> Option<PostgresStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PostgresStore::new(&url, 5).await.expect("connect to test database");
    store.run_migrations().await.expect("run migrations");
    Some(store)
}

#[tokio::test]
async fn moderator_round_trip() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set; skipping postgres integration test");
        return;
    };

    let row = ModeratorRow {
        id: ModeratorId(999_001),
        proposal_id_counter: 3,
        config_json: serde_json::json!({"base_mint": "BASE"}),
        protocol_name: Some("test-protocol".to_string()),
        updated_at: chrono::Utc::now(),
    };
    store.save_moderator(row.clone()).await.expect("save moderator");

    let loaded = store.load_moderators().await.expect("load moderators");
    let found = loaded.into_iter().find(|m| m.id == row.id).expect("moderator present");
    assert_eq!(found.proposal_id_counter, 3);
    assert_eq!(found.protocol_name.as_deref(), Some("test-protocol"));
}
