//! Single process-wide scheduler (spec §4.4). Grounded on
//! `feels-keeper::main`'s `tokio::time::interval` loop for the periodic
//! task kinds, and on `Dmc0125-funding-arbitrage/bot/src/state.rs`'s
//! pattern of one `tokio::spawn` per subscribed item tracked by a
//! `JoinHandle`, adapted into a keyed registry with explicit
//! `abort()`-based cancellation.
//!
//! The task map is reference-counted separately from `Scheduler` itself
//! (`tasks: Arc<Mutex<...>>`) so a spawned tick can reach back into the
//! same map: when one kind detects its proposal is finalized or gone, it
//! cancels every sibling kind for that `(moderator, proposal)` pair in
//! the same step, not just its own loop (spec.md:126 — all periodic
//! tasks stop together, atomically). The `Finalize` one-shot removes its
//! own map entry immediately after running, rather than waiting for
//! `reap_finished`'s unrelated timer (spec.md:130).

use crate::router::Router;
use futarchy_types::ids::{ModeratorId, ProposalId};
use futarchy_types::status::{ProposalStatus, ScheduledTaskKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const PRICE_RECORD_INTERVAL_MS: i64 = 5_000;
const SPOT_PRICE_RECORD_INTERVAL_MS: i64 = 60_000;
const FINALIZE_DELAY_MS: i64 = 1_000;

type TaskMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn task_key(kind: ScheduledTaskKind, moderator_id: ModeratorId, proposal_id: ProposalId) -> String {
    format!("{}-{}-{}", kind.as_key_prefix(), moderator_id, proposal_id)
}

/// Removes and aborts all four task kinds for `(moderator_id,
/// proposal_id)`, whichever of them are present. Shared by the public
/// `cancel_proposal_tasks` and by a periodic tick cancelling its
/// siblings on detecting the proposal is done.
async fn cancel_all(tasks: &TaskMap, moderator_id: ModeratorId, proposal_id: ProposalId) {
    let mut tasks = tasks.lock().await;
    for kind in [
        ScheduledTaskKind::TwapCrank,
        ScheduledTaskKind::PriceRecord,
        ScheduledTaskKind::SpotPriceRecord,
        ScheduledTaskKind::Finalize,
    ] {
        let key = task_key(kind, moderator_id, proposal_id);
        if let Some(handle) = tasks.remove(&key) {
            handle.abort();
        }
    }
}

pub struct Scheduler {
    router: Arc<Router>,
    tasks: TaskMap,
}

impl Scheduler {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn has_task(
        &self,
        kind: ScheduledTaskKind,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
    ) -> bool {
        self.tasks
            .lock()
            .await
            .contains_key(&task_key(kind, moderator_id, proposal_id))
    }

    /// Schedules `TwapCrank` (at `twap_interval_ms`), `PriceRecord` (at 5
    /// s), `SpotPriceRecord` (at 60 s, only if `has_spot`), and a one-shot
    /// `Finalize` at `finalized_at_ms + 1000 ms`. Each key independently
    /// no-ops if already present, so `create_proposal` and recovery both
    /// calling this compose without double-scheduling.
    pub async fn schedule_proposal_tasks(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        twap_interval_ms: i64,
        finalized_at_ms: i64,
        has_spot: bool,
    ) {
        self.schedule_periodic(
            ScheduledTaskKind::TwapCrank,
            moderator_id,
            proposal_id,
            twap_interval_ms.max(0),
        )
        .await;
        self.schedule_periodic(
            ScheduledTaskKind::PriceRecord,
            moderator_id,
            proposal_id,
            PRICE_RECORD_INTERVAL_MS,
        )
        .await;
        if has_spot {
            self.schedule_periodic(
                ScheduledTaskKind::SpotPriceRecord,
                moderator_id,
                proposal_id,
                SPOT_PRICE_RECORD_INTERVAL_MS,
            )
            .await;
        }
        self.schedule_finalize(moderator_id, proposal_id, finalized_at_ms)
            .await;
    }

    async fn schedule_periodic(
        &self,
        kind: ScheduledTaskKind,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        interval_ms: i64,
    ) {
        let key = task_key(kind, moderator_id, proposal_id);
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&key) {
            return;
        }

        let router = self.router.clone();
        let tasks_handle = self.tasks.clone();
        let log_key = key.clone();
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms.max(1) as u64);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !run_periodic_tick(&router, kind, moderator_id, proposal_id).await {
                    cancel_all(&tasks_handle, moderator_id, proposal_id).await;
                    break;
                }
            }
            tracing::debug!(task = %log_key, "periodic task loop exited");
        });
        tasks.insert(key, handle);
    }

    async fn schedule_finalize(
        &self,
        moderator_id: ModeratorId,
        proposal_id: ProposalId,
        finalized_at_ms: i64,
    ) {
        let key = task_key(ScheduledTaskKind::Finalize, moderator_id, proposal_id);
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&key) {
            return;
        }

        let router = self.router.clone();
        let tasks_handle = self.tasks.clone();
        let finalize_key = key.clone();
        let fire_at_ms = finalized_at_ms + FINALIZE_DELAY_MS;
        let handle = tokio::spawn(async move {
            let delay_ms = (fire_at_ms - now_ms()).max(0);
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;

            if let Err(err) = router
                .finalize_proposal(moderator_id, proposal_id, now_ms())
                .await
            {
                tracing::error!(
                    moderator = %moderator_id,
                    proposal = %proposal_id,
                    error = %err,
                    "scheduled finalize failed"
                );
            }

            if let Some(handle) = tasks_handle.lock().await.remove(&finalize_key) {
                handle.abort();
            }
        });
        tasks.insert(key, handle);
    }

    /// Removes all four kinds atomically relative to scheduling: a
    /// concurrent `schedule_proposal_tasks` call either completes
    /// entirely before this runs or observes every key gone, never a
    /// partial set.
    pub async fn cancel_proposal_tasks(&self, moderator_id: ModeratorId, proposal_id: ProposalId) {
        cancel_all(&self.tasks, moderator_id, proposal_id).await;
    }

    /// Drops the registry entry for any task whose `JoinHandle` has
    /// already completed. In the steady state this should rarely find
    /// anything, since both the periodic loop and the `Finalize` one-shot
    /// now remove their own (and, for periodic tasks, their siblings')
    /// entries as soon as they stop; this remains as a backstop against a
    /// task that panics before reaching its own cleanup. Call
    /// periodically from `crates/service`'s main loop.
    pub async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
    }
}

/// One periodic tick for `kind`: resolves `(moderator_id, proposal_id)`
/// through the Router, checks the cancellation conditions of spec §4.4
/// (missing moderator, missing proposal, or past `finalizedAt`), then
/// performs the tick-specific work. Returns `false` when the task should
/// stop (cancellation condition met) — the caller is responsible for
/// cancelling the sibling task kinds in that case — or `true` to keep
/// running.
async fn run_periodic_tick(
    router: &Router,
    kind: ScheduledTaskKind,
    moderator_id: ModeratorId,
    proposal_id: ProposalId,
) -> bool {
    let now = now_ms();

    let Some(status) = router.proposal_status(moderator_id, proposal_id).await else {
        return false;
    };
    if status == ProposalStatus::Finalized {
        return false;
    }

    let Some(finalized_at) = router
        .proposal_finalized_at_ms(moderator_id, proposal_id)
        .await
    else {
        return false;
    };
    if now >= finalized_at {
        return false;
    }

    let result = match kind {
        ScheduledTaskKind::TwapCrank => router.crank_proposal(moderator_id, proposal_id, now).await,
        ScheduledTaskKind::PriceRecord => {
            router.record_price_history(moderator_id, proposal_id, now).await
        }
        ScheduledTaskKind::SpotPriceRecord => {
            router
                .record_spot_price_history(moderator_id, proposal_id, now)
                .await
        }
        ScheduledTaskKind::Finalize => unreachable!("Finalize is scheduled one-shot, not periodic"),
    };

    if let Err(err) = result {
        // Transient fetch/persistence errors are logged and retried next
        // tick; they never cancel the task (spec §7 TransientRpcError /
        // PersistenceError policy).
        tracing::error!(
            moderator = %moderator_id,
            proposal = %proposal_id,
            kind = ?kind,
            error = %err,
            "scheduled tick failed; retrying next interval"
        );
    }
    true
}
