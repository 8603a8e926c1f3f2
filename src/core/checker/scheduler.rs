// src/core/checker/scheduler.rs

//! The check scheduler: keeps one check in flight at the right time for every
//! checkable this peer owns, bounded by the global concurrency cap.
//!
//! Two indexed sets drive the loop: `idle`, ordered by effective next-check
//! time with `(type, name)` tie-breaking, and `pending`, the checkables
//! currently executing. Objects yielded to another authority re-surface every
//! 60 seconds in case ownership changed.

use futures::FutureExt;
use ordered_float::OrderedFloat;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::VigilError;
use crate::core::checker::executor::{execute_check, synthetic_failure};
use crate::core::cluster::authority::FEATURE_CHECKER;
use crate::core::now_ts;
use crate::core::objects::key::ObjectKey;
use crate::core::state::EngineState;

/// How long a checkable owned by another peer sleeps before its ownership is
/// re-examined.
const YIELD_INTERVAL: f64 = 60.0;
/// Upper bound on the jitter applied when authority over an object is gained.
const HANDOFF_JITTER_CAP: f64 = 30.0;
const IDLE_POLL_CAP: f64 = 3600.0;

/// External signals the scheduler reacts to.
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    ObjectAdded(ObjectKey),
    ObjectRemoved(ObjectKey),
    NextCheckChanged(ObjectKey),
    AuthorityChanged,
}

struct CompletedCheck {
    key: ObjectKey,
    outcome: Result<(), VigilError>,
}

pub struct CheckScheduler {
    engine: Arc<EngineState>,
    idle: BTreeSet<(OrderedFloat<f64>, ObjectKey)>,
    /// Mirror of `idle` for O(log n) removal by key.
    times: HashMap<ObjectKey, f64>,
    pending: HashSet<ObjectKey>,
    owned: HashSet<ObjectKey>,
    cmd_rx: mpsc::Receiver<SchedulerCommand>,
    done_tx: mpsc::Sender<CompletedCheck>,
    done_rx: mpsc::Receiver<CompletedCheck>,
    permits: Arc<Semaphore>,
}

fn jitter(cap: f64) -> f64 {
    if cap <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(0.0..cap)
}

impl CheckScheduler {
    pub fn new(engine: Arc<EngineState>, cmd_rx: mpsc::Receiver<SchedulerCommand>) -> Self {
        let cap = engine.config.scheduler.max_concurrent_checks;
        let (done_tx, done_rx) = mpsc::channel(cap.max(16));
        Self {
            engine,
            idle: BTreeSet::new(),
            times: HashMap::new(),
            pending: HashSet::new(),
            owned: HashSet::new(),
            cmd_rx,
            done_tx,
            done_rx,
            permits: Arc::new(Semaphore::new(cap)),
        }
    }

    /// The scheduler main loop.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        self.populate();
        info!(
            "Check scheduler started with {} checkables and a concurrency cap of {}.",
            self.times.len(),
            self.engine.config.scheduler.max_concurrent_checks
        );
        loop {
            let sleep_for = self.time_until_due();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Check scheduler shutting down; no new checks will be scheduled.");
                    self.drain_pending().await;
                    return;
                }
                Some(command) = self.cmd_rx.recv() => self.handle_command(command),
                Some(done) = self.done_rx.recv() => self.handle_completion(done),
                _ = tokio::time::sleep(sleep_for) => self.dispatch_due(),
            }
        }
    }

    /// Waits for in-flight checks to finish or for their deadlines to
    /// elapse, whichever comes first.
    async fn drain_pending(&mut self) {
        let grace = self
            .engine
            .config
            .scheduler
            .check_timeout
            .min(Duration::from_secs(30));
        let deadline = tokio::time::Instant::now() + grace;
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(done)) => {
                    self.pending.remove(&done.key);
                }
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        "{} checks still in flight at shutdown; abandoning them.",
                        self.pending.len()
                    );
                    return;
                }
            }
        }
    }

    fn populate(&mut self) {
        let keys: Vec<ObjectKey> = self
            .engine
            .runtime
            .enumerate_checkables()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.insert_idle(key);
        }
    }

    fn time_until_due(&self) -> Duration {
        let now = now_ts();
        let until = self
            .idle
            .iter()
            .next()
            .map(|(ts, _)| (ts.0 - now).clamp(0.0, IDLE_POLL_CAP))
            .unwrap_or(IDLE_POLL_CAP);
        Duration::from_secs_f64(until)
    }

    /// The ordering key for `idle`: objects owned elsewhere yield for a
    /// minute, an unset next-check is recomputed with fresh-schedule jitter.
    fn effective_next_check(&mut self, key: &ObjectKey) -> f64 {
        if !self.owned.contains(key) {
            return now_ts() + YIELD_INTERVAL;
        }
        let Some(cell) = self.engine.runtime.lookup(key) else {
            return now_ts() + YIELD_INTERVAL;
        };
        let mut entity = cell.entity.lock();
        let Some((config, state, _)) = entity.checkable_mut() else {
            return now_ts() + YIELD_INTERVAL;
        };
        if state.next_check <= 0.0 {
            let base = now_ts().max(state.last_check_end);
            state.next_check = base + jitter(config.check_interval / 5.0);
        }
        state.next_check
    }

    fn refresh_ownership(&mut self, key: &ObjectKey) -> bool {
        let owned = self.engine.is_authoritative(key, FEATURE_CHECKER);
        if owned {
            self.owned.insert(key.clone());
        } else {
            self.owned.remove(key);
        }
        owned
    }

    fn insert_idle(&mut self, key: ObjectKey) {
        self.remove_idle(&key);
        if self.pending.contains(&key) {
            return;
        }
        self.refresh_ownership(&key);
        let at = self.effective_next_check(&key);
        self.insert_at(key, at);
    }

    fn insert_at(&mut self, key: ObjectKey, at: f64) {
        self.remove_idle(&key);
        self.times.insert(key.clone(), at);
        self.idle.insert((OrderedFloat(at), key));
    }

    fn remove_idle(&mut self, key: &ObjectKey) {
        if let Some(at) = self.times.remove(key) {
            self.idle.remove(&(OrderedFloat(at), key.clone()));
        }
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::ObjectAdded(key) => {
                if !self.pending.contains(&key) {
                    self.insert_idle(key);
                }
            }
            SchedulerCommand::ObjectRemoved(key) => {
                self.remove_idle(&key);
                self.owned.remove(&key);
            }
            SchedulerCommand::NextCheckChanged(key) => {
                if self.times.contains_key(&key) {
                    self.insert_idle(key);
                }
            }
            SchedulerCommand::AuthorityChanged => self.rebalance(),
        }
    }

    /// Re-evaluates ownership of every idle checkable after the connected
    /// member set changed. Gained objects are pulled forward with a small
    /// jitter; lost objects fall back to the yield interval.
    fn rebalance(&mut self) {
        let keys: Vec<ObjectKey> = self.times.keys().cloned().collect();
        let now = now_ts();
        let mut gained = 0usize;
        let mut lost = 0usize;
        for key in keys {
            let was_owned = self.owned.contains(&key);
            let owned = self.refresh_ownership(&key);
            if owned && !was_owned {
                gained += 1;
                if let Some(cell) = self.engine.runtime.lookup(&key) {
                    let mut entity = cell.entity.lock();
                    if let Some((config, state, _)) = entity.checkable_mut() {
                        let cap = (config.check_interval / 5.0).min(HANDOFF_JITTER_CAP);
                        state.next_check = now + jitter(cap);
                    }
                }
            } else if !owned && was_owned {
                lost += 1;
            }
            self.insert_idle(key);
        }
        if gained > 0 || lost > 0 {
            info!("Authority rebalance: gained {gained}, yielded {lost} checkables.");
        }
    }

    fn dispatch_due(&mut self) {
        let now = now_ts();
        loop {
            let Some((due, key)) = self.idle.iter().next().cloned() else {
                return;
            };
            if due.0 > now {
                return;
            }
            self.remove_idle(&key);
            self.consider(key, now);
        }
    }

    fn consider(&mut self, key: ObjectKey, now: f64) {
        if !self.engine.runtime.contains(&key) {
            debug!("Dropping deleted checkable '{key}' from scheduling.");
            self.owned.remove(&key);
            return;
        }
        if !self.refresh_ownership(&key) {
            self.insert_at(key, now + YIELD_INTERVAL);
            return;
        }

        let Some(cell) = self.engine.runtime.lookup(&key) else {
            return;
        };
        let scheduled_at;
        {
            let mut entity = cell.entity.lock();
            let Some((config, state, runtime)) = entity.checkable_mut() else {
                return;
            };
            let forced = state.force_next_check;
            if !forced && !state.enable_active_checks {
                drop(entity);
                self.insert_at(key, now + YIELD_INTERVAL);
                return;
            }
            if !forced && !config.check_period.contains(now) {
                let resume = config.check_period.next_inclusion(now);
                drop(entity);
                self.insert_at(key, resume.max(now + 1.0));
                return;
            }
            scheduled_at = if state.next_check > 0.0 { state.next_check } else { now };
            state.force_next_check = false;
            runtime.executing = true;
        }

        self.pending.insert(key.clone());
        self.spawn_check(key, scheduled_at);
    }

    fn spawn_check(&self, key: ObjectKey, scheduled_at: f64) {
        let engine = self.engine.clone();
        let done_tx = self.done_tx.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            // A panicking check must not take the engine down; the offending
            // checkable is isolated instead.
            let outcome = AssertUnwindSafe(run_one_check(engine, key.clone(), scheduled_at))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(VigilError::InvariantViolation {
                        object: key.to_string(),
                        reason: "check task panicked".into(),
                    })
                });
            let _ = done_tx.send(CompletedCheck { key, outcome }).await;
        });
    }

    fn handle_completion(&mut self, done: CompletedCheck) {
        self.pending.remove(&done.key);
        let Some(cell) = self.engine.runtime.lookup(&done.key) else {
            // Deleted during execution; its result was already discarded.
            debug!("Checkable '{}' vanished mid-check.", done.key);
            return;
        };
        {
            let mut entity = cell.entity.lock();
            if let Some((_, _, runtime)) = entity.checkable_mut() {
                runtime.executing = false;
            }
        }
        match done.outcome {
            Ok(()) => self.insert_idle(done.key),
            Err(e) => {
                // Isolate the offending checkable; scheduling resumes for the
                // rest.
                error!("Removing '{}' from scheduling: {e}", done.key);
            }
        }
    }
}

/// Resolves the check command and runs one check end to end.
async fn run_one_check(
    engine: Arc<EngineState>,
    key: ObjectKey,
    scheduled_at: f64,
) -> Result<(), VigilError> {
    let command_name = {
        let cell = engine
            .runtime
            .lookup(&key)
            .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?;
        let entity = cell.entity.lock();
        let (config, _) = entity
            .checkable()
            .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?;
        config.check_command.clone()
    };

    let cr = match engine.commands.get(&command_name) {
        Some(command) => {
            execute_check(
                engine.runner.as_ref(),
                command,
                &key,
                scheduled_at,
                engine.config.scheduler.check_timeout,
                &engine.local_name,
            )
            .await
        }
        None => {
            warn!("Checkable '{key}' references unknown check command '{command_name}'.");
            synthetic_failure(
                &key,
                scheduled_at,
                &engine.local_name,
                &format!("Unknown check command '{command_name}'"),
            )
        }
    };
    engine.apply_local_check_result(&key, cr)
}
