//! Flow Controller
//!
//! A finite-state machine layered on one energy entity:
//!
//! ```text
//! Normal --enter_flow--> Flow --exit_flow--> Normal
//!    \--set_mode--> Recovering / Focus (peers of Normal)
//! ```
//!
//! While in Flow the entity decays more slowly and boosts are amplified by the
//! bonus multiplier. Each mode's target metrics and protection come from
//! `FlowProfiles` data. Two short maintenance cycles keep the record alive:
//! protection strength converges toward the mode's level, and stability
//! follows protection.

use crate::rest::{rest_channel, RestCanceller, RestHandle, RestOutcome, RestTask};
use crate::store::EnergyStore;
use flowstate_core::observable::lock;
use flowstate_core::{
    nonzero_period, Clock, EnergyPhase, EnergyState, EntityId, FlowConfig, FlowKind,
    FlowMetrics, FlowNote, FlowRecord, FlowstateError, Observable, Protection, ScheduleConfig,
    Subscription, TimerSet,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Gaps smaller than this snap to the target so maintenance goes quiet.
const SNAP_EPSILON: f64 = 1e-3;

struct ActiveRest {
    seq: u64,
    canceller: RestCanceller,
    /// Phase to restore when the rest chain ends
    prior_phase: EnergyPhase,
}

pub struct FlowController {
    store: Arc<EnergyStore>,
    entity: EntityId,
    config: FlowConfig,
    clock: Arc<dyn Clock>,
    record: Observable<FlowRecord>,
    notes: Mutex<VecDeque<FlowNote>>,
    active_rest: Mutex<Option<ActiveRest>>,
    rest_seq: AtomicU64,
    rest_tick: Duration,
    timers: TimerSet,
}

impl FlowController {
    pub fn new(
        store: Arc<EnergyStore>,
        entity: EntityId,
        config: FlowConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let level = match store.get(entity) {
            Some(state) => state.level(),
            None => {
                tracing::warn!("FlowController: entity {} is not tracked by the store", entity);
                0.0
            }
        };
        let record = Self::profile_record(
            &config,
            FlowKind::Normal,
            level,
            Protection::default(),
            None,
            now,
        );

        Self {
            store,
            entity,
            config,
            clock,
            record: Observable::new(record),
            notes: Mutex::new(VecDeque::new()),
            active_rest: Mutex::new(None),
            rest_seq: AtomicU64::new(0),
            rest_tick: Duration::from_secs(1),
            timers: TimerSet::new(),
        }
    }

    /// Override the rest tick period (default 1 s). Zero becomes 1 ms.
    pub fn with_rest_tick(mut self, period: Duration) -> Self {
        self.rest_tick = nonzero_period(period);
        self
    }

    fn profile_record(
        config: &FlowConfig,
        kind: FlowKind,
        energy_level: f64,
        previous: Protection,
        cause: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> FlowRecord {
        let p = config.profiles.get(kind);
        let mut record = FlowRecord {
            kind,
            metrics: FlowMetrics {
                quality: p.quality,
                stability: p.stability,
                focus: p.focus,
                clarity: p.clarity,
                depth: p.depth,
                energy: energy_level,
            },
            protection: Protection {
                level: p.protection_level,
                kind: p.protection_kind,
                strength: previous.strength,
            },
            cause,
            timestamp: now,
        };
        record.normalize();
        record
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn kind(&self) -> FlowKind {
        self.record.get().kind
    }

    pub fn record(&self) -> FlowRecord {
        self.record.get()
    }

    pub fn observe(&self, listener: impl Fn(&FlowRecord) + Send + Sync + 'static) -> Subscription {
        self.record.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<FlowRecord> {
        self.record.watch()
    }

    pub fn notes(&self) -> Vec<FlowNote> {
        lock(&self.notes).iter().cloned().collect()
    }

    fn note(&self, text: impl Into<String>) {
        let mut notes = lock(&self.notes);
        notes.push_back(FlowNote {
            at: self.clock.now(),
            text: text.into(),
        });
        while notes.len() > self.config.note_capacity.max(1) {
            notes.pop_front();
        }
    }

    fn energy_level(&self) -> f64 {
        self.store.get(self.entity).map(|s| s.level()).unwrap_or(0.0)
    }

    /// Multiplier applied to decay division and to boosts in `kind`.
    pub fn bonus_for(&self, kind: FlowKind) -> f64 {
        match kind {
            FlowKind::Flow => self.config.bonus_multiplier,
            FlowKind::Normal | FlowKind::Recovering | FlowKind::Focus => 1.0,
        }
    }

    /// Move to `to` if the current mode passes `allowed`. The check and the
    /// write happen under one record update.
    fn transition(
        &self,
        to: FlowKind,
        cause: Option<String>,
        allowed: impl Fn(FlowKind) -> bool,
    ) -> bool {
        let level = self.energy_level();
        let now = self.clock.now();
        let mut from = to;
        let changed = self.record.update(|r| {
            from = r.kind;
            if from == to || !allowed(from) {
                return;
            }
            *r = Self::profile_record(&self.config, to, level, r.protection, cause.clone(), now);
        });
        if !changed {
            if from != to {
                tracing::debug!("Flow transition {} -> {} not allowed", from, to);
            }
            return false;
        }
        self.store.set_decay_divisor(self.entity, self.bonus_for(to));

        let why = cause.as_deref().unwrap_or("-");
        self.note(format!("{} -> {} ({})", from, to, why));
        tracing::info!("Flow transition: {} -> {} ({})", from, to, why);
        true
    }

    /// Normal/Recovering/Focus -> Flow. No-op if already in Flow.
    pub fn enter_flow(&self, trigger: &str) -> bool {
        self.transition(FlowKind::Flow, Some(trigger.to_string()), |_| true)
    }

    /// Flow -> Normal. No-op outside Flow.
    pub fn exit_flow(&self, reason: &str) -> bool {
        self.transition(FlowKind::Normal, Some(reason.to_string()), |from| {
            from == FlowKind::Flow
        })
    }

    /// Set any mode directly.
    pub fn set_mode(&self, kind: FlowKind, cause: &str) -> bool {
        self.transition(kind, Some(cause.to_string()), |_| true)
    }

    /// Add energy; amplified by the bonus multiplier while in Flow.
    pub fn boost(&self, amount: f64, source: &str) -> Option<EnergyState> {
        let multiplier = self.bonus_for(self.kind());
        let effective = amount * multiplier;
        let state = self.store.boost(self.entity, effective)?;
        self.note(format!("boost {:+.2} from {}", effective, source));
        tracing::debug!(
            "Boost from {}: {:.2} x {:.2} -> current={:.2}",
            source,
            amount,
            multiplier,
            state.current
        );
        self.sync_energy(state.level());
        Some(state)
    }

    fn sync_energy(&self, level: f64) {
        self.record.update(|r| {
            r.metrics.energy = level;
            r.normalize();
        });
    }

    /// Move protection strength toward the mode's level. Returns true on change.
    pub fn maintain_protection(&self) -> bool {
        let gain = self.config.protection_gain;
        self.record.update(|r| {
            let p = &mut r.protection;
            let gap = p.level - p.strength;
            if gap.abs() < SNAP_EPSILON {
                p.strength = p.level;
            } else {
                p.strength += gap * gain;
            }
            r.normalize();
        })
    }

    /// Pull stability toward the profile target, lifted by protection, and
    /// re-sync the energy metric. Returns true on change.
    pub fn stabilize_metrics(&self) -> bool {
        let level = self.energy_level();
        let gain = self.config.stabilize_gain;
        let profiles = self.config.profiles.clone();
        self.record.update(|r| {
            let base = profiles.get(r.kind).stability;
            let target = base + (1.0 - base) * r.protection.strength * 0.5;
            let gap = target - r.metrics.stability;
            if gap.abs() < SNAP_EPSILON {
                r.metrics.stability = target;
            } else {
                r.metrics.stability += gap * gain;
            }
            r.metrics.energy = level;
            r.normalize();
        })
    }

    /// Spawn the protection (fast) and stabilization cycles.
    pub fn start(self: &Arc<Self>, schedule: &ScheduleConfig) {
        let weak = Arc::downgrade(self);
        self.timers.every("flow_protection", schedule.protection(), move || {
            match weak.upgrade() {
                Some(ctrl) => {
                    ctrl.maintain_protection();
                    true
                }
                None => false,
            }
        });
        let weak = Arc::downgrade(self);
        self.timers.every("flow_stabilize", schedule.stabilize(), move || {
            match weak.upgrade() {
                Some(ctrl) => {
                    ctrl.stabilize_metrics();
                    true
                }
                None => false,
            }
        });
    }

    /// Recover for `duration_secs`, one increment per rest tick.
    ///
    /// The entity is held in the stable phase for the duration so decay cannot
    /// undo the rest; its previous phase comes back when the rest ends.
    /// Starting a rest cancels any rest already running and takes over its
    /// saved phase.
    pub fn rest(self: &Arc<Self>, duration_secs: f64) -> RestHandle {
        let (handle, task) = rest_channel();

        if self.record.is_disposed() {
            tracing::debug!("rest ignored: {}", FlowstateError::Disposed);
            task.finish(RestOutcome::Cancelled { increments: 0 });
            return handle;
        }

        let total = if duration_secs.is_finite() && duration_secs > 0.0 {
            Duration::try_from_secs_f64(duration_secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        if total.is_zero() {
            task.finish(RestOutcome::Completed { increments: 0 });
            return handle;
        }

        let Some(state) = self.store.get(self.entity) else {
            tracing::debug!("rest ignored: entity {} not tracked", self.entity);
            task.finish(RestOutcome::Cancelled { increments: 0 });
            return handle;
        };

        let seq = self.rest_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut active = lock(&self.active_rest);
            let prior_phase = match active.take() {
                Some(previous) => {
                    previous.canceller.cancel();
                    previous.prior_phase
                }
                None => state.phase,
            };
            *active = Some(ActiveRest {
                seq,
                canceller: handle.canceller(),
                prior_phase,
            });
        }

        self.store.pause(self.entity);
        self.note(format!("rest started ({:.1}s)", total.as_secs_f64()));
        tracing::info!("Rest started for {:.1}s", total.as_secs_f64());

        let weak = Arc::downgrade(self);
        let tick = self.rest_tick;
        self.timers.spawn(Self::run_rest(weak, task, seq, total, tick));
        handle
    }

    async fn run_rest(ctrl: Weak<Self>, task: RestTask, seq: u64, total: Duration, tick: Duration) {
        let start = Instant::now();
        let mut interval = interval_at(start + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = Arc::clone(&task.cancel);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.notified() => {
                    break RestOutcome::Cancelled { increments: task.count() };
                }
                _ = interval.tick() => {
                    let Some(ctrl) = ctrl.upgrade() else {
                        break RestOutcome::Cancelled { increments: task.count() };
                    };
                    // Increment, then check, then signal.
                    let n = task.record_increment();
                    ctrl.apply_rest_increment(n);
                    if start.elapsed() >= total {
                        break RestOutcome::Completed { increments: n };
                    }
                }
            }
        };

        if let Some(ctrl) = ctrl.upgrade() {
            ctrl.finish_rest(seq, &outcome);
        }
        task.finish(outcome);
    }

    fn apply_rest_increment(&self, n: u32) {
        let Some(state) = self.store.get(self.entity) else {
            return;
        };
        if let Some(after) = self.store.boost(self.entity, state.recovery_rate) {
            self.note(format!(
                "rest tick {}: +{:.2} -> {:.2}",
                n, state.recovery_rate, after.current
            ));
            self.sync_energy(after.level());
        }
    }

    fn finish_rest(&self, seq: u64, outcome: &RestOutcome) {
        let prior_phase = {
            let mut active = lock(&self.active_rest);
            match active.as_ref() {
                Some(current) if current.seq == seq => {
                    let prior = current.prior_phase;
                    *active = None;
                    prior
                }
                // Superseded by a newer rest, which now owns the phase.
                _ => {
                    tracing::debug!("Rest {} superseded: {:?}", seq, outcome);
                    return;
                }
            }
        };

        self.restore_phase(prior_phase);
        self.note(format!("rest finished: {:?}", outcome));
        tracing::info!("Rest finished: {:?}", outcome);
    }

    /// Put back the phase saved when the rest began, unless someone changed
    /// it during the rest.
    fn restore_phase(&self, prior_phase: EnergyPhase) {
        if let Some(state) = self.store.get(self.entity) {
            if state.phase == EnergyPhase::Stable && prior_phase != EnergyPhase::Stable {
                self.store.set_phase(self.entity, prior_phase);
            }
        }
    }

    /// Cancel maintenance timers and any running rest; complete the record
    /// stream. Idempotent.
    pub fn dispose(&self) {
        let active = lock(&self.active_rest).take();
        if let Some(rest) = active {
            rest.canceller.cancel();
            // The aborted task never reaches finish_rest.
            self.restore_phase(rest.prior_phase);
            tracing::debug!("Rest {} cancelled by dispose", rest.seq);
        }
        self.timers.dispose();
        self.record.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstate_core::{EnergyConfig, ManualClock, ProtectionKind};

    fn setup() -> (Arc<ManualClock>, Arc<EnergyStore>, Arc<FlowController>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(EnergyStore::new(EnergyConfig::default(), clock.clone()));
        let (id, _) = store.create_state();
        let ctrl = Arc::new(FlowController::new(
            Arc::clone(&store),
            id,
            FlowConfig::default(),
            clock.clone(),
        ));
        (clock, store, ctrl)
    }

    #[test]
    fn test_initial_state_is_normal() {
        let (_, _, ctrl) = setup();
        let r = ctrl.record();
        assert_eq!(r.kind, FlowKind::Normal);
        assert_eq!(r.metrics.energy, 1.0);
        assert_eq!(r.protection.kind, ProtectionKind::None);
    }

    #[test]
    fn test_enter_and_exit_flow() {
        let (_, store, ctrl) = setup();
        assert!(ctrl.enter_flow("deep work"));
        assert!(!ctrl.enter_flow("again"));
        assert_eq!(ctrl.kind(), FlowKind::Flow);
        assert_eq!(store.decay_divisor(ctrl.entity()), Some(1.5));
        assert_eq!(ctrl.record().cause.as_deref(), Some("deep work"));

        assert!(ctrl.exit_flow("meeting"));
        assert!(!ctrl.exit_flow("meeting"));
        assert_eq!(ctrl.kind(), FlowKind::Normal);
        assert_eq!(store.decay_divisor(ctrl.entity()), Some(1.0));
        assert_eq!(ctrl.notes().len(), 2);
    }

    #[test]
    fn test_focus_and_recovering_have_no_bonus() {
        let (_, store, ctrl) = setup();
        assert!(ctrl.set_mode(FlowKind::Focus, "review"));
        assert_eq!(store.decay_divisor(ctrl.entity()), Some(1.0));
        assert!(!ctrl.exit_flow("not in flow"));
        assert!(ctrl.set_mode(FlowKind::Recovering, "tired"));
        assert_eq!(ctrl.bonus_for(ctrl.kind()), 1.0);
    }

    #[test]
    fn test_decay_in_flow_is_divided_by_bonus() {
        let (clock, store, normal) = setup();
        let (flow_id, _) = store.create_state();
        let flow = FlowController::new(
            Arc::clone(&store),
            flow_id,
            FlowConfig::default(),
            clock.clone(),
        );
        store.resume(normal.entity());
        store.resume(flow_id);
        flow.enter_flow("zone");

        clock.advance_minutes(1);
        store.tick();
        let normal_loss = 100.0 - store.get(normal.entity()).unwrap().current;
        let flow_loss = 100.0 - store.get(flow_id).unwrap().current;
        assert!((normal_loss - 0.05 * 0.8).abs() < 1e-9);
        assert!((flow_loss - normal_loss / 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_boost_is_amplified_in_flow() {
        let (_, store, ctrl) = setup();
        let id = ctrl.entity();
        store.boost(id, -50.0);

        ctrl.boost(10.0, "coffee");
        assert_eq!(store.get(id).unwrap().current, 60.0);

        ctrl.enter_flow("zone");
        ctrl.boost(10.0, "coffee");
        assert_eq!(store.get(id).unwrap().current, 75.0);
    }

    #[test]
    fn test_boost_overshoot_clamps() {
        let (_, store, ctrl) = setup();
        let id = ctrl.entity();
        store.boost(id, -50.0);
        let s = ctrl.boost(1000.0, "test").unwrap();
        assert_eq!(s.current, 100.0);
        assert_eq!(ctrl.record().metrics.energy, 1.0);
    }

    #[test]
    fn test_protection_converges_and_goes_quiet() {
        let (_, _, ctrl) = setup();
        ctrl.enter_flow("zone");
        let mut ticks = 0;
        while ctrl.maintain_protection() {
            ticks += 1;
            assert!(ticks < 500, "protection never settled");
        }
        let p = ctrl.record().protection;
        assert_eq!(p.strength, p.level);
        assert_eq!(p.kind, ProtectionKind::Deep);

        ctrl.exit_flow("done");
        assert!(ctrl.maintain_protection());
        assert!(ctrl.record().protection.strength < 0.9);
    }

    #[test]
    fn test_stabilize_tracks_protection() {
        let (_, _, ctrl) = setup();
        ctrl.enter_flow("zone");
        while ctrl.maintain_protection() {}
        let mut ticks = 0;
        while ctrl.stabilize_metrics() {
            ticks += 1;
            assert!(ticks < 500, "stability never settled");
        }
        let r = ctrl.record();
        let expected = 0.8 + 0.2 * 0.9 * 0.5;
        assert!((r.metrics.stability - expected).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_applies_increments_then_completes() {
        let (_, store, ctrl) = setup();
        let id = ctrl.entity();
        store.boost(id, -50.0);
        store.resume(id);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = store.observe(id, move |s| lock(&seen2).push(s.current)).unwrap();

        let started = Instant::now();
        let outcome = ctrl.rest(3.0).wait().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(outcome, RestOutcome::Completed { increments: 3 });

        let s = store.get(id).unwrap();
        assert!((s.current - 50.6).abs() < 1e-9);
        assert_eq!(s.phase, EnergyPhase::Discharging);

        let values = lock(&seen).clone();
        assert!(values.windows(2).all(|w| w[1] >= w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_cancel_stops_increments() {
        let (_, store, ctrl) = setup();
        let id = ctrl.entity();
        store.boost(id, -50.0);

        let handle = ctrl.rest(10.0);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.cancel();
        let outcome = handle.wait().await;
        assert_eq!(outcome, RestOutcome::Cancelled { increments: 2 });

        let after_cancel = store.get(id).unwrap().current;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.get(id).unwrap().current, after_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_rest_completes_immediately() {
        let (_, store, ctrl) = setup();
        let before = store.get(ctrl.entity()).unwrap();
        let outcome = ctrl.rest(0.0).wait().await;
        assert_eq!(outcome, RestOutcome::Completed { increments: 0 });
        assert_eq!(store.get(ctrl.entity()).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_rest_cancels_previous() {
        let (_, store, ctrl) = setup();
        store.boost(ctrl.entity(), -50.0);
        let first = ctrl.rest(10.0);
        store.resume(ctrl.entity());
        let second = ctrl.rest(2.0);
        assert!(!first.wait().await.is_completed());
        assert!(second.wait().await.is_completed());
        // The first rest saw Stable; the chain restores nothing it did not pause.
        assert_eq!(store.get(ctrl.entity()).unwrap().phase, EnergyPhase::Stable);
    }

    #[test]
    fn test_concurrent_enter_flow_transitions_once() {
        let (_, _, ctrl) = setup();
        let entered: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| ctrl.enter_flow("race")))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|entered| *entered)
                .count()
        });
        assert_eq!(entered, 1);
        assert_eq!(ctrl.notes().len(), 1);
        assert_eq!(ctrl.kind(), FlowKind::Flow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_rest() {
        let (_, store, ctrl) = setup();
        store.boost(ctrl.entity(), -50.0);
        store.resume(ctrl.entity());
        let handle = ctrl.rest(10.0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        ctrl.dispose();
        let outcome = handle.wait().await;
        assert!(!outcome.is_completed());
        assert!(outcome.increments() <= 1);
        assert_eq!(store.get(ctrl.entity()).unwrap().phase, EnergyPhase::Discharging);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_rest_duration_saturates() {
        let (_, store, ctrl) = setup();
        store.boost(ctrl.entity(), -50.0);
        store.resume(ctrl.entity());
        let handle = ctrl.rest(1e20);
        assert_eq!(store.get(ctrl.entity()).unwrap().phase, EnergyPhase::Stable);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.cancel();
        let outcome = handle.wait().await;
        assert_eq!(outcome, RestOutcome::Cancelled { increments: 1 });
        assert_eq!(store.get(ctrl.entity()).unwrap().phase, EnergyPhase::Discharging);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rest_tick_still_completes() {
        let (clock, store, _) = setup();
        let (id, _) = store.create_state();
        store.boost(id, -50.0);
        store.resume(id);
        let ctrl = Arc::new(
            FlowController::new(Arc::clone(&store), id, FlowConfig::default(), clock.clone())
                .with_rest_tick(Duration::ZERO),
        );
        let outcome = ctrl.rest(0.01).wait().await;
        assert!(outcome.is_completed());
        assert!(outcome.increments() >= 1);
        assert_eq!(store.get(id).unwrap().phase, EnergyPhase::Discharging);
    }
}
