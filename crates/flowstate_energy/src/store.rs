//! Energy Store
//!
//! The EnergyStore owns every tracked energy state. It:
//! - Applies the decay/recovery dynamics to all entities in one pass per tick
//! - Serves explicit operations (boost, pause, resume, context updates)
//! - Publishes a deduplicated stream per entity
//!
//! Operations on unknown ids are silent no-ops.

use flowstate_core::observable::lock;
use flowstate_core::{
    Clock, Dynamics, EnergyConfig, EnergyPhase, EnergyState, EntityId, FlowstateError, Observable,
    Subscription, TimerSet, RESONANCE_CAP,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

struct Entry {
    state: EnergyState,
    /// Decay is divided by this (flow bonus); 1.0 outside flow
    decay_divisor: f64,
    observable: Observable<EnergyState>,
}

pub struct EnergyStore {
    entries: Mutex<HashMap<EntityId, Entry>>,
    dynamics: Box<dyn Dynamics>,
    config: EnergyConfig,
    clock: Arc<dyn Clock>,
    timers: TimerSet,
}

impl EnergyStore {
    pub fn new(config: EnergyConfig, clock: Arc<dyn Clock>) -> Self {
        let dynamics = Box::new(config.dynamics.clone());
        Self::with_dynamics(config, dynamics, clock)
    }

    /// Create with a custom dynamics implementation
    pub fn with_dynamics(
        config: EnergyConfig,
        dynamics: Box<dyn Dynamics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dynamics,
            config,
            clock,
            timers: TimerSet::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Track a fresh entity: full energy, stable phase, efficiency 1.
    pub fn create_state(&self) -> (EntityId, EnergyState) {
        let state = EnergyState::new(
            self.config.max,
            self.config.recovery_rate,
            self.config.decay_rate,
            self.clock.now(),
        );
        let id = self.insert(state.clone());
        (id, state)
    }

    /// Track a caller-provided state (clamped first).
    pub fn insert(&self, mut state: EnergyState) -> EntityId {
        state.normalize();
        let id = EntityId::new();
        let entry = Entry {
            observable: Observable::new(state.clone()),
            state,
            decay_divisor: 1.0,
        };
        lock(&self.entries).insert(id, entry);
        tracing::debug!("EnergyStore: tracking entity {}", id);
        id
    }

    /// Stop tracking an entity and complete its stream.
    pub fn remove(&self, id: EntityId) -> Option<EnergyState> {
        let entry = lock(&self.entries).remove(&id)?;
        entry.observable.dispose();
        Some(entry.state)
    }

    pub fn get(&self, id: EntityId) -> Option<EnergyState> {
        lock(&self.entries).get(&id).map(|e| e.state.clone())
    }

    pub fn ids(&self) -> Vec<EntityId> {
        lock(&self.entries).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_mutate(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut Entry),
    ) -> flowstate_core::error::Result<EnergyState> {
        let (observable, snapshot) = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .get_mut(&id)
                .ok_or(FlowstateError::UnknownEntity(id))?;
            f(entry);
            entry.state.normalize();
            (entry.observable.clone(), entry.state.clone())
        };
        observable.publish(snapshot.clone());
        Ok(snapshot)
    }

    fn mutate(&self, id: EntityId, op: &str, f: impl FnOnce(&mut Entry)) -> Option<EnergyState> {
        match self.try_mutate(id, f) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!("EnergyStore: {} ignored ({})", op, e);
                None
            }
        }
    }

    /// Force a phase. A real change counts as a transition.
    pub fn set_phase(&self, id: EntityId, phase: EnergyPhase) -> Option<EnergyState> {
        let now = self.clock.now();
        self.mutate(id, "set_phase", |entry| {
            if entry.state.phase != phase {
                entry.state.phase = phase;
                entry.state.last_transition = now;
            }
        })
    }

    pub fn pause(&self, id: EntityId) -> Option<EnergyState> {
        self.set_phase(id, EnergyPhase::Stable)
    }

    pub fn resume(&self, id: EntityId) -> Option<EnergyState> {
        self.set_phase(id, EnergyPhase::Discharging)
    }

    /// Add `amount`, clamped to `[0, max]`. Overshoot is not an error.
    pub fn boost(&self, id: EntityId, amount: f64) -> Option<EnergyState> {
        self.mutate(id, "boost", |entry| {
            if amount.is_finite() {
                entry.state.current = (entry.state.current + amount).clamp(0.0, entry.state.max);
            }
        })
    }

    pub fn set_decay_divisor(&self, id: EntityId, divisor: f64) -> Option<EnergyState> {
        let divisor = if divisor.is_finite() && divisor > 0.0 {
            divisor
        } else {
            1.0
        };
        self.mutate(id, "set_decay_divisor", |entry| entry.decay_divisor = divisor)
    }

    pub fn decay_divisor(&self, id: EntityId) -> Option<f64> {
        lock(&self.entries).get(&id).map(|e| e.decay_divisor)
    }

    /// Union `tags` into the live context and raise resonance, capped at 1.
    pub fn merge_context<I, S>(
        &self,
        id: EntityId,
        tags: I,
        resonance_nudge: f64,
    ) -> Option<EnergyState>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.mutate(id, "merge_context", |entry| {
            entry.state.context.extend(tags);
            entry.state.resonance =
                (entry.state.resonance + resonance_nudge.max(0.0)).min(RESONANCE_CAP);
        })
    }

    /// Replace the live context (the developer switched activity).
    pub fn set_context<I, S>(&self, id: EntityId, tags: I) -> Option<EnergyState>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        self.mutate(id, "set_context", |entry| entry.state.context = tags)
    }

    /// Listen for changes of one entity. `None` for unknown ids.
    pub fn observe(
        &self,
        id: EntityId,
        listener: impl Fn(&EnergyState) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        let observable = lock(&self.entries).get(&id).map(|e| e.observable.clone())?;
        Some(observable.subscribe(listener))
    }

    pub fn watch(&self, id: EntityId) -> Option<watch::Receiver<EnergyState>> {
        lock(&self.entries).get(&id).map(|e| e.observable.watch())
    }

    /// Apply one decay/recovery step to every entity. The whole pass runs
    /// under the store lock; publication happens afterwards.
    /// Returns the number of entities that changed.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let changed: Vec<(Observable<EnergyState>, EnergyState)> = {
            let mut entries = lock(&self.entries);
            entries
                .values_mut()
                .filter_map(|entry| {
                    self.dynamics
                        .step(&mut entry.state, now, entry.decay_divisor)
                        .then(|| (entry.observable.clone(), entry.state.clone()))
                })
                .collect()
        };

        let count = changed.len();
        for (observable, state) in changed {
            observable.publish(state);
        }
        tracing::trace!("EnergyStore tick: {} entities stepped", count);
        count
    }

    /// Spawn the periodic tick. Stops by itself once the store is dropped.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        self.timers.every("energy_tick", period, move || match weak.upgrade() {
            Some(store) => {
                store.tick();
                true
            }
            None => false,
        });
        tracing::info!("EnergyStore started (tick every {:?})", period);
    }

    /// Cancel the tick timer and complete every entity stream. Idempotent.
    pub fn dispose(&self) {
        self.timers.dispose();
        let drained: Vec<Entry> = lock(&self.entries).drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.observable.dispose();
        }
        if !drained.is_empty() {
            tracing::info!("EnergyStore disposed ({} entities)", drained.len());
        }
    }
}
