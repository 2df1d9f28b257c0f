//! FlowSystem - one tracked developer, wired end to end
//!
//! Owns the energy store (with a single entity), the flow controller on top
//! of it, the pattern matcher watching it, the aggregator reading all three,
//! and the validator reading the aggregator.

use crate::aggregator::{Aggregator, AggregatorStatus};
use crate::validator::{ValidationReport, Validator};
use flowstate_core::{
    AggregatedSnapshot, Clock, EnergyState, EntityId, FlowKind, FlowNote, FlowRecord,
    FlowstateConfig, Pattern, PatternDigest, Subscription, SystemClock,
};
use flowstate_energy::{EnergyStore, FlowController, RestHandle};
use flowstate_patterns::PatternMatcher;
use std::sync::Arc;
use tokio::sync::watch;

pub struct FlowSystem {
    config: FlowstateConfig,
    entity: EntityId,
    store: Arc<EnergyStore>,
    flow: Arc<FlowController>,
    patterns: Arc<PatternMatcher>,
    aggregator: Arc<Aggregator>,
    validator: Validator,
}

impl FlowSystem {
    pub fn new(config: FlowstateConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build every component against `clock`. The developer starts out
    /// working, so the entity begins in the discharging phase.
    pub fn with_clock(config: FlowstateConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(EnergyStore::new(config.energy.clone(), Arc::clone(&clock)));
        let (entity, _) = store.create_state();
        store.resume(entity);

        let flow = Arc::new(
            FlowController::new(
                Arc::clone(&store),
                entity,
                config.flow.clone(),
                Arc::clone(&clock),
            )
            .with_rest_tick(config.schedule.rest_tick()),
        );
        let patterns = PatternMatcher::new(
            Arc::clone(&store),
            entity,
            config.patterns.clone(),
            Arc::clone(&clock),
        );
        let aggregator = Arc::new(Aggregator::new(clock));
        aggregator.attach(&store, entity, &flow, Some(&patterns));

        Self {
            config,
            entity,
            store,
            flow,
            patterns,
            aggregator,
            validator: Validator::new(),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn config(&self) -> &FlowstateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EnergyStore> {
        &self.store
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn pattern_matcher(&self) -> &Arc<PatternMatcher> {
        &self.patterns
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    // === Reads ===

    /// Energy changes of `id`, or of this system's own entity when `None`.
    pub fn observe_energy(
        &self,
        id: Option<EntityId>,
        listener: impl Fn(&EnergyState) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        self.store.observe(id.unwrap_or(self.entity), listener)
    }

    pub fn watch_energy(&self, id: Option<EntityId>) -> Option<watch::Receiver<EnergyState>> {
        self.store.watch(id.unwrap_or(self.entity))
    }

    pub fn energy(&self) -> Option<EnergyState> {
        self.store.get(self.entity)
    }

    pub fn flow_record(&self) -> FlowRecord {
        self.flow.record()
    }

    pub fn notes(&self) -> Vec<FlowNote> {
        self.flow.notes()
    }

    pub fn observe_state(
        &self,
        listener: impl Fn(&AggregatedSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.aggregator.observe(listener)
    }

    pub fn watch_state(&self) -> watch::Receiver<Option<AggregatedSnapshot>> {
        self.aggregator.watch()
    }

    pub fn current_state(&self) -> Option<AggregatedSnapshot> {
        self.aggregator.current_state()
    }

    pub fn status(&self) -> AggregatorStatus {
        self.aggregator.status()
    }

    pub fn patterns(&self) -> Vec<Pattern> {
        self.patterns.patterns()
    }

    pub fn pattern_digest(&self) -> PatternDigest {
        self.patterns.digest()
    }

    // === Operations ===

    pub fn enter_flow(&self, trigger: &str) -> bool {
        self.flow.enter_flow(trigger)
    }

    pub fn exit_flow(&self, reason: &str) -> bool {
        self.flow.exit_flow(reason)
    }

    pub fn set_mode(&self, kind: FlowKind, cause: &str) -> bool {
        self.flow.set_mode(kind, cause)
    }

    pub fn boost(&self, amount: f64, source: &str) -> Option<EnergyState> {
        self.flow.boost(amount, source)
    }

    pub fn set_context<I, S>(&self, tags: I) -> Option<EnergyState>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store.set_context(self.entity, tags)
    }

    pub fn pause(&self) -> Option<EnergyState> {
        self.store.pause(self.entity)
    }

    pub fn resume(&self) -> Option<EnergyState> {
        self.store.resume(self.entity)
    }

    pub fn rest(&self, duration_secs: f64) -> RestHandle {
        self.flow.rest(duration_secs)
    }

    pub fn validate_system_state(&self) -> ValidationReport {
        self.validator.validate(self.current_state().as_ref())
    }

    // === Lifecycle ===

    /// Spawn every component's timers. Must run inside a tokio runtime.
    pub fn start(&self) {
        let schedule = &self.config.schedule;
        self.store.start(schedule.energy_tick());
        self.flow.start(schedule);
        self.patterns.start(schedule.pattern_aging());
        self.aggregator.start(schedule);
        tracing::info!(
            "FlowSystem started for entity {} ({:?})",
            self.entity,
            self.aggregator.status()
        );
    }

    /// Tear down in reverse dependency order. Idempotent.
    pub fn dispose(&self) {
        self.aggregator.dispose();
        self.patterns.dispose();
        self.flow.dispose();
        self.store.dispose();
        tracing::info!("FlowSystem disposed");
    }
}

impl Drop for FlowSystem {
    fn drop(&mut self) {
        self.dispose();
    }
}
