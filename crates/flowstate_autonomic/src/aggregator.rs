//! Autonomic Aggregator
//!
//! Upstream components publish into lock-free input slots; three cycles at
//! different rates read whatever is latest and each writes only its own pair
//! of metrics. Nothing is locked across cycles.
//!
//! ```text
//! fast   : presence  = flow.quality · φ₁      clarity   = flow.focus · φ₂
//! medium : resonance = energy.resonance · φ₃  coherence = energy.efficiency · φ₁
//! slow   : harmony   = (presence·φ₁ + clarity·φ₂ + resonance·φ₃) / 3
//!          alignment = (coherence·φ₁ + harmony·φ₂) / 2
//! ```

use arc_swap::{ArcSwap, ArcSwapOption};
use flowstate_core::observable::lock;
use flowstate_core::{
    AggregatedSnapshot, Clock, EnergyState, EntityId, FlowRecord, IntegrationMetrics, Observable,
    Pattern, ScheduleConfig, Subscription, TimerSet,
};
use flowstate_energy::{EnergyStore, FlowController};
use flowstate_patterns::PatternMatcher;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const PHI_1: f64 = 0.618033988749895;
pub const PHI_2: f64 = 0.414213562373095;
pub const PHI_3: f64 = 0.302775637731995;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorStatus {
    /// Energy or flow input not received yet
    Uninitialized,
    Running,
    Disposed,
}

pub struct Aggregator {
    energy: ArcSwapOption<EnergyState>,
    flow: ArcSwapOption<FlowRecord>,
    pattern: ArcSwapOption<Pattern>,
    metrics: ArcSwap<IntegrationMetrics>,
    snapshot: Observable<Option<AggregatedSnapshot>>,
    clock: Arc<dyn Clock>,
    subscriptions: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
    timers: TimerSet,
}

impl Aggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            energy: ArcSwapOption::empty(),
            flow: ArcSwapOption::empty(),
            pattern: ArcSwapOption::empty(),
            metrics: ArcSwap::from_pointee(IntegrationMetrics::default()),
            snapshot: Observable::new(None),
            clock,
            subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            timers: TimerSet::new(),
        }
    }

    /// Subscribe the input slots to their upstream streams and seed them with
    /// the current values. Returns false (and stays `Uninitialized`) when the
    /// entity is unknown to the store.
    pub fn attach(
        self: &Arc<Self>,
        store: &EnergyStore,
        entity: EntityId,
        flow: &FlowController,
        patterns: Option<&PatternMatcher>,
    ) -> bool {
        let weak = Arc::downgrade(self);
        let energy_sub = store.observe(entity, move |state| {
            if let Some(agg) = weak.upgrade() {
                agg.set_energy(state);
            }
        });
        let (Some(energy_sub), Some(state)) = (energy_sub, store.get(entity)) else {
            tracing::warn!(
                "Aggregator: attach failed, entity {} not tracked; staying uninitialized",
                entity
            );
            return false;
        };
        self.set_energy(&state);

        let weak = Arc::downgrade(self);
        let flow_sub = flow.observe(move |record| {
            if let Some(agg) = weak.upgrade() {
                agg.set_flow(record);
            }
        });
        self.set_flow(&flow.record());

        let mut subs = lock(&self.subscriptions);
        subs.push(energy_sub);
        subs.push(flow_sub);

        if let Some(matcher) = patterns {
            let weak = Arc::downgrade(self);
            subs.push(matcher.observe(move |digest| {
                if let Some(agg) = weak.upgrade() {
                    agg.set_pattern(digest.latest.clone());
                }
            }));
            self.set_pattern(matcher.digest().latest);
        }

        tracing::debug!("Aggregator attached to entity {}", entity);
        true
    }

    pub fn set_energy(&self, state: &EnergyState) {
        self.energy.store(Some(Arc::new(state.clone())));
    }

    pub fn set_flow(&self, record: &FlowRecord) {
        self.flow.store(Some(Arc::new(record.clone())));
    }

    pub fn set_pattern(&self, pattern: Option<Pattern>) {
        self.pattern.store(pattern.map(Arc::new));
    }

    pub fn status(&self) -> AggregatorStatus {
        if self.disposed.load(Ordering::SeqCst) {
            AggregatorStatus::Disposed
        } else if self.energy.load().is_some() && self.flow.load().is_some() {
            AggregatorStatus::Running
        } else {
            AggregatorStatus::Uninitialized
        }
    }

    fn inputs(&self, cycle: &str) -> Option<(Arc<EnergyState>, Arc<FlowRecord>)> {
        if self.status() != AggregatorStatus::Running {
            tracing::debug!("Aggregator {} cycle skipped: {:?}", cycle, self.status());
            return None;
        }
        Some((self.energy.load_full()?, self.flow.load_full()?))
    }

    pub fn metrics(&self) -> IntegrationMetrics {
        **self.metrics.load()
    }

    /// presence and clarity, from the flow record.
    pub fn run_fast_cycle(&self) -> bool {
        let Some((_, flow)) = self.inputs("fast") else {
            return false;
        };
        self.metrics.rcu(|current| {
            let mut m = **current;
            m.presence = flow.metrics.quality * PHI_1;
            m.clarity = flow.metrics.focus * PHI_2;
            m.normalize();
            m
        });
        self.publish()
    }

    /// resonance and coherence, from the energy state.
    pub fn run_medium_cycle(&self) -> bool {
        let Some((energy, _)) = self.inputs("medium") else {
            return false;
        };
        self.metrics.rcu(|current| {
            let mut m = **current;
            m.resonance = energy.resonance * PHI_3;
            m.coherence = energy.efficiency * PHI_1;
            m.normalize();
            m
        });
        self.publish()
    }

    /// harmony and alignment, from the most recently written metrics.
    pub fn run_slow_cycle(&self) -> bool {
        if self.inputs("slow").is_none() {
            return false;
        }
        self.metrics.rcu(|current| {
            let mut m = **current;
            m.harmony = (m.presence * PHI_1 + m.clarity * PHI_2 + m.resonance * PHI_3) / 3.0;
            m.alignment = (m.coherence * PHI_1 + m.harmony * PHI_2) / 2.0;
            m.normalize();
            m
        });
        self.publish()
    }

    fn compose(&self) -> Option<AggregatedSnapshot> {
        let energy = self.energy.load_full()?;
        let flow = self.flow.load_full()?;
        Some(AggregatedSnapshot {
            energy: (*energy).clone(),
            flow: (*flow).clone(),
            pattern: self.pattern.load_full().map(|p| (*p).clone()),
            metrics: self.metrics(),
            updated_at: self.clock.now(),
        })
    }

    /// Publish the composed snapshot if anything besides the timestamp moved.
    fn publish(&self) -> bool {
        let Some(next) = self.compose() else {
            return false;
        };
        self.snapshot.update(|current| {
            let changed = match current {
                Some(prev) => {
                    prev.energy != next.energy
                        || prev.flow != next.flow
                        || prev.pattern != next.pattern
                        || prev.metrics != next.metrics
                }
                None => true,
            };
            if changed {
                *current = Some(next);
            }
        })
    }

    /// Freshest view of all inputs. `None` until energy and flow have both
    /// arrived.
    pub fn current_state(&self) -> Option<AggregatedSnapshot> {
        if self.status() != AggregatorStatus::Running {
            return None;
        }
        self.compose()
    }

    /// Called for every published snapshot.
    pub fn observe(
        &self,
        listener: impl Fn(&AggregatedSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.snapshot.subscribe(move |snapshot| {
            if let Some(s) = snapshot {
                listener(s);
            }
        })
    }

    pub fn watch(&self) -> watch::Receiver<Option<AggregatedSnapshot>> {
        self.snapshot.watch()
    }

    pub fn start(self: &Arc<Self>, schedule: &ScheduleConfig) {
        let cycles: [(&'static str, std::time::Duration, fn(&Aggregator) -> bool); 3] = [
            ("aggregator_fast", schedule.fast_cycle(), Aggregator::run_fast_cycle),
            ("aggregator_medium", schedule.medium_cycle(), Aggregator::run_medium_cycle),
            ("aggregator_slow", schedule.slow_cycle(), Aggregator::run_slow_cycle),
        ];
        for (name, period, cycle) in cycles {
            let weak = Arc::downgrade(self);
            self.timers.every(name, period, move || match weak.upgrade() {
                Some(agg) => {
                    cycle(&agg);
                    true
                }
                None => false,
            });
        }
    }

    /// Stop the cycles, drop upstream subscriptions, complete the stream.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.timers.dispose();
        lock(&self.subscriptions).clear();
        self.snapshot.dispose();
    }
}
