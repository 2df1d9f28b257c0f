//! Pattern Matcher
//!
//! Watches one entity of an `EnergyStore`. On each material change:
//!
//! 1. Patterns whose level is within tolerance AND whose signature shares a
//!    tag with the live context are reinforced.
//! 2. If none match and the context is non-empty, a new pattern is created
//!    with strength 1.
//!
//! The aging pass closes the loop: strong, recently touched patterns merge
//! their tags back into the live context and nudge resonance up. Resonance
//! saturates at `RESONANCE_CAP`, after which the store stops publishing and
//! the loop goes quiet.

use chrono::Duration as ChronoDuration;
use flowstate_core::observable::lock;
use flowstate_core::state::unit;
use flowstate_core::{
    Clock, EnergyState, EntityId, Observable, Pattern, PatternConfig, PatternDigest, Subscription,
    TimerSet,
};
use flowstate_energy::EnergyStore;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// What one aging pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgingReport {
    /// Strong recent patterns whose tags were fed back
    pub reinforced: usize,
    /// Stale patterns that lost strength
    pub decayed: usize,
}

pub struct PatternMatcher {
    store: Arc<EnergyStore>,
    entity: EntityId,
    config: PatternConfig,
    clock: Arc<dyn Clock>,
    patterns: Mutex<Vec<Pattern>>,
    /// Id of the pattern most recently created or reinforced
    latest: Mutex<Option<String>>,
    last_seen: Mutex<Option<EnergyState>>,
    digest: Observable<PatternDigest>,
    subscription: Mutex<Option<Subscription>>,
    timers: TimerSet,
}

impl PatternMatcher {
    /// Create a matcher and subscribe it to `entity`. An unknown entity is
    /// logged; the matcher then only reacts to direct `observe_state` calls.
    pub fn new(
        store: Arc<EnergyStore>,
        entity: EntityId,
        config: PatternConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let matcher = Arc::new(Self {
            store,
            entity,
            config,
            clock,
            patterns: Mutex::new(Vec::new()),
            latest: Mutex::new(None),
            last_seen: Mutex::new(None),
            digest: Observable::new(PatternDigest::default()),
            subscription: Mutex::new(None),
            timers: TimerSet::new(),
        });
        matcher.attach();
        matcher
    }

    fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscription = self.store.observe(self.entity, move |state| {
            if let Some(matcher) = weak.upgrade() {
                matcher.observe_state(state);
            }
        });
        match subscription {
            Some(sub) => *lock(&self.subscription) = Some(sub),
            None => tracing::warn!(
                "PatternMatcher: entity {} is not tracked, matcher detached",
                self.entity
            ),
        }
    }

    /// Match one state. Returns true if the pattern set changed.
    ///
    /// Changes that only move efficiency or timestamps are ignored.
    pub fn observe_state(&self, state: &EnergyState) -> bool {
        {
            let mut last = lock(&self.last_seen);
            if let Some(prev) = last.as_ref() {
                if !state.materially_differs(prev) {
                    tracing::trace!("PatternMatcher: immaterial change skipped");
                    return false;
                }
            }
            *last = Some(state.clone());
        }
        self.match_state(state)
    }

    fn match_state(&self, state: &EnergyState) -> bool {
        let now = self.clock.now();
        let level = state.level();
        let latest = {
            let mut patterns = lock(&self.patterns);
            let mut touched = None;
            for pattern in patterns.iter_mut() {
                if (pattern.level() - level).abs() < self.config.level_tolerance
                    && pattern.overlaps(&state.context)
                {
                    pattern.reinforce(state, self.config.reinforce_increment, now);
                    touched = Some(pattern.id.clone());
                }
            }

            if touched.is_none() {
                if state.context.is_empty() {
                    return false;
                }
                let pattern = Pattern::new(state, now);
                tracing::debug!(
                    "PatternMatcher: new pattern {} for {:?} at level {:.2}",
                    pattern.id,
                    pattern.signature,
                    level
                );
                touched = Some(pattern.id.clone());
                patterns.push(pattern);
            }
            touched
        };

        *lock(&self.latest) = latest;
        self.publish_digest();
        true
    }

    /// Feed strong recent patterns back and decay stale ones.
    pub fn run_aging_pass(&self) -> AgingReport {
        let now = self.clock.now();
        let recent = ChronoDuration::seconds(self.config.recent_window_secs);
        let stale = ChronoDuration::seconds(self.config.stale_window_secs);

        let mut report = AgingReport::default();
        let mut tags: BTreeSet<String> = BTreeSet::new();
        {
            let mut patterns = lock(&self.patterns);
            for pattern in patterns.iter_mut() {
                let age = now - pattern.evolution.modified;
                if age > stale {
                    pattern.evolution.strength =
                        unit(pattern.evolution.strength * self.config.stale_decay);
                    report.decayed += 1;
                } else if age < recent && pattern.strength() > self.config.strong_threshold {
                    tags.extend(pattern.signature.iter().cloned());
                    report.reinforced += 1;
                }
            }
        }

        if report.decayed > 0 {
            self.publish_digest();
        }
        // The store publishes synchronously into observe_state, so no matcher
        // lock may be held here.
        if !tags.is_empty() {
            self.store
                .merge_context(self.entity, tags, self.config.resonance_nudge);
        }

        tracing::trace!(
            "PatternMatcher aging: {} fed back, {} decayed",
            report.reinforced,
            report.decayed
        );
        report
    }

    fn publish_digest(&self) {
        let digest = {
            let patterns = lock(&self.patterns);
            let latest_id = lock(&self.latest).clone();
            PatternDigest {
                latest: latest_id
                    .and_then(|id| patterns.iter().find(|p| p.id == id).cloned()),
                strongest: patterns
                    .iter()
                    .max_by(|a, b| {
                        a.strength()
                            .total_cmp(&b.strength())
                            .then(a.evolution.modified.cmp(&b.evolution.modified))
                    })
                    .cloned(),
                count: patterns.len(),
            }
        };
        self.digest.publish(digest);
    }

    /// Add a pattern learned elsewhere (strength is clamped).
    pub fn seed(&self, mut pattern: Pattern) {
        pattern.evolution.strength = unit(pattern.evolution.strength);
        pattern.evolution.modified = pattern.evolution.modified.max(pattern.evolution.created);
        lock(&self.patterns).push(pattern);
        self.publish_digest();
    }

    pub fn patterns(&self) -> Vec<Pattern> {
        lock(&self.patterns).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.patterns).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn digest(&self) -> PatternDigest {
        self.digest.get()
    }

    pub fn observe(
        &self,
        listener: impl Fn(&PatternDigest) + Send + Sync + 'static,
    ) -> Subscription {
        self.digest.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<PatternDigest> {
        self.digest.watch()
    }

    /// Spawn the aging pass.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        self.timers.every("pattern_aging", period, move || match weak.upgrade() {
            Some(matcher) => {
                matcher.run_aging_pass();
                true
            }
            None => false,
        });
    }

    /// Stop aging, drop the store subscription, complete the digest stream.
    pub fn dispose(&self) {
        self.timers.dispose();
        if let Some(sub) = lock(&self.subscription).take() {
            sub.unsubscribe();
        }
        self.digest.dispose();
    }
}
