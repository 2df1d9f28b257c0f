//! Property-based tests for the pattern matcher.
//!
//! Whatever mix of store changes, clock jumps and aging passes occurs,
//! pattern strength stays in [0, 1], `modified` never precedes `created`,
//! resonance never exceeds its cap, and patterns are never deleted.

use chrono::Duration as ChronoDuration;
use flowstate_core::{EnergyConfig, ManualClock, PatternConfig, RESONANCE_CAP};
use flowstate_energy::EnergyStore;
use flowstate_patterns::PatternMatcher;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Boost(f64),
    Context(Vec<String>),
    Age,
    Advance { hours: i64 },
}

fn arb_tag() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("coding".to_string()),
        Just("meeting".to_string()),
        Just("review".to_string()),
        Just("email".to_string()),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-100.0f64..=100.0).prop_map(Op::Boost),
        prop::collection::vec(arb_tag(), 0..3).prop_map(Op::Context),
        Just(Op::Age),
        (0i64..=30).prop_map(|hours| Op::Advance { hours }),
    ]
}

proptest! {
    #[test]
    fn patterns_stay_consistent(ops in prop::collection::vec(arb_op(), 1..50)) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(EnergyStore::new(EnergyConfig::default(), clock.clone()));
        let (id, _) = store.create_state();
        let matcher = PatternMatcher::new(
            Arc::clone(&store),
            id,
            PatternConfig::default(),
            clock.clone(),
        );

        let mut count = 0;
        for op in ops {
            match op {
                Op::Boost(amount) => { store.boost(id, amount); }
                Op::Context(tags) => { store.set_context(id, tags); }
                Op::Age => { matcher.run_aging_pass(); }
                Op::Advance { hours } => clock.advance(ChronoDuration::hours(hours)),
            }

            let patterns = matcher.patterns();
            prop_assert!(patterns.len() >= count, "patterns were deleted");
            count = patterns.len();
            for p in &patterns {
                prop_assert!((0.0..=1.0).contains(&p.evolution.strength));
                prop_assert!(p.evolution.modified >= p.evolution.created);
                prop_assert!(!p.signature.is_empty());
            }
            prop_assert!(store.get(id).unwrap().resonance <= RESONANCE_CAP);
            prop_assert_eq!(matcher.digest().count, count);
        }
    }
}
