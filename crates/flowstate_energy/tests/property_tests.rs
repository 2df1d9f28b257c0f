//! Property-based tests for the energy store and flow controller.
//!
//! Whatever sequence of ticks and operations runs, energy stays within
//! `[0, max]` and every unit-interval field stays within `[0, 1]`.

use flowstate_core::{EnergyConfig, FlowConfig, FlowKind, ManualClock};
use flowstate_energy::{EnergyStore, FlowController};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Tick { minutes: i64 },
    Boost(f64),
    Pause,
    Resume,
    Charge,
    EnterFlow,
    ExitFlow,
    Mode(u8),
    Merge(f64),
    Protect,
    Stabilize,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..=600).prop_map(|minutes| Op::Tick { minutes }),
        (-500.0f64..=500.0).prop_map(Op::Boost),
        Just(Op::Pause),
        Just(Op::Resume),
        Just(Op::Charge),
        Just(Op::EnterFlow),
        Just(Op::ExitFlow),
        (0u8..4).prop_map(Op::Mode),
        (0.0f64..=2.0).prop_map(Op::Merge),
        Just(Op::Protect),
        Just(Op::Stabilize),
    ]
}

fn arb_config() -> impl Strategy<Value = EnergyConfig> {
    (1.0f64..=500.0, 0.0f64..=5.0, 0.0f64..=5.0).prop_map(|(max, recovery_rate, decay_rate)| {
        EnergyConfig {
            max,
            recovery_rate,
            decay_rate,
            ..EnergyConfig::default()
        }
    })
}

fn in_unit(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

proptest! {
    /// **Core invariant**: no sequence of operations pushes any bounded field
    /// out of its range.
    #[test]
    fn energy_and_flow_stay_in_bounds(
        config in arb_config(),
        ops in prop::collection::vec(arb_op(), 1..60),
    ) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(EnergyStore::new(config, clock.clone()));
        let (id, _) = store.create_state();
        let ctrl = FlowController::new(
            Arc::clone(&store),
            id,
            FlowConfig::default(),
            clock.clone(),
        );

        for op in ops {
            match op {
                Op::Tick { minutes } => {
                    clock.advance_minutes(minutes);
                    store.tick();
                }
                Op::Boost(amount) => { ctrl.boost(amount, "prop"); }
                Op::Pause => { store.pause(id); }
                Op::Resume => { store.resume(id); }
                Op::Charge => { store.set_phase(id, flowstate_core::EnergyPhase::Charging); }
                Op::EnterFlow => { ctrl.enter_flow("prop"); }
                Op::ExitFlow => { ctrl.exit_flow("prop"); }
                Op::Mode(m) => {
                    let kind = match m {
                        0 => FlowKind::Normal,
                        1 => FlowKind::Flow,
                        2 => FlowKind::Recovering,
                        _ => FlowKind::Focus,
                    };
                    ctrl.set_mode(kind, "prop");
                }
                Op::Merge(nudge) => { store.merge_context(id, ["prop"], nudge); }
                Op::Protect => { ctrl.maintain_protection(); }
                Op::Stabilize => { ctrl.stabilize_metrics(); }
            }

            let s = store.get(id).unwrap();
            prop_assert!(s.current >= 0.0 && s.current <= s.max,
                "current out of range: {} (max={})", s.current, s.max);
            prop_assert!(in_unit(s.efficiency), "efficiency out of range: {}", s.efficiency);
            prop_assert!(in_unit(s.resonance), "resonance out of range: {}", s.resonance);

            let r = ctrl.record();
            let m = r.metrics;
            for v in [m.quality, m.stability, m.focus, m.clarity, m.depth, m.energy,
                      r.protection.level, r.protection.strength] {
                prop_assert!(in_unit(v), "flow field out of range: {}", v);
            }
        }
    }

    /// Flow never speeds decay up: with identical elapsed time, the flow
    /// entity loses exactly 1/1.5 of what the normal one loses.
    #[test]
    fn flow_decay_is_base_over_bonus(minutes in 1i64..=120, decay in 0.001f64..=1.0) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = EnergyConfig { decay_rate: decay, max: 1.0e6, ..EnergyConfig::default() };
        let store = Arc::new(EnergyStore::new(config, clock.clone()));
        let (a, _) = store.create_state();
        let (b, _) = store.create_state();
        let flow = FlowController::new(Arc::clone(&store), b, FlowConfig::default(), clock.clone());
        store.resume(a);
        store.resume(b);
        flow.enter_flow("prop");

        clock.advance_minutes(minutes);
        store.tick();
        let lost_a = 1.0e6 - store.get(a).unwrap().current;
        let lost_b = 1.0e6 - store.get(b).unwrap().current;
        prop_assert!((lost_b - lost_a / 1.5).abs() < 1e-6,
            "normal={} flow={}", lost_a, lost_b);
    }
}
