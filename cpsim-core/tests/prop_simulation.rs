//! Property tests for the charging model and the frame log
//!
//! - SoC stays within [0, 100] and power within the jitter band
//! - Delivered energy never decreases and the meter register never goes backwards
//! - The frame log holds at most `capacity` entries, newest first

use std::time::Duration;

use cpsim_core::frame_log::{Direction, FrameLog, LogEntry, LogFilter};
use cpsim_core::ocpp::{Frame, FrameKind};
use cpsim_core::simulator::{ChargeCurve, TransactionState};
use cpsim_core::SimulationConfig;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

// ============================================================================
// Strategies
// ============================================================================

fn simulation() -> impl Strategy<Value = SimulationConfig> {
    (0.0f64..50.0, 0.0f64..64.0, -0.5f64..0.5, 0.0f64..30.0, 0.0f64..100.0).prop_map(
        |(power, current, jitter, step, soc)| SimulationConfig {
            target_power_kw: power,
            nominal_current_a: current,
            jitter_fraction: jitter,
            soc_step_percent: step,
            initial_soc_percent: soc,
            ..Default::default()
        },
    )
}

fn entry(index: usize) -> LogEntry {
    let frame = if index % 2 == 0 {
        Frame::Call {
            id: format!("c{}", index),
            action: "Heartbeat".into(),
            payload: json!({}),
        }
    } else {
        Frame::result(format!("r{}", index), json!({}))
    };
    let direction = if index % 3 == 0 { Direction::In } else { Direction::Out };
    LogEntry::new(direction, frame)
}

// ============================================================================
// Charging Model Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: SoC is always within [0, 100]
    #[test]
    fn soc_stays_in_bounds(config in simulation(), seed in any::<u64>(), ticks in 1usize..400) {
        let curve = ChargeCurve::from_config(&config);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = TransactionState::idle(config.initial_soc_percent);

        for _ in 0..ticks {
            let before = state.soc_percent;
            curve.physical_tick(&mut state, &mut rng);
            prop_assert!((0.0..=100.0).contains(&state.soc_percent));
            prop_assert!(state.soc_percent >= before);
        }
    }

    /// Power and current stay within the clamped jitter band
    #[test]
    fn power_within_jitter_band(config in simulation(), seed in any::<u64>()) {
        let curve = ChargeCurve::from_config(&config);
        let jitter = config.effective_jitter();
        prop_assert!((0.0..=0.10).contains(&jitter));

        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = TransactionState::idle(50.0);
        for _ in 0..50 {
            curve.physical_tick(&mut state, &mut rng);

            let power = config.target_power_kw;
            prop_assert!(state.power_kw >= power * (1.0 - jitter) - 1e-9);
            prop_assert!(state.power_kw <= power * (1.0 + jitter) + 1e-9);

            let current = config.nominal_current_a;
            prop_assert!(state.current_a >= current * (1.0 - jitter) - 0.05 - 1e-9);
            prop_assert!(state.current_a <= current * (1.0 + jitter) + 0.05 + 1e-9);
        }
    }

    /// Energy and the reported meter register are monotonic
    #[test]
    fn energy_is_monotonic(
        config in simulation(),
        seed in any::<u64>(),
        meter_start in 0u64..1_000_000,
        steps in prop::collection::vec(0u64..60_000, 1..50),
    ) {
        let curve = ChargeCurve::from_config(&config);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = TransactionState::idle(config.initial_soc_percent);
        state.meter_start_wh = meter_start;

        let mut last_energy = state.energy_wh;
        let mut last_register = state.meter_register_wh();
        for millis in steps {
            curve.physical_tick(&mut state, &mut rng);
            curve.accumulate(&mut state, Duration::from_millis(millis));

            prop_assert!(state.energy_wh >= last_energy);
            prop_assert!(state.meter_register_wh() >= last_register);
            prop_assert!(state.meter_register_wh() >= meter_start);
            last_energy = state.energy_wh;
            last_register = state.meter_register_wh();
        }
    }
}

// ============================================================================
// Frame Log Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: never more than `capacity` entries, newest first
    #[test]
    fn frame_log_is_bounded(capacity in 1usize..64, appended in 0usize..200) {
        let mut log = FrameLog::new(capacity);
        for index in 0..appended {
            prop_assert!(log.append(entry(index)));
        }

        prop_assert_eq!(log.len(), appended.min(capacity));
        let ids: Vec<String> = log.snapshot().iter().map(|e| e.frame.id().to_string()).collect();
        let expected: Vec<String> = (0..appended)
            .rev()
            .take(capacity)
            .map(|index| entry(index).frame.id().to_string())
            .collect();
        prop_assert_eq!(ids, expected);
    }

    /// Paused logs drop appends without changing contents
    #[test]
    fn paused_log_ignores_appends(before in 0usize..20, during in 1usize..20) {
        let mut log = FrameLog::new(50);
        for index in 0..before {
            log.append(entry(index));
        }
        log.set_paused(true);
        for index in 0..during {
            prop_assert!(!log.append(entry(index)));
        }
        prop_assert_eq!(log.len(), before);
    }

    /// A filter result is a subset of the snapshot and every entry matches
    #[test]
    fn filter_is_a_subset(appended in 0usize..60, want_in in any::<bool>(), want_calls in any::<bool>()) {
        let mut log = FrameLog::new(100);
        for index in 0..appended {
            log.append(entry(index));
        }
        let filter = LogFilter {
            direction: Some(if want_in { Direction::In } else { Direction::Out }),
            kind: Some(if want_calls { FrameKind::Call } else { FrameKind::CallResult }),
            ..Default::default()
        };

        let filtered = log.filtered(&filter);
        prop_assert!(filtered.len() <= log.len());
        prop_assert!(filtered.iter().all(|e| filter.matches(e)));
    }
}
