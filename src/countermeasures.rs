//! The TKIP Michael-failure countermeasures state machine (802.11-2007 §8.3.2.4).
//!
//! Two Michael MIC failures within a 60-second window are treated as an active forgery
//! attempt: in AP mode every TKIP-using station is deauthenticated and new TKIP
//! associations are refused for the window; in station mode the station reports both
//! failures to the AP, deauthenticates, and rescans. A single isolated failure just arms
//! the window and is otherwise silent — Michael MIC Failure Report frames are never sent
//! outside of an actual countermeasures response, since using them as an oracle to confirm
//! guessed keystream bytes is exactly the attack Beck and Tews describe against WEP/WPA.

use crate::config::CountermeasuresConfig;
use crate::host::ManagementPlane;
use parking_lot::Mutex;
use std::time::Duration;

/// Injectable monotonic clock so the controller can be driven by a fake clock in tests
/// instead of wall time.
pub trait Clock {
    fn now(&self) -> Duration;
}

struct State {
    last_failure: Option<Duration>,
    last_failed_tsc: u64,
    active: bool,
}

/// Per-interface countermeasures state. Cheap to share: the mutable state lives behind a
/// `Mutex` so a single controller can be reached from both the receive path (reporting
/// failures) and admission control (checking whether TKIP associations are refused).
pub struct MichaelFailureController {
    config: CountermeasuresConfig,
    state: Mutex<State>,
}

impl MichaelFailureController {
    pub fn new(config: CountermeasuresConfig) -> Self {
        MichaelFailureController {
            config,
            state: Mutex::new(State { last_failure: None, last_failed_tsc: 0, active: false }),
        }
    }

    /// True while countermeasures are engaged (AP mode: refuse new TKIP associations).
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Called on receipt of a TKIP frame whose Michael MIC failed to verify. `tsc` is the
    /// failing frame's packet number, folded into the EAPOL report in station mode.
    pub fn on_mic_failure<C: Clock, P: ManagementPlane>(&self, clock: &C, host: &P, tsc: u64, is_ap: bool) {
        let now = clock.now();
        let mut state = self.state.lock();

        if state.active {
            // Countermeasures already engaged; nothing further to do.
            return;
        }

        warn!("Michael MIC failure, tsc={}", tsc);

        let first_of_window = match state.last_failure {
            None => true,
            Some(prev) => now.checked_sub(prev).map_or(true, |d| d >= self.config.window),
        };

        if first_of_window {
            state.last_failure = Some(now);
            state.last_failed_tsc = tsc;
            return;
        }

        warn!("second Michael MIC failure within window, engaging countermeasures");

        if is_ap {
            state.active = true;
            host.set_tkip_associations_refused(true);
            for station in host.stations() {
                if station.is_associated() && station.uses_tkip() {
                    host.send_deauth(Some(&station), crate::host::REASON_MIC_FAILURE);
                }
            }
        } else {
            // Report the previous failure's TSC first, then this one, back-to-back.
            host.send_mic_failure_report(state.last_failed_tsc);
            host.send_mic_failure_report(tsc);
            host.send_deauth(None, crate::host::REASON_MIC_FAILURE);
            host.transition_to_scan();
        }

        // Preserved from the original state machine even though the non-countermeasures
        // branch above already records the same fields on first-of-window entry.
        state.last_failure = Some(now);
        state.last_failed_tsc = tsc;
    }

    /// AP mode: clear countermeasures once the window has safely elapsed and the
    /// surrounding stack decides to resume accepting TKIP associations. The standard does
    /// not mandate an automatic timer; callers drive this explicitly.
    pub fn clear(&self, host: &dyn ManagementPlaneClear) {
        let mut state = self.state.lock();
        state.active = false;
        host.set_tkip_associations_refused(false);
    }
}

/// Narrow slice of [`ManagementPlane`] needed by `clear`, so callers that only want to lift
/// countermeasures don't need a concrete `Station` type in scope.
pub trait ManagementPlaneClear {
    fn set_tkip_associations_refused(&self, refused: bool);
}

impl<P: ManagementPlane> ManagementPlaneClear for P {
    fn set_tkip_associations_refused(&self, refused: bool) {
        ManagementPlane::set_tkip_associations_refused(self, refused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    struct FakeClock(Cell<Duration>);
    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            self.0.get()
        }
    }

    #[derive(Clone)]
    struct FakeStation {
        associated: bool,
        tkip: bool,
    }
    impl crate::host::Station for FakeStation {
        fn is_associated(&self) -> bool {
            self.associated
        }
        fn uses_tkip(&self) -> bool {
            self.tkip
        }
    }

    #[derive(Default)]
    struct FakeHost {
        deauths: RefCell<Vec<Option<()>>>,
        reports: RefCell<Vec<u64>>,
        scanned: Cell<bool>,
        refused: Cell<bool>,
        stations: RefCell<Vec<FakeStation>>,
    }
    impl ManagementPlane for FakeHost {
        type Station = FakeStation;
        fn stations(&self) -> Vec<FakeStation> {
            self.stations.borrow().clone()
        }
        fn send_deauth(&self, station: Option<&FakeStation>, _reason: u16) {
            self.deauths.borrow_mut().push(station.map(|_| ()));
        }
        fn send_mic_failure_report(&self, tsc: u64) {
            self.reports.borrow_mut().push(tsc);
        }
        fn transition_to_scan(&self) {
            self.scanned.set(true);
        }
        fn set_tkip_associations_refused(&self, refused: bool) {
            self.refused.set(refused);
        }
    }

    #[test]
    fn single_failure_only_arms_window() {
        let ctl = MichaelFailureController::new(CountermeasuresConfig::default());
        let clock = FakeClock(Cell::new(Duration::from_secs(10)));
        let host = FakeHost::default();
        ctl.on_mic_failure(&clock, &host, 1, true);
        assert!(!ctl.is_active());
        assert!(host.deauths.borrow().is_empty());
    }

    #[test]
    fn two_failures_within_window_trigger_ap_countermeasures() {
        let ctl = MichaelFailureController::new(CountermeasuresConfig::default());
        let clock = FakeClock(Cell::new(Duration::from_secs(10)));
        let host = FakeHost::default();
        host.stations.borrow_mut().push(FakeStation { associated: true, tkip: true });

        ctl.on_mic_failure(&clock, &host, 1, true);
        clock.0.set(Duration::from_secs(40));
        ctl.on_mic_failure(&clock, &host, 2, true);

        assert!(ctl.is_active());
        assert!(host.refused.get());
        assert_eq!(host.deauths.borrow().len(), 1);
    }

    #[test]
    fn two_failures_outside_window_do_not_trigger() {
        let ctl = MichaelFailureController::new(CountermeasuresConfig::default());
        let clock = FakeClock(Cell::new(Duration::from_secs(10)));
        let host = FakeHost::default();

        ctl.on_mic_failure(&clock, &host, 1, true);
        clock.0.set(Duration::from_secs(100));
        ctl.on_mic_failure(&clock, &host, 2, true);

        assert!(!ctl.is_active());
    }

    #[test]
    fn failure_at_exactly_window_width_resets_rather_than_triggers() {
        // Open question resolved per DESIGN.md: the boundary uses `>=`, so a second failure
        // landing exactly 60s after the first re-arms the window instead of engaging
        // countermeasures.
        let ctl = MichaelFailureController::new(CountermeasuresConfig::default());
        let clock = FakeClock(Cell::new(Duration::from_secs(10)));
        let host = FakeHost::default();

        ctl.on_mic_failure(&clock, &host, 1, true);
        clock.0.set(Duration::from_secs(70)); // exactly 60s after the first failure
        ctl.on_mic_failure(&clock, &host, 2, true);

        assert!(!ctl.is_active());
    }

    #[test]
    fn station_mode_reports_both_tsc_values_then_rescans() {
        let ctl = MichaelFailureController::new(CountermeasuresConfig::default());
        let clock = FakeClock(Cell::new(Duration::from_secs(10)));
        let host = FakeHost::default();

        ctl.on_mic_failure(&clock, &host, 7, false);
        clock.0.set(Duration::from_secs(20));
        ctl.on_mic_failure(&clock, &host, 9, false);

        assert_eq!(&*host.reports.borrow(), &[7, 9]);
        assert!(host.scanned.get());
    }
}
