//! Activation gate.
//!
//! A single switch decides whether host-initiated grammar calls reach the
//! engine. Tracking is independent of the switch: every activate is recorded
//! and every deactivate removes its match, so turning the gate on replays
//! exactly what the host currently believes is active.
//!
//! The switch and the tracker share one lock, separate from the registry lock.
//! Forwarding to the engine happens under it; this is what orders a replay
//! against concurrent host traffic for the same grammar.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    engine::EngineApi,
    foreign::{ForeignGrammar, ForeignTracker, ForwardFailure},
    handle::{GrammarHandle, OpaqueArg},
};

/// Outcome of [`ActivationGate::set_enabled`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub enabled: bool,
    pub changed: bool,
    /// Tracked grammars swept onto or off the engine.
    pub forwarded: usize,
    pub failures: Vec<ForwardFailure>,
}

impl fmt::Display for GateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.enabled { "enabled" } else { "disabled" };
        if !self.changed {
            return write!(f, "dragon already {state}");
        }
        write!(f, "dragon {state}, {} grammar(s) forwarded", self.forwarded)?;
        if !self.failures.is_empty() {
            write!(f, ", {} failed:", self.failures.len())?;
            for failure in &self.failures {
                write!(f, " {failure};")?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct GateState {
    enabled: bool,
    tracker: ForeignTracker,
}

/// Gate plus foreign-grammar tracker. Starts disabled.
#[derive(Default)]
pub struct ActivationGate {
    state: Mutex<GateState>,
}

impl ActivationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Flip the gate, sweeping tracked grammars onto or off the engine.
    ///
    /// Enabling flips first and then activates; disabling deactivates while
    /// still enabled and then flips. Engine failures are reported but never
    /// stop the sweep or the flip.
    pub fn set_enabled(&self, api: &dyn EngineApi, target: bool) -> GateReport {
        let mut state = self.state.lock();
        if state.enabled == target {
            return GateReport {
                enabled: target,
                changed: false,
                forwarded: 0,
                failures: Vec::new(),
            };
        }

        let failures = if target {
            state.enabled = true;
            state.tracker.activate_all(api)
        } else {
            let failures = state.tracker.deactivate_all(api);
            state.enabled = false;
            failures
        };

        let report = GateReport {
            enabled: target,
            changed: true,
            forwarded: state.tracker.len(),
            failures,
        };
        drop(state);

        if report.failures.is_empty() {
            info!("{report}");
        } else {
            warn!("{report}");
        }
        report
    }

    /// Host activated `grammar`. Always tracked; forwarded only while enabled.
    pub fn on_activate(
        &self,
        api: &dyn EngineApi,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32 {
        let mut state = self.state.lock();
        state.tracker.record(grammar, arg1, arg2, main_rule);
        if state.enabled {
            api.grammar_activate(grammar, arg1, arg2, main_rule)
        } else {
            debug!(grammar = %grammar, rule = ?main_rule, "activate suppressed");
            0
        }
    }

    /// Host deactivated `grammar`. The first matching record is dropped
    /// before the call is (conditionally) forwarded.
    pub fn on_deactivate(
        &self,
        api: &dyn EngineApi,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32 {
        let mut state = self.state.lock();
        if state.tracker.remove_first_match(grammar, main_rule).is_none() {
            debug!(grammar = %grammar, rule = ?main_rule, "deactivate of untracked grammar");
        }
        if state.enabled {
            api.grammar_deactivate(grammar, arg1, main_rule)
        } else {
            0
        }
    }

    /// Host replaced a list on `grammar`. Forwarded only while enabled.
    pub fn on_set_list(
        &self,
        api: &dyn EngineApi,
        grammar: GrammarHandle,
        name: &str,
        data: &[u8],
    ) -> i32 {
        let state = self.state.lock();
        if state.enabled {
            api.grammar_set_list(grammar, name, data)
        } else {
            debug!(grammar = %grammar, list = name, "set-list suppressed");
            0
        }
    }

    pub fn tracked(&self) -> Vec<ForeignGrammar> {
        self.state.lock().tracker.entries().to_vec()
    }

    pub fn tracked_len(&self) -> usize {
        self.state.lock().tracker.len()
    }
}
