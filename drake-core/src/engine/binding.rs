//! Engine binding: captures the first engine the host creates and sets it up
//! exactly once.
//!
//! ## States
//!
//! ```text
//! Unbound ──acquire(Some(engine))──► Bound ──speaker present──► Ready
//! ```
//!
//! Transitions only move forward. Later `acquire` calls with any handle never
//! rebind or repeat setup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::ShimConfig,
    engine::{params, EngineApi, EngineCallbackKind, EngineCallbacks},
    handle::EngineHandle,
};

/// Lifecycle of the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    Unbound,
    Bound,
    Ready,
}

/// What a single `acquire` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Acquired {
    /// Set when this call bound the engine and ran setup.
    pub bound: Option<EngineHandle>,
    /// Engine callbacks that could not be registered during setup.
    pub callback_failures: usize,
    /// Baseline parameters that could not be written during setup.
    pub param_failures: usize,
    /// True when this call moved the binding to `Ready`.
    pub became_ready: bool,
}

#[derive(Default)]
pub struct EngineBinding {
    engine: OnceLock<EngineHandle>,
    ready: AtomicBool,
    /// Serialises first-time setup so no caller observes a half-configured engine.
    setup: Mutex<()>,
}

impl EngineBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self) -> Option<EngineHandle> {
        self.engine.get().copied()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BindingState {
        match (self.engine(), self.is_ready()) {
            (None, _) => BindingState::Unbound,
            (Some(_), false) => BindingState::Bound,
            (Some(_), true) => BindingState::Ready,
        }
    }

    /// Bind `candidate` if nothing is bound yet, then (unless `early`) probe
    /// for readiness.
    pub fn acquire(
        &self,
        api: &dyn EngineApi,
        sink: &Weak<dyn EngineCallbacks>,
        config: &ShimConfig,
        candidate: Option<EngineHandle>,
        early: bool,
    ) -> Acquired {
        let mut acquired = Acquired::default();

        if let Some(engine) = candidate {
            if self.engine.get().is_none() {
                let _setup = self.setup.lock();
                if self.engine.get().is_none() {
                    info!(engine = %engine, "engine acquired");
                    acquired.callback_failures = register_callbacks(api, engine, sink);
                    acquired.param_failures = params::apply_baseline(api, engine, config);
                    let _ = self.engine.set(engine);
                    acquired.bound = Some(engine);
                }
            }
        }

        if !early {
            acquired.became_ready = self.probe_ready(api);
        }
        acquired
    }

    /// Move to `Ready` if the engine reports a current speaker. Returns true
    /// only for the call that performed the transition.
    pub fn probe_ready(&self, api: &dyn EngineApi) -> bool {
        if self.is_ready() {
            return false;
        }
        let Some(engine) = self.engine() else {
            return false;
        };
        if api.current_speaker(engine).is_none() {
            return false;
        }
        !self.ready.swap(true, Ordering::AcqRel)
    }
}

fn register_callbacks(
    api: &dyn EngineApi,
    engine: EngineHandle,
    sink: &Weak<dyn EngineCallbacks>,
) -> usize {
    let mut failed = 0;
    for kind in EngineCallbackKind::ALL {
        if let Err(code) = api.register_callback(engine, kind, sink.clone()) {
            failed += 1;
            warn!(code, "error adding {} callback", kind.label());
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::{StubEngine, StubOp};
    use crate::engine::PhrasePhase;
    use crate::handle::GrammarKey;

    struct NullSink;

    impl EngineCallbacks for NullSink {
        fn attrib_changed(&self, _attribute: &str) {}
        fn mimic_done(&self, _success: bool) {}
        fn paused(&self, _cookie: u64) {}
        fn phrase_begin(&self) {}
        fn grammar_phrase(&self, _key: GrammarKey, _phase: PhrasePhase, _words: &[String]) {}
    }

    fn sink() -> Weak<dyn EngineCallbacks> {
        Weak::<NullSink>::new()
    }

    fn handle(raw: u64) -> Option<EngineHandle> {
        EngineHandle::from_raw(raw)
    }

    #[test]
    fn first_engine_wins_and_setup_runs_once() {
        let stub = StubEngine::new();
        let binding = EngineBinding::new();
        let config = ShimConfig::default();

        let first = binding.acquire(&stub, &sink(), &config, handle(0x1), true);
        let second = binding.acquire(&stub, &sink(), &config, handle(0x2), true);

        assert_eq!(first.bound, handle(0x1));
        assert_eq!(second.bound, None);
        assert_eq!(binding.engine(), handle(0x1));
        for kind in EngineCallbackKind::ALL {
            assert_eq!(stub.registrations(kind), 1, "{kind:?}");
        }
    }

    #[test]
    fn null_engine_does_not_bind() {
        let stub = StubEngine::new();
        let binding = EngineBinding::new();
        binding.acquire(&stub, &sink(), &ShimConfig::default(), None, false);
        assert_eq!(binding.state(), BindingState::Unbound);
    }

    #[test]
    fn failed_callback_registration_does_not_abort_setup() {
        let stub = StubEngine::new();
        stub.fail(StubOp::RegisterCallback(EngineCallbackKind::MimicDone), 5);
        let binding = EngineBinding::new();

        let acquired = binding.acquire(&stub, &sink(), &ShimConfig::default(), handle(0x1), true);

        assert_eq!(acquired.callback_failures, 1);
        assert_eq!(stub.registrations(EngineCallbackKind::Paused), 1);
        assert_eq!(stub.registrations(EngineCallbackKind::BeginPhrase), 1);
        assert!(!stub.params().is_empty());
        assert_eq!(binding.state(), BindingState::Bound);
    }

    #[test]
    fn early_acquire_never_probes_readiness() {
        let stub = StubEngine::new();
        stub.set_speaker(Some("user"));
        let binding = EngineBinding::new();
        let config = ShimConfig::default();

        let early = binding.acquire(&stub, &sink(), &config, handle(0x1), true);
        assert!(!early.became_ready);
        assert_eq!(binding.state(), BindingState::Bound);

        let late = binding.acquire(&stub, &sink(), &config, handle(0x1), false);
        assert!(late.became_ready);
        assert_eq!(binding.state(), BindingState::Ready);
    }

    #[test]
    fn ready_is_one_way() {
        let stub = StubEngine::new();
        stub.set_speaker(Some("user"));
        let binding = EngineBinding::new();
        let config = ShimConfig::default();
        binding.acquire(&stub, &sink(), &config, handle(0x1), false);

        stub.set_speaker(None);
        let again = binding.acquire(&stub, &sink(), &config, handle(0x1), false);
        assert!(!again.became_ready);
        assert!(binding.is_ready());
    }
}
