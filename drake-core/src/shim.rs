//! Process-wide shim state and the wrappers installed over engine entry points.
//!
//! ## Ownership
//!
//! One `Shim` lives for the rest of the process once installation succeeds
//! ([`Shim::install`] / [`Shim::shared`]). Tests and embedders can build
//! private instances with [`Shim::new`]; nothing in this crate reaches for the
//! global except those two functions.
//!
//! ## Threading
//!
//! Wrappers run on host threads, callbacks on engine threads, control calls on
//! whatever thread serves the control API. Every component carries its own
//! lock:
//!
//! | Component | Lock |
//! |-----------|------|
//! | `GrammarRegistry` | registry mutex (never held across engine calls) |
//! | `ActivationGate` | gate mutex (held while forwarding host calls) |
//! | `MimicSignal` | request mutex + condvar |
//! | `EngineBinding` | `OnceLock` + setup mutex |

use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    config::ShimConfig,
    engine::{binding::EngineBinding, params, EngineApi, EngineCallbacks, PhrasePhase},
    error::{DrakeError, Result},
    events::{ShimEvent, StatusCmd},
    gate::{ActivationGate, GateReport},
    handle::{EngineHandle, GrammarHandle, GrammarKey, OpaqueArg},
    install::{install_hooks, Hook, ModuleLoader, SymbolTable, TARGET_MODULE},
    mimic::MimicSignal,
    registry::GrammarRegistry,
};

/// Broadcast channel capacity for shim events.
const EVENT_CAP: usize = 256;

static SHARED: OnceLock<Arc<Shim>> = OnceLock::new();
static INSTALLING: Mutex<()> = parking_lot::const_mutex(());

pub struct Shim {
    api: Arc<dyn EngineApi>,
    config: ShimConfig,
    registry: GrammarRegistry,
    gate: ActivationGate,
    binding: EngineBinding,
    mimic: MimicSignal,
    /// Last attribute reported by the engine (mic state changes).
    mic_attribute: Mutex<Option<String>>,
    started_at: DateTime<Utc>,
    events: broadcast::Sender<ShimEvent>,
    this: Weak<Shim>,
}

impl Shim {
    /// Build a private shim over `api`.
    pub fn new(api: Arc<dyn EngineApi>, config: ShimConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAP);
        let policy = config.key_policy;
        Arc::new_cyclic(|this| Self {
            api,
            config,
            registry: GrammarRegistry::new(policy),
            gate: ActivationGate::new(),
            binding: EngineBinding::new(),
            mimic: MimicSignal::new(),
            mic_attribute: Mutex::new(None),
            started_at: Utc::now(),
            events,
            this: this.clone(),
        })
    }

    /// The process-wide shim, once installed.
    pub fn shared() -> Option<&'static Arc<Shim>> {
        SHARED.get()
    }

    /// One-shot process installation.
    ///
    /// Resolves and hooks the engine module through `loader`, builds the engine
    /// API from the resulting symbol table with `bind`, and publishes the
    /// shared state. Any failure leaves the engine unhooked and nothing
    /// installed. Calling again after success returns the existing shim.
    pub fn install(
        loader: &dyn ModuleLoader,
        hooks: &[Hook],
        config: ShimConfig,
        bind: impl FnOnce(&SymbolTable) -> Arc<dyn EngineApi>,
    ) -> Result<&'static Arc<Shim>> {
        let _installing = INSTALLING.lock();
        if let Some(shim) = SHARED.get() {
            return Ok(shim);
        }

        info!("drake starting");
        let table = install_hooks(loader, TARGET_MODULE, hooks).map_err(|e| {
            warn!("drake failed to hook: {e}");
            e
        })?;
        let shim = Shim::new(bind(&table), config);
        Ok(SHARED.get_or_init(|| shim))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn api(&self) -> &dyn EngineApi {
        self.api.as_ref()
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn registry(&self) -> &GrammarRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &ActivationGate {
        &self.gate
    }

    pub fn binding(&self) -> &EngineBinding {
        &self.binding
    }

    pub fn engine(&self) -> Option<EngineHandle> {
        self.binding.engine()
    }

    pub fn is_ready(&self) -> bool {
        self.binding.is_ready()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn mic_attribute(&self) -> Option<String> {
        self.mic_attribute.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShimEvent> {
        self.events.subscribe()
    }

    /// Sink handed to the engine when registering callbacks.
    pub fn callbacks(&self) -> Weak<dyn EngineCallbacks> {
        self.this.clone()
    }

    // ── Hooked entry points ──────────────────────────────────────────────────

    /// `DSXEngine_New`: create, capture, and hand back the bound engine.
    pub fn hook_engine_new(&self) -> Option<EngineHandle> {
        let engine = self.api.engine_new();
        debug!(engine = ?engine, "DSXEngine_New");
        self.acquire(engine, true);
        self.engine()
    }

    /// `DSXEngine_Create`.
    pub fn hook_engine_create(&self, spec: &str, value: u64) -> (i32, Option<EngineHandle>) {
        let (code, engine) = self.api.engine_create(spec, value);
        debug!(spec, value, engine = ?engine, code, "DSXEngine_Create");
        self.acquire(engine, true);
        (code, engine)
    }

    /// `DSXEngine_GetMicState`.
    pub fn hook_get_mic_state(&self, engine: EngineHandle) -> (i32, i64) {
        self.acquire(Some(engine), false);
        self.api.mic_state(engine)
    }

    /// `DSXEngine_LoadGrammar`.
    pub fn hook_load_grammar(
        &self,
        engine: EngineHandle,
        format: i32,
        data: &[u8],
    ) -> (i32, Option<GrammarHandle>) {
        self.acquire(Some(engine), false);
        self.api.load_grammar(engine, format, data)
    }

    /// `DSXGrammar_Activate`.
    pub fn hook_grammar_activate(
        &self,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32 {
        self.gate
            .on_activate(self.api.as_ref(), grammar, arg1, arg2, main_rule)
    }

    /// `DSXGrammar_Deactivate`.
    pub fn hook_grammar_deactivate(
        &self,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32 {
        self.gate
            .on_deactivate(self.api.as_ref(), grammar, arg1, main_rule)
    }

    /// `DSXGrammar_SetList`.
    pub fn hook_grammar_set_list(&self, grammar: GrammarHandle, name: &str, data: &[u8]) -> i32 {
        self.gate.on_set_list(self.api.as_ref(), grammar, name, data)
    }

    // ── Operations used by the control API ───────────────────────────────────

    pub fn set_dragon_enabled(&self, enabled: bool) -> GateReport {
        self.gate.set_enabled(self.api.as_ref(), enabled)
    }

    /// Write one engine parameter on the bound engine.
    pub fn set_param(&self, key: &str, value: &str) -> Result<()> {
        params::set_param(self.api.as_ref(), self.engine(), key, value)
    }

    /// Feed `words` to the engine as if spoken and wait for the result.
    pub fn mimic(&self, words: &[String]) -> Result<()> {
        let engine = self.engine().ok_or(DrakeError::NoEngine)?;
        self.mimic
            .run(self.config.mimic_timeout, || self.api.mimic(engine, words))
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn acquire(&self, candidate: Option<EngineHandle>, early: bool) {
        let acquired = self.binding.acquire(
            self.api.as_ref(),
            &self.callbacks(),
            &self.config,
            candidate,
            early,
        );
        if acquired.bound.is_some() {
            info!("status: start");
            self.publish(ShimEvent::Status {
                cmd: StatusCmd::Start,
            });
        }
        if acquired.became_ready {
            self.announce_ready();
        }
    }

    fn announce_ready(&self) {
        info!("status: ready");
        self.publish(ShimEvent::Status {
            cmd: StatusCmd::Ready,
        });
    }

    fn publish(&self, event: ShimEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl EngineCallbacks for Shim {
    fn attrib_changed(&self, attribute: &str) {
        *self.mic_attribute.lock() = Some(attribute.to_string());
        self.publish(ShimEvent::Attribute {
            name: attribute.to_string(),
        });
        if self.binding.probe_ready(self.api.as_ref()) {
            self.announce_ready();
        }
    }

    fn mimic_done(&self, success: bool) {
        self.mimic.complete(success);
        self.publish(ShimEvent::Mimic { success });
    }

    fn paused(&self, cookie: u64) {
        self.publish(ShimEvent::Paused { cookie });
        if !self.config.resume_on_pause {
            return;
        }
        if let Some(engine) = self.engine() {
            let code = self.api.resume(engine, cookie);
            if code != 0 {
                warn!(code, cookie, "failed to resume after pause");
            }
        }
    }

    fn phrase_begin(&self) {
        self.publish(ShimEvent::PhraseBegin);
    }

    fn grammar_phrase(&self, key: GrammarKey, phase: PhrasePhase, words: &[String]) {
        match self.registry.gkey_to_name(key) {
            Some(grammar) => self.publish(ShimEvent::Phrase {
                grammar,
                phase,
                words: words.to_vec(),
            }),
            None => debug!(key = %key, ?phase, "phrase callback for unknown grammar key"),
        }
    }
}
