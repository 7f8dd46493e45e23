//! `StubEngine`: in-process stand-in for the proprietary engine.
//!
//! Records every call that reaches it so callers can assert exactly what was
//! forwarded. Failures can be injected per operation. Callbacks are delivered
//! either inline on the calling thread or from a dispatcher thread, the way a
//! real engine delivers them from threads it owns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Weak;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::engine::{EngineApi, EngineCallbackKind, EngineCallbacks, PhrasePhase};
use crate::handle::{CallbackKey, EngineHandle, GrammarHandle, GrammarKey, OpaqueArg, ParamHandle};
use crate::install::{ModuleLoader, SymbolAddr};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubOp {
    LoadGrammar,
    Activate,
    Deactivate,
    SetList,
    SetPriority,
    SetAppName,
    RegisterPhraseCallback,
    Unregister,
    Destroy,
    SetStringValue,
    RegisterCallback(EngineCallbackKind),
    Mimic,
    Resume,
}

/// A call that reached the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StubCall {
    LoadGrammar { grammar: GrammarHandle },
    Activate {
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<String>,
    },
    Deactivate {
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        main_rule: Option<String>,
    },
    SetList { grammar: GrammarHandle, name: String, len: usize },
    SetPriority { grammar: GrammarHandle, priority: i32 },
    SetAppName { grammar: GrammarHandle, appname: String },
    Unregister { grammar: GrammarHandle, key: CallbackKey },
    Destroy { grammar: GrammarHandle },
    Mimic { words: Vec<String> },
    Resume { cookie: u64 },
}

/// How a mimic request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimicMode {
    /// `mimic_done` fires before `mimic` returns, on the caller's thread.
    Inline { success: bool },
    /// `mimic_done` fires later on the dispatcher thread.
    Deferred { success: bool },
    /// The completion is never delivered.
    Dropped,
}

struct PhraseRegistration {
    callback: CallbackKey,
    grammar: GrammarHandle,
    phase: PhrasePhase,
    key: GrammarKey,
    sink: Weak<dyn EngineCallbacks>,
}

struct StubState {
    calls: Vec<StubCall>,
    params: Vec<(String, String)>,
    live_params: HashMap<ParamHandle, String>,
    destroyed_params: usize,
    registrations: HashMap<EngineCallbackKind, usize>,
    failures: HashMap<StubOp, i32>,
    rejected_params: HashSet<String>,
    speaker: Option<String>,
    sink: Option<Weak<dyn EngineCallbacks>>,
    phrase_sinks: Vec<PhraseRegistration>,
    mimic: MimicMode,
}

type Delivery = Box<dyn FnOnce() + Send>;

/// Recording engine used by tests and the host harness.
pub struct StubEngine {
    state: Mutex<StubState>,
    next_handle: AtomicU64,
    next_callback: AtomicU32,
    dispatch: Sender<Delivery>,
    /// Runs once, at the start of the next phrase callback registration.
    interject: Mutex<Option<Delivery>>,
}

impl StubEngine {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<Delivery>();
        thread::Builder::new()
            .name("stub-engine-callbacks".into())
            .spawn(move || {
                for delivery in rx {
                    delivery();
                }
            })
            .map_err(|e| debug!("stub dispatcher not started: {e}"))
            .ok();

        Self {
            state: Mutex::new(StubState {
                calls: Vec::new(),
                params: Vec::new(),
                live_params: HashMap::new(),
                destroyed_params: 0,
                registrations: HashMap::new(),
                failures: HashMap::new(),
                rejected_params: HashSet::new(),
                speaker: None,
                sink: None,
                phrase_sinks: Vec::new(),
                mimic: MimicMode::Inline { success: true },
            }),
            next_handle: AtomicU64::new(0x1000),
            next_callback: AtomicU32::new(1),
            dispatch: tx,
            interject: Mutex::new(None),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────────

    pub fn fail(&self, op: StubOp, code: i32) {
        self.state.lock().failures.insert(op, code);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn reject_param(&self, key: &str) {
        self.state.lock().rejected_params.insert(key.to_string());
    }

    pub fn set_speaker(&self, speaker: Option<&str>) {
        self.state.lock().speaker = speaker.map(str::to_string);
    }

    pub fn set_mimic_mode(&self, mode: MimicMode) {
        self.state.lock().mimic = mode;
    }

    /// Run `f` on the calling thread when the next phrase callback
    /// registration arrives, before it is recorded.
    pub fn before_next_phrase_registration(&self, f: impl FnOnce() + Send + 'static) {
        *self.interject.lock() = Some(Box::new(f));
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<StubCall> {
        self.state.lock().calls.clone()
    }

    pub fn activations(&self) -> Vec<StubCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, StubCall::Activate { .. }))
            .collect()
    }

    pub fn deactivations(&self) -> Vec<StubCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, StubCall::Deactivate { .. }))
            .collect()
    }

    pub fn params(&self) -> Vec<(String, String)> {
        self.state.lock().params.clone()
    }

    pub fn destroyed_params(&self) -> usize {
        self.state.lock().destroyed_params
    }

    pub fn registrations(&self, kind: EngineCallbackKind) -> usize {
        self.state.lock().registrations.get(&kind).copied().unwrap_or(0)
    }

    pub fn phrase_registrations(&self) -> usize {
        self.state.lock().phrase_sinks.len()
    }

    // ── Simulated engine-thread events ───────────────────────────────────────

    pub fn fire_attrib_changed(&self, attribute: &str) {
        if let Some(sink) = self.engine_sink() {
            sink.attrib_changed(attribute);
        }
    }

    pub fn fire_paused(&self, cookie: u64) {
        if let Some(sink) = self.engine_sink() {
            sink.paused(cookie);
        }
    }

    pub fn fire_phrase_begin(&self) {
        if let Some(sink) = self.engine_sink() {
            sink.phrase_begin();
        }
    }

    /// Deliver a phrase callback to every registration for `grammar`/`phase`.
    pub fn fire_grammar_phrase(&self, grammar: GrammarHandle, phase: PhrasePhase, words: &[String]) {
        let targets: Vec<(GrammarKey, Weak<dyn EngineCallbacks>)> = self
            .state
            .lock()
            .phrase_sinks
            .iter()
            .filter(|r| r.grammar == grammar && r.phase == phase)
            .map(|r| (r.key, r.sink.clone()))
            .collect();
        for (key, sink) in targets {
            if let Some(sink) = sink.upgrade() {
                sink.grammar_phrase(key, phase, words);
            }
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn engine_sink(&self) -> Option<std::sync::Arc<dyn EngineCallbacks>> {
        self.state.lock().sink.as_ref().and_then(Weak::upgrade)
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(0x10, Ordering::Relaxed)
    }

    fn next_callback(&self) -> CallbackKey {
        CallbackKey(self.next_callback.fetch_add(1, Ordering::Relaxed))
    }

    /// Record `call` unless `op` is set to fail; returns the engine code.
    fn record(&self, op: StubOp, call: StubCall) -> i32 {
        let mut state = self.state.lock();
        if let Some(code) = state.failures.get(&op) {
            return *code;
        }
        state.calls.push(call);
        0
    }

    fn failure(&self, op: StubOp) -> Option<i32> {
        self.state.lock().failures.get(&op).copied()
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineApi for StubEngine {
    fn engine_new(&self) -> Option<EngineHandle> {
        EngineHandle::from_raw(self.next())
    }

    fn engine_create(&self, _spec: &str, _value: u64) -> (i32, Option<EngineHandle>) {
        (0, EngineHandle::from_raw(self.next()))
    }

    fn mic_state(&self, _engine: EngineHandle) -> (i32, i64) {
        (0, 1)
    }

    fn load_grammar(
        &self,
        _engine: EngineHandle,
        _format: i32,
        _data: &[u8],
    ) -> (i32, Option<GrammarHandle>) {
        if let Some(code) = self.failure(StubOp::LoadGrammar) {
            return (code, None);
        }
        let grammar = GrammarHandle::from_raw(self.next());
        if let Some(grammar) = grammar {
            self.state.lock().calls.push(StubCall::LoadGrammar { grammar });
        }
        (0, grammar)
    }

    fn current_speaker(&self, _engine: EngineHandle) -> Option<String> {
        self.state.lock().speaker.clone()
    }

    fn grammar_activate(
        &self,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32 {
        self.record(
            StubOp::Activate,
            StubCall::Activate {
                grammar,
                arg1,
                arg2,
                main_rule: main_rule.map(str::to_string),
            },
        )
    }

    fn grammar_deactivate(
        &self,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32 {
        self.record(
            StubOp::Deactivate,
            StubCall::Deactivate {
                grammar,
                arg1,
                main_rule: main_rule.map(str::to_string),
            },
        )
    }

    fn grammar_set_list(&self, grammar: GrammarHandle, name: &str, data: &[u8]) -> i32 {
        self.record(
            StubOp::SetList,
            StubCall::SetList {
                grammar,
                name: name.to_string(),
                len: data.len(),
            },
        )
    }

    fn grammar_set_priority(&self, grammar: GrammarHandle, priority: i32) -> i32 {
        self.record(StubOp::SetPriority, StubCall::SetPriority { grammar, priority })
    }

    fn grammar_set_app_name(&self, grammar: GrammarHandle, appname: &str) -> i32 {
        self.record(
            StubOp::SetAppName,
            StubCall::SetAppName {
                grammar,
                appname: appname.to_string(),
            },
        )
    }

    fn grammar_register_phrase_callback(
        &self,
        grammar: GrammarHandle,
        phase: PhrasePhase,
        key: GrammarKey,
        sink: Weak<dyn EngineCallbacks>,
    ) -> Result<CallbackKey, i32> {
        let interject = self.interject.lock().take();
        if let Some(f) = interject {
            f();
        }
        if let Some(code) = self.failure(StubOp::RegisterPhraseCallback) {
            return Err(code);
        }
        let callback = self.next_callback();
        self.state.lock().phrase_sinks.push(PhraseRegistration {
            callback,
            grammar,
            phase,
            key,
            sink,
        });
        Ok(callback)
    }

    fn grammar_unregister(&self, grammar: GrammarHandle, key: CallbackKey) -> i32 {
        let code = self.record(StubOp::Unregister, StubCall::Unregister { grammar, key });
        if code == 0 {
            self.state.lock().phrase_sinks.retain(|r| r.callback != key);
        }
        code
    }

    fn grammar_destroy(&self, grammar: GrammarHandle) -> i32 {
        self.record(StubOp::Destroy, StubCall::Destroy { grammar })
    }

    fn get_param(&self, _engine: EngineHandle, key: &str) -> Option<ParamHandle> {
        if self.state.lock().rejected_params.contains(key) {
            return None;
        }
        let param = ParamHandle::from_raw(self.next())?;
        self.state.lock().live_params.insert(param, key.to_string());
        Some(param)
    }

    fn set_string_value(&self, _engine: EngineHandle, param: ParamHandle, value: &str) -> i32 {
        let mut state = self.state.lock();
        if let Some(code) = state.failures.get(&StubOp::SetStringValue) {
            return *code;
        }
        match state.live_params.get(&param).cloned() {
            Some(key) => {
                state.params.push((key, value.to_string()));
                0
            }
            None => -1,
        }
    }

    fn destroy_param(&self, _engine: EngineHandle, param: ParamHandle) {
        let mut state = self.state.lock();
        if state.live_params.remove(&param).is_some() {
            state.destroyed_params += 1;
        }
    }

    fn register_callback(
        &self,
        _engine: EngineHandle,
        kind: EngineCallbackKind,
        sink: Weak<dyn EngineCallbacks>,
    ) -> Result<CallbackKey, i32> {
        let mut state = self.state.lock();
        if let Some(code) = state.failures.get(&StubOp::RegisterCallback(kind)) {
            return Err(*code);
        }
        *state.registrations.entry(kind).or_insert(0) += 1;
        state.sink = Some(sink);
        Ok(self.next_callback())
    }

    fn mimic(&self, _engine: EngineHandle, words: &[String]) -> i32 {
        let code = self.record(
            StubOp::Mimic,
            StubCall::Mimic {
                words: words.to_vec(),
            },
        );
        if code != 0 {
            return code;
        }
        let mode = self.state.lock().mimic;
        match mode {
            MimicMode::Inline { success } => {
                if let Some(sink) = self.engine_sink() {
                    sink.mimic_done(success);
                }
            }
            MimicMode::Deferred { success } => {
                if let Some(sink) = self.engine_sink() {
                    let _ = self.dispatch.send(Box::new(move || sink.mimic_done(success)));
                }
            }
            MimicMode::Dropped => {}
        }
        0
    }

    fn resume(&self, _engine: EngineHandle, cookie: u64) -> i32 {
        self.record(StubOp::Resume, StubCall::Resume { cookie })
    }
}

/// In-memory module loader.
///
/// Every symbol resolves to a synthetic address unless marked missing.
/// Installing a hook swaps the table entry and returns the previous address.
pub struct StubLoader {
    table: Mutex<HashMap<String, SymbolAddr>>,
    missing: HashSet<String>,
    refuse: HashSet<String>,
    next: AtomicU64,
}

impl StubLoader {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            missing: HashSet::new(),
            refuse: HashSet::new(),
            next: AtomicU64::new(0x7000_0000),
        }
    }

    /// Make `symbol` unresolvable.
    pub fn without(mut self, symbol: &str) -> Self {
        self.missing.insert(symbol.to_string());
        self
    }

    /// Make installing a hook on `symbol` fail.
    pub fn refusing(mut self, symbol: &str) -> Self {
        self.refuse.insert(symbol.to_string());
        self
    }

    /// Current call target for `symbol`, if it has been resolved.
    pub fn target(&self, symbol: &str) -> Option<SymbolAddr> {
        self.table.lock().get(symbol).copied()
    }

    fn entry(&self, symbol: &str) -> SymbolAddr {
        *self
            .table
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolAddr(self.next.fetch_add(0x40, Ordering::Relaxed)))
    }
}

impl Default for StubLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for StubLoader {
    fn resolve(&self, _module: &str, symbol: &str) -> Option<SymbolAddr> {
        if self.missing.contains(symbol) {
            return None;
        }
        Some(self.entry(symbol))
    }

    fn install(
        &self,
        _module: &str,
        symbol: &str,
        replacement: SymbolAddr,
    ) -> std::result::Result<SymbolAddr, String> {
        if self.refuse.contains(symbol) {
            return Err("page is not writable".into());
        }
        let original = self.entry(symbol);
        self.table.lock().insert(symbol.to_string(), replacement);
        Ok(original)
    }
}
