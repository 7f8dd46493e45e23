//! Engine seam.
//!
//! [`EngineApi`] is the set of *original* engine functions: the resolved
//! symbols plus the trampolines returned when a hook was installed. Calling
//! through it always reaches the real engine, never a wrapper. Return codes
//! keep the engine's shape (`0` = success) so wrappers can pass them straight
//! back to the host.
//!
//! [`EngineCallbacks`] is the other direction: the engine invokes it from its
//! own threads once a callback has been registered.

pub mod binding;
pub mod params;
pub mod stub;

use std::sync::Weak;

use serde::{Deserialize, Serialize};

use crate::handle::{CallbackKey, EngineHandle, GrammarHandle, GrammarKey, OpaqueArg, ParamHandle};

/// Engine-wide lifecycle callbacks installed once per binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCallbackKind {
    AttribChanged,
    MimicDone,
    Paused,
    BeginPhrase,
}

impl EngineCallbackKind {
    pub const ALL: [EngineCallbackKind; 4] = [
        EngineCallbackKind::AttribChanged,
        EngineCallbackKind::MimicDone,
        EngineCallbackKind::Paused,
        EngineCallbackKind::BeginPhrase,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EngineCallbackKind::AttribChanged => "attribute",
            EngineCallbackKind::MimicDone => "mimic done",
            EngineCallbackKind::Paused => "paused",
            EngineCallbackKind::BeginPhrase => "phrase begin",
        }
    }
}

/// Per-grammar phrase lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhrasePhase {
    Begin,
    End,
    Hypothesis,
}

/// Receiver for callbacks the engine delivers on its own threads.
///
/// Implementations must be short and must not panic: they run on threads the
/// host process owns.
pub trait EngineCallbacks: Send + Sync + 'static {
    fn attrib_changed(&self, attribute: &str);
    fn mimic_done(&self, success: bool);
    fn paused(&self, cookie: u64);
    fn phrase_begin(&self);
    /// A per-grammar phrase callback; `key` is the user data given at registration.
    fn grammar_phrase(&self, key: GrammarKey, phase: PhrasePhase, words: &[String]);
}

/// Original engine entry points.
pub trait EngineApi: Send + Sync + 'static {
    // ── Lifecycle ────────────────────────────────────────────────────────────
    fn engine_new(&self) -> Option<EngineHandle>;
    fn engine_create(&self, spec: &str, value: u64) -> (i32, Option<EngineHandle>);
    fn mic_state(&self, engine: EngineHandle) -> (i32, i64);
    fn load_grammar(
        &self,
        engine: EngineHandle,
        format: i32,
        data: &[u8],
    ) -> (i32, Option<GrammarHandle>);
    fn current_speaker(&self, engine: EngineHandle) -> Option<String>;

    // ── Grammar control ──────────────────────────────────────────────────────
    fn grammar_activate(
        &self,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<&str>,
    ) -> i32;
    fn grammar_deactivate(&self, grammar: GrammarHandle, arg1: OpaqueArg, main_rule: Option<&str>)
        -> i32;
    fn grammar_set_list(&self, grammar: GrammarHandle, name: &str, data: &[u8]) -> i32;
    fn grammar_set_priority(&self, grammar: GrammarHandle, priority: i32) -> i32;
    fn grammar_set_app_name(&self, grammar: GrammarHandle, appname: &str) -> i32;
    fn grammar_register_phrase_callback(
        &self,
        grammar: GrammarHandle,
        phase: PhrasePhase,
        key: GrammarKey,
        sink: Weak<dyn EngineCallbacks>,
    ) -> Result<CallbackKey, i32>;
    fn grammar_unregister(&self, grammar: GrammarHandle, key: CallbackKey) -> i32;
    fn grammar_destroy(&self, grammar: GrammarHandle) -> i32;

    // ── Parameters ───────────────────────────────────────────────────────────
    fn get_param(&self, engine: EngineHandle, key: &str) -> Option<ParamHandle>;
    fn set_string_value(&self, engine: EngineHandle, param: ParamHandle, value: &str) -> i32;
    fn destroy_param(&self, engine: EngineHandle, param: ParamHandle);

    // ── Engine callbacks and control ─────────────────────────────────────────
    fn register_callback(
        &self,
        engine: EngineHandle,
        kind: EngineCallbackKind,
        sink: Weak<dyn EngineCallbacks>,
    ) -> Result<CallbackKey, i32>;
    fn mimic(&self, engine: EngineHandle, words: &[String]) -> i32;
    fn resume(&self, engine: EngineHandle, cookie: u64) -> i32;
}
