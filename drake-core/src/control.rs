//! Control API.
//!
//! The surface an external controller drives: the dragon gate, local grammar
//! registration and state, and mimic. Serving it over a transport is left to
//! the embedder; every method here is synchronous and thread-safe.
//!
//! Local grammars talk to the engine directly through the original entry
//! points, so they are never subject to the gate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    engine::{binding::BindingState, PhrasePhase},
    error::{check, DrakeError, Result},
    events::ShimEvent,
    foreign::ForeignGrammar,
    handle::{GrammarHandle, GrammarKey, OpaqueArg},
    registry::Grammar,
    shim::Shim,
};

/// Request to load a local grammar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrammarSpec {
    pub name: String,
    pub main_rule: Option<String>,
    /// Engine grammar format code.
    pub format: i32,
    /// Compiled grammar bytes, passed to the engine untouched.
    pub data: Vec<u8>,
    pub priority: i32,
    pub exclusive: bool,
    pub appname: Option<String>,
}

/// Snapshot returned by [`ControlApi::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub installed: bool,
    pub binding: BindingState,
    pub dragon_enabled: bool,
    pub foreign_grammars: usize,
    pub grammars: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub mic_attribute: Option<String>,
}

#[derive(Clone)]
enum Target {
    /// The process-wide shim, looked up on every call.
    Shared,
    Private(Arc<Shim>),
}

#[derive(Clone)]
pub struct ControlApi {
    target: Target,
}

impl ControlApi {
    /// Control over the process-wide shim; reports not-installed until
    /// installation has succeeded.
    pub fn shared() -> Self {
        Self {
            target: Target::Shared,
        }
    }

    pub fn new(shim: Arc<Shim>) -> Self {
        Self {
            target: Target::Private(shim),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.shim().is_ok()
    }

    pub fn status(&self) -> ControlStatus {
        match self.shim().ok() {
            None => ControlStatus {
                installed: false,
                binding: BindingState::Unbound,
                dragon_enabled: false,
                foreign_grammars: 0,
                grammars: Vec::new(),
                started_at: None,
                mic_attribute: None,
            },
            Some(shim) => ControlStatus {
                installed: true,
                binding: shim.binding().state(),
                dragon_enabled: shim.gate().is_enabled(),
                foreign_grammars: shim.gate().tracked_len(),
                grammars: shim.registry().names(),
                started_at: Some(shim.started_at()),
                mic_attribute: shim.mic_attribute(),
            },
        }
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<ShimEvent>> {
        Ok(self.shim()?.subscribe())
    }

    /// Turn forwarding of host grammar calls on or off. Returns the gate's
    /// human-readable summary, including any replay failures.
    pub fn set_dragon_enabled(&self, enabled: bool) -> Result<String> {
        Ok(self.shim()?.set_dragon_enabled(enabled).to_string())
    }

    pub fn foreign_grammars(&self) -> Result<Vec<ForeignGrammar>> {
        Ok(self.shim()?.gate().tracked())
    }

    /// Load a grammar into the bound engine and register it locally.
    ///
    /// Phrase callback, appname and priority failures are logged but do not
    /// fail the load.
    pub fn load_grammar(&self, spec: GrammarSpec) -> Result<GrammarKey> {
        let shim = self.shim()?;
        if shim.registry().get(&spec.name).is_some() {
            return Err(DrakeError::GrammarExists(spec.name));
        }
        let engine = shim.engine().ok_or(DrakeError::NoEngine)?;
        let api = shim.api();

        let (code, handle) = api.load_grammar(engine, spec.format, &spec.data);
        check("load-grammar", code)?;
        let handle = handle.ok_or(DrakeError::Engine {
            op: "load-grammar",
            code,
        })?;

        let mut grammar = Grammar::new(spec.name.clone(), spec.main_rule.as_deref());
        grammar.handle = Some(handle);
        grammar.priority = spec.priority;
        grammar.exclusive = spec.exclusive;
        grammar.appname = spec.appname.clone();
        let (key, displaced) = shim.registry().set(grammar);
        if let Some(displaced) = displaced {
            warn!(grammar = %spec.name, "grammar replaced by concurrent load");
            if let Err(e) = shim.registry().retire(&displaced, api) {
                warn!("{e}");
            }
        }

        let mut callbacks = [None; 3];
        for (slot, phase) in [PhrasePhase::Begin, PhrasePhase::End, PhrasePhase::Hypothesis]
            .into_iter()
            .enumerate()
        {
            match api.grammar_register_phrase_callback(handle, phase, key, shim.callbacks()) {
                Ok(callback) => callbacks[slot] = Some(callback),
                Err(code) => warn!(grammar = %spec.name, ?phase, code, "phrase callback not registered"),
            }
        }
        let stored = shim.registry().update_key(key, |g| {
            g.beginkey = callbacks[0];
            g.endkey = callbacks[1];
            g.hypokey = callbacks[2];
        });
        if stored.is_none() {
            // Unloaded while the callbacks were being registered.
            for callback in callbacks.into_iter().flatten() {
                let code = api.grammar_unregister(handle, callback);
                if code != 0 {
                    warn!(grammar = %spec.name, code, "stray phrase callback not unregistered");
                }
            }
            return Err(DrakeError::GrammarNotFound(spec.name));
        }

        if let Some(appname) = &spec.appname {
            if let Err(e) = check("set-app-name", api.grammar_set_app_name(handle, appname)) {
                warn!(grammar = %spec.name, "{e}");
            }
        }
        if let Err(e) = check("set-priority", api.grammar_set_priority(handle, spec.priority)) {
            warn!(grammar = %spec.name, "{e}");
        }

        info!(grammar = %spec.name, key = %key, "grammar loaded");
        Ok(key)
    }

    /// Disable and forget a local grammar.
    pub fn unload_grammar(&self, name: &str) -> Result<()> {
        let shim = self.shim()?;
        let grammar = self.grammar(name)?;
        shim.registry().disable(&grammar, shim.api())?;
        info!(grammar = %name, "grammar unloaded");
        Ok(())
    }

    /// Activate or deactivate a local grammar's main rule.
    ///
    /// Enabling reserves the grammar in the registry first, so the exclusive
    /// check and the flag flip happen under one lock; an engine rejection
    /// clears the flag again.
    pub fn set_grammar_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let shim = self.shim()?;
        let registry = shim.registry();

        if enabled {
            let Some(grammar) = registry.reserve_enable(name)? else {
                return Ok(());
            };
            let activated = loaded(&grammar).and_then(|handle| {
                let code = shim.api().grammar_activate(
                    handle,
                    OpaqueArg::default(),
                    OpaqueArg::default(),
                    grammar.main_rule.as_deref(),
                );
                check("activate", code)
            });
            if activated.is_err() {
                registry.update_key(grammar.key, |g| g.enabled = false);
            }
            return activated;
        }

        let grammar = self.grammar(name)?;
        if !grammar.enabled {
            return Ok(());
        }
        let handle = loaded(&grammar)?;
        let code = shim
            .api()
            .grammar_deactivate(handle, OpaqueArg::default(), grammar.main_rule.as_deref());
        check("deactivate", code)?;
        registry
            .update_key(grammar.key, |g| g.enabled = false)
            .ok_or_else(|| DrakeError::GrammarNotFound(name.to_string()))
    }

    pub fn set_grammar_priority(&self, name: &str, priority: i32) -> Result<()> {
        let shim = self.shim()?;
        let handle = loaded(&self.grammar(name)?)?;
        check("set-priority", shim.api().grammar_set_priority(handle, priority))?;
        self.modify(name, |g| g.priority = priority)
    }

    pub fn set_grammar_appname(&self, name: &str, appname: &str) -> Result<()> {
        let shim = self.shim()?;
        let handle = loaded(&self.grammar(name)?)?;
        check("set-app-name", shim.api().grammar_set_app_name(handle, appname))?;
        self.modify(name, |g| g.appname = Some(appname.to_string()))
    }

    /// Mark a grammar exclusive. Refused while it is enabled alongside others.
    pub fn set_grammar_exclusive(&self, name: &str, exclusive: bool) -> Result<()> {
        self.shim()?.registry().set_exclusive(name, exclusive)
    }

    /// Replace a list on a local grammar.
    pub fn set_grammar_list(&self, name: &str, list: &str, data: &[u8]) -> Result<()> {
        let shim = self.shim()?;
        let handle = loaded(&self.grammar(name)?)?;
        check("set-list", shim.api().grammar_set_list(handle, list, data))
    }

    /// Mimic `words` with the configured bounded wait.
    pub fn mimic(&self, words: &[String]) -> Result<()> {
        self.shim()?.mimic(words)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn shim(&self) -> Result<&Arc<Shim>> {
        match &self.target {
            Target::Shared => Shim::shared().ok_or(DrakeError::NotInstalled),
            Target::Private(shim) => Ok(shim),
        }
    }

    fn grammar(&self, name: &str) -> Result<Grammar> {
        self.shim()?
            .registry()
            .get(name)
            .ok_or_else(|| DrakeError::GrammarNotFound(name.to_string()))
    }

    fn modify(&self, name: &str, f: impl FnOnce(&mut Grammar)) -> Result<()> {
        self.shim()?
            .registry()
            .update(name, f)
            .ok_or_else(|| DrakeError::GrammarNotFound(name.to_string()))
    }
}

fn loaded(grammar: &Grammar) -> Result<GrammarHandle> {
    grammar
        .handle
        .ok_or_else(|| DrakeError::GrammarNotFound(grammar.name.clone()))
}
