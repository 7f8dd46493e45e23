//! Foreign grammar tracking.
//!
//! Grammars the host activates directly on the engine never pass through the
//! local registry. Every such activation is remembered here, whether or not it
//! was forwarded, so the whole set can later be replayed onto the engine or
//! pulled back off it in one sweep.

use std::fmt;

use serde::Serialize;

use crate::{
    engine::EngineApi,
    handle::{GrammarHandle, OpaqueArg},
};

/// One host-initiated activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignGrammar {
    pub grammar: GrammarHandle,
    pub arg1: OpaqueArg,
    pub arg2: OpaqueArg,
    /// Owned copy; the host's string does not outlive its call.
    pub main_rule: Option<String>,
}

impl ForeignGrammar {
    pub fn new(
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<&str>,
    ) -> Self {
        Self {
            grammar,
            arg1,
            arg2,
            main_rule: main_rule.map(str::to_string),
        }
    }

    /// Same engine grammar and same main rule. An absent rule only matches
    /// another absent rule; in particular it never matches `""`.
    pub fn matches(&self, grammar: GrammarHandle, main_rule: Option<&str>) -> bool {
        self.grammar == grammar && self.main_rule.as_deref() == main_rule
    }

    pub fn activate(&self, api: &dyn EngineApi) -> i32 {
        api.grammar_activate(self.grammar, self.arg1, self.arg2, self.main_rule.as_deref())
    }

    pub fn deactivate(&self, api: &dyn EngineApi) -> i32 {
        api.grammar_deactivate(self.grammar, self.arg1, self.main_rule.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardAction {
    Activate,
    Deactivate,
}

/// A replayed call the engine rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardFailure {
    pub action: ForwardAction,
    pub grammar: GrammarHandle,
    pub main_rule: Option<String>,
    pub code: i32,
}

impl fmt::Display for ForwardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.action {
            ForwardAction::Activate => "activate",
            ForwardAction::Deactivate => "deactivate",
        };
        write!(
            f,
            "{verb} {} rule {} failed ({})",
            self.grammar,
            self.main_rule.as_deref().unwrap_or("<none>"),
            self.code
        )
    }
}

/// Insertion-ordered list of tracked activations. Not synchronised on its
/// own; the activation gate owns the lock.
#[derive(Debug, Default)]
pub struct ForeignTracker {
    entries: Vec<ForeignGrammar>,
}

impl ForeignTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        grammar: GrammarHandle,
        arg1: OpaqueArg,
        arg2: OpaqueArg,
        main_rule: Option<&str>,
    ) {
        self.entries
            .push(ForeignGrammar::new(grammar, arg1, arg2, main_rule));
    }

    /// Remove the oldest entry matching `grammar`/`main_rule`, if any.
    pub fn remove_first_match(
        &mut self,
        grammar: GrammarHandle,
        main_rule: Option<&str>,
    ) -> Option<ForeignGrammar> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.matches(grammar, main_rule))?;
        Some(self.entries.remove(index))
    }

    /// Forward every entry to the engine's activate. Keeps going past failures.
    pub fn activate_all(&self, api: &dyn EngineApi) -> Vec<ForwardFailure> {
        self.sweep(ForwardAction::Activate, |entry| entry.activate(api))
    }

    /// Forward every entry to the engine's deactivate. Keeps going past failures.
    pub fn deactivate_all(&self, api: &dyn EngineApi) -> Vec<ForwardFailure> {
        self.sweep(ForwardAction::Deactivate, |entry| entry.deactivate(api))
    }

    pub fn entries(&self) -> &[ForeignGrammar] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(
        &self,
        action: ForwardAction,
        mut forward: impl FnMut(&ForeignGrammar) -> i32,
    ) -> Vec<ForwardFailure> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let code = forward(entry);
                (code != 0).then(|| ForwardFailure {
                    action,
                    grammar: entry.grammar,
                    main_rule: entry.main_rule.clone(),
                    code,
                })
            })
            .collect()
    }
}
