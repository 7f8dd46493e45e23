//! Local grammar registry.
//!
//! Grammars registered through the control API live here, indexed by name and
//! by the process-unique key handed to the engine as callback user data.
//!
//! ## Locking
//!
//! One `parking_lot::Mutex` guards both indexes, the free-key queue and the
//! serial counter. Critical sections never call into the engine: `disable`
//! unlinks the grammar under the lock, releases it, tears the grammar down in
//! the engine, and only then re-locks to queue the key for reuse. A key is
//! therefore never handed out again while the engine could still route a
//! callback with it.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::KeyPolicy,
    engine::EngineApi,
    error::{DrakeError, Result},
    handle::{CallbackKey, GrammarHandle, GrammarKey, OpaqueArg},
};

/// A grammar owned by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    pub name: String,
    pub main_rule: Option<String>,
    /// Assigned by [`GrammarRegistry::set`]; `GrammarKey(0)` until then.
    pub key: GrammarKey,
    /// Engine object; owned by the engine.
    pub handle: Option<GrammarHandle>,
    pub enabled: bool,
    /// No other grammar may be active at the same time.
    pub exclusive: bool,
    pub priority: i32,
    pub appname: Option<String>,
    pub beginkey: Option<CallbackKey>,
    pub endkey: Option<CallbackKey>,
    pub hypokey: Option<CallbackKey>,
}

impl Grammar {
    pub fn new(name: impl Into<String>, main_rule: Option<&str>) -> Self {
        Self {
            name: name.into(),
            main_rule: main_rule.map(str::to_string),
            key: GrammarKey(0),
            handle: None,
            enabled: false,
            exclusive: false,
            priority: 0,
            appname: None,
            beginkey: None,
            endkey: None,
            hypokey: None,
        }
    }
}

/// A released key waiting to be handed out again. Never mutated once queued.
#[derive(Debug, Clone, Copy)]
pub struct ReuseKey {
    pub key: GrammarKey,
    pub released_at: Instant,
    /// Serial counter value at release time.
    pub serial: u64,
}

#[derive(Default)]
struct Keys {
    grammars: HashMap<GrammarKey, Grammar>,
    names: HashMap<String, GrammarKey>,
    free: VecDeque<ReuseKey>,
    serial: u64,
}

impl Keys {
    fn next_key(&mut self, policy: KeyPolicy) -> GrammarKey {
        if let KeyPolicy::ReuseFirst { quarantine } = policy {
            let ripe = self
                .free
                .front()
                .is_some_and(|head| head.released_at.elapsed() >= quarantine);
            if ripe {
                if let Some(head) = self.free.pop_front() {
                    return head.key;
                }
            }
        }
        self.serial += 1;
        GrammarKey(self.serial)
    }

    /// Unlink the entry under `key` only if it is still the same grammar
    /// (same name and engine handle) the caller holds.
    fn unlink_same(&mut self, grammar: &Grammar) -> Option<Grammar> {
        let live = self.grammars.get(&grammar.key)?;
        if live.name != grammar.name || live.handle != grammar.handle {
            return None;
        }
        self.unlink(grammar.key)
    }

    fn unlink(&mut self, key: GrammarKey) -> Option<Grammar> {
        let grammar = self.grammars.remove(&key)?;
        if self.names.get(&grammar.name) == Some(&key) {
            self.names.remove(&grammar.name);
        }
        Some(grammar)
    }
}

pub struct GrammarRegistry {
    keys: Mutex<Keys>,
    policy: KeyPolicy,
}

impl GrammarRegistry {
    pub fn new(policy: KeyPolicy) -> Self {
        Self {
            keys: Mutex::new(Keys::default()),
            policy,
        }
    }

    /// Snapshot of the grammar registered as `name`.
    pub fn get(&self, name: &str) -> Option<Grammar> {
        let keys = self.keys.lock();
        keys.names
            .get(name)
            .and_then(|key| keys.grammars.get(key))
            .cloned()
    }

    /// Name of the grammar that owns `key`, used to route per-grammar callbacks.
    pub fn gkey_to_name(&self, key: GrammarKey) -> Option<String> {
        self.keys.lock().grammars.get(&key).map(|g| g.name.clone())
    }

    /// Insert `grammar` under its name with a freshly assigned key.
    ///
    /// A grammar previously registered under the same name is unlinked from
    /// both indexes and returned; the caller must [`retire`](Self::retire) it.
    pub fn set(&self, mut grammar: Grammar) -> (GrammarKey, Option<Grammar>) {
        let mut keys = self.keys.lock();
        let previous = keys.names.get(&grammar.name).copied();
        let displaced = previous.and_then(|old| keys.unlink(old));

        let key = keys.next_key(self.policy);
        debug_assert!(!keys.grammars.contains_key(&key));
        grammar.key = key;
        keys.names.insert(grammar.name.clone(), key);
        keys.grammars.insert(key, grammar);
        (key, displaced)
    }

    /// Apply `f` to the live grammar `name`. Returns `None` if it is not registered.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut Grammar) -> R) -> Option<R> {
        let mut keys = self.keys.lock();
        let key = *keys.names.get(name)?;
        keys.grammars.get_mut(&key).map(f)
    }

    /// Apply `f` to the live grammar registered under `key`.
    pub fn update_key<R>(&self, key: GrammarKey, f: impl FnOnce(&mut Grammar) -> R) -> Option<R> {
        self.keys.lock().grammars.get_mut(&key).map(f)
    }

    /// Mark `name` enabled if no exclusive conflict exists, all under one lock.
    ///
    /// Returns the grammar as it was reserved, or `None` if it was already
    /// enabled. The caller activates it on the engine afterwards and rolls the
    /// flag back with [`update_key`](Self::update_key) if that fails.
    pub fn reserve_enable(&self, name: &str) -> Result<Option<Grammar>> {
        let mut keys = self.keys.lock();
        let key = *keys
            .names
            .get(name)
            .ok_or_else(|| DrakeError::GrammarNotFound(name.to_string()))?;
        let (enabled, exclusive) = match keys.grammars.get(&key) {
            Some(g) => (g.enabled, g.exclusive),
            None => return Err(DrakeError::GrammarNotFound(name.to_string())),
        };
        if enabled {
            return Ok(None);
        }
        if let Some(holder) = conflict(&keys, name, exclusive) {
            return Err(DrakeError::ExclusiveConflict {
                name: name.to_string(),
                holder,
            });
        }
        let grammar = keys
            .grammars
            .get_mut(&key)
            .ok_or_else(|| DrakeError::GrammarNotFound(name.to_string()))?;
        grammar.enabled = true;
        Ok(Some(grammar.clone()))
    }

    /// Set the exclusive flag on `name`, refusing if it is enabled alongside
    /// other enabled grammars. Checked and applied under one lock.
    pub fn set_exclusive(&self, name: &str, exclusive: bool) -> Result<()> {
        let mut keys = self.keys.lock();
        let key = *keys
            .names
            .get(name)
            .ok_or_else(|| DrakeError::GrammarNotFound(name.to_string()))?;
        let enabled = keys.grammars.get(&key).is_some_and(|g| g.enabled);
        if exclusive && enabled {
            if let Some(holder) = conflict(&keys, name, true) {
                return Err(DrakeError::ExclusiveConflict {
                    name: name.to_string(),
                    holder,
                });
            }
        }
        if let Some(grammar) = keys.grammars.get_mut(&key) {
            grammar.exclusive = exclusive;
        }
        Ok(())
    }

    /// Enabled grammar that would conflict with enabling `name`.
    ///
    /// An exclusive grammar conflicts with every other enabled grammar; a
    /// normal one conflicts only with an enabled exclusive grammar.
    pub fn exclusive_conflict(&self, name: &str, exclusive: bool) -> Option<String> {
        conflict(&self.keys.lock(), name, exclusive)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keys.lock().names.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.keys.lock().grammars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Released keys waiting for reuse.
    pub fn free_keys(&self) -> usize {
        self.keys.lock().free.len()
    }

    /// Unregister `grammar` and tear it down in the engine.
    ///
    /// A grammar that is no longer registered is a successful no-op, even if
    /// its key has since been handed to another grammar.
    pub fn disable(&self, grammar: &Grammar, api: &dyn EngineApi) -> Result<()> {
        let unlinked = self.keys.lock().unlink_same(grammar);
        match unlinked {
            Some(live) => self.retire(&live, api),
            None => {
                debug!(grammar = %grammar.name, "disable on unregistered grammar");
                Ok(())
            }
        }
    }

    /// Tear down an already-unlinked grammar and release its key.
    ///
    /// Every step runs even if an earlier one failed; failures are joined
    /// into a single `Teardown` error.
    pub fn retire(&self, grammar: &Grammar, api: &dyn EngineApi) -> Result<()> {
        let mut failures = Vec::new();

        if let Some(handle) = grammar.handle {
            if grammar.enabled {
                let code = api.grammar_deactivate(
                    handle,
                    OpaqueArg::default(),
                    grammar.main_rule.as_deref(),
                );
                if code != 0 {
                    failures.push(format!("deactivate failed ({code})"));
                }
            }

            for (label, callback) in [
                ("begin", grammar.beginkey),
                ("end", grammar.endkey),
                ("hypothesis", grammar.hypokey),
            ] {
                let Some(callback) = callback else { continue };
                let code = api.grammar_unregister(handle, callback);
                if code != 0 {
                    failures.push(format!("unregister {label} callback failed ({code})"));
                }
            }

            let code = api.grammar_destroy(handle);
            if code != 0 {
                failures.push(format!("destroy failed ({code})"));
            }
        }

        self.release(grammar.key);

        if failures.is_empty() {
            Ok(())
        } else {
            let details = failures.join("; ");
            warn!(grammar = %grammar.name, "{details}");
            Err(DrakeError::Teardown {
                grammar: grammar.name.clone(),
                details,
            })
        }
    }

    fn release(&self, key: GrammarKey) {
        // Nothing consumes the queue under a monotonic policy.
        if self.policy == KeyPolicy::Monotonic || key == GrammarKey(0) {
            return;
        }
        let mut keys = self.keys.lock();
        let serial = keys.serial;
        keys.free.push_back(ReuseKey {
            key,
            released_at: Instant::now(),
            serial,
        });
    }
}

fn conflict(keys: &Keys, name: &str, exclusive: bool) -> Option<String> {
    keys.grammars
        .values()
        .filter(|g| g.enabled && g.name != name)
        .find(|g| exclusive || g.exclusive)
        .map(|g| g.name.clone())
}
