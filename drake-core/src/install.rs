//! Symbol resolution and hook installation.
//!
//! The patching mechanism itself belongs to the platform layer and is reached
//! only through [`ModuleLoader`]. Installation is all-or-nothing: every
//! required symbol must resolve before any hook is written, and a failed hook
//! rolls back the ones already installed so the host keeps running the
//! unmodified engine.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{DrakeError, Result};

/// Engine module the hooks target.
#[cfg(target_os = "macos")]
pub const TARGET_MODULE: &str = "server.so";
#[cfg(not(target_os = "macos"))]
pub const TARGET_MODULE: &str = "server.dll";

/// Address of a function inside the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SymbolAddr(pub u64);

/// Narrow view of the process-patching capability.
pub trait ModuleLoader: Send + Sync {
    /// Look up `symbol` in `module`.
    fn resolve(&self, module: &str, symbol: &str) -> Option<SymbolAddr>;

    /// Atomically redirect `symbol` to `replacement`, returning a callable
    /// address for the code it replaced.
    fn install(
        &self,
        module: &str,
        symbol: &str,
        replacement: SymbolAddr,
    ) -> std::result::Result<SymbolAddr, String>;
}

/// Entry points redirected into the shim.
pub const HOOKED_SYMBOLS: &[&str] = &[
    "DSXEngine_New",
    "DSXEngine_Create",
    "DSXEngine_GetMicState",
    "DSXEngine_LoadGrammar",
    "DSXGrammar_Activate",
    "DSXGrammar_Deactivate",
    "DSXGrammar_SetList",
];

/// Every engine symbol the shim calls. Installation fails if any is missing.
pub const REQUIRED_SYMBOLS: &[&str] = &[
    "DSXEngine_Create",
    "DSXEngine_New",
    "DSXEngine_AddWord",
    "DSXEngine_AddTemporaryWord",
    "DSXEngine_DeleteWord",
    "DSXEngine_ValidateWord",
    "DSXEngine_EnumWords",
    "DSXWordEnum_GetCount",
    "DSXWordEnum_Next",
    "DSXWordEnum_End",
    "DSXEngine_GetCurrentSpeaker",
    "DSXEngine_GetMicState",
    "DSXEngine_LoadGrammar",
    "DSXEngine_Mimic",
    "DSXEngine_Pause",
    "DSXEngine_RegisterAttribChangedCallback",
    "DSXEngine_RegisterMimicDoneCallback",
    "DSXEngine_RegisterPausedCallback",
    "DSXEngine_Resume",
    "DSXEngine_ResumeRecognition",
    "DSXEngine_SetBeginPhraseCallback",
    "DSXEngine_SetEndPhraseCallback",
    "DSXEngine_SetStringValue",
    "DSXEngine_GetValue",
    "DSXEngine_GetParam",
    "DSXEngine_DestroyParam",
    "DSXFileSystem_PreferenceGetValue",
    "DSXFileSystem_PreferenceSetValue",
    "DSXFileSystem_SetResultsDirectory",
    "DSXFileSystem_SetUsersDirectory",
    "DSXFileSystem_SetVocabsLocation",
    "DSXGrammar_Activate",
    "DSXGrammar_Deactivate",
    "DSXGrammar_Destroy",
    "DSXGrammar_GetList",
    "DSXGrammar_RegisterBeginPhraseCallback",
    "DSXGrammar_RegisterEndPhraseCallback",
    "DSXGrammar_RegisterPhraseHypothesisCallback",
    "DSXGrammar_SetApplicationName",
    "DSXGrammar_SetList",
    "DSXGrammar_SetPriority",
    "DSXGrammar_SetSpecialGrammar",
    "DSXGrammar_Unregister",
    "DSXResult_BestPathWord",
    "DSXResult_GetWordNode",
    "DSXResult_Destroy",
];

/// A wrapper the platform layer wants installed over `symbol`.
#[derive(Debug, Clone, Copy)]
pub struct Hook {
    pub symbol: &'static str,
    pub replacement: SymbolAddr,
}

/// Resolved engine symbols plus the originals returned by hook installation.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    module: String,
    resolved: HashMap<String, SymbolAddr>,
    originals: HashMap<String, SymbolAddr>,
}

impl SymbolTable {
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Address resolved before hooking.
    pub fn resolved(&self, symbol: &str) -> Option<SymbolAddr> {
        self.resolved.get(symbol).copied()
    }

    /// Callable original for a hooked symbol.
    pub fn original(&self, symbol: &str) -> Option<SymbolAddr> {
        self.originals.get(symbol).copied()
    }

    pub fn hooked(&self) -> impl Iterator<Item = &str> {
        self.originals.keys().map(String::as_str)
    }
}

/// Resolve every required symbol, then install every hook in [`HOOKED_SYMBOLS`].
///
/// `hooks` must supply a replacement for each hooked symbol.
pub fn install_hooks(
    loader: &dyn ModuleLoader,
    module: &str,
    hooks: &[Hook],
) -> Result<SymbolTable> {
    let mut table = SymbolTable {
        module: module.to_string(),
        ..SymbolTable::default()
    };

    let mut missing = Vec::new();
    for &symbol in REQUIRED_SYMBOLS {
        match loader.resolve(module, symbol) {
            Some(addr) => {
                table.resolved.insert(symbol.to_string(), addr);
            }
            None => missing.push(symbol.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(DrakeError::SymbolMissing {
            module: module.to_string(),
            names: missing,
        });
    }

    let mut installed: Vec<(&str, SymbolAddr)> = Vec::with_capacity(HOOKED_SYMBOLS.len());
    for &symbol in HOOKED_SYMBOLS {
        let outcome = match hooks.iter().find(|h| h.symbol == symbol) {
            Some(hook) => loader.install(module, symbol, hook.replacement),
            None => Err("no replacement supplied".to_string()),
        };
        match outcome {
            Ok(original) => installed.push((symbol, original)),
            Err(reason) => {
                roll_back(loader, module, &installed);
                return Err(DrakeError::HookInstall {
                    symbol: symbol.to_string(),
                    reason,
                });
            }
        }
    }

    table.originals = installed
        .into_iter()
        .map(|(symbol, original)| (symbol.to_string(), original))
        .collect();
    info!(module, hooks = table.originals.len(), "hooks installed");
    Ok(table)
}

fn roll_back(loader: &dyn ModuleLoader, module: &str, installed: &[(&str, SymbolAddr)]) {
    for (symbol, original) in installed.iter().rev() {
        if let Err(reason) = loader.install(module, symbol, *original) {
            warn!(symbol, "failed to restore original during rollback: {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubLoader;

    fn hooks() -> Vec<Hook> {
        HOOKED_SYMBOLS
            .iter()
            .enumerate()
            .map(|(i, &symbol)| Hook {
                symbol,
                replacement: SymbolAddr(0xdead_0000 + i as u64),
            })
            .collect()
    }

    #[test]
    fn every_hooked_symbol_is_required() {
        for symbol in HOOKED_SYMBOLS {
            assert!(REQUIRED_SYMBOLS.contains(symbol), "{symbol}");
        }
    }

    #[test]
    fn successful_install_records_originals() {
        let loader = StubLoader::new();
        let table = install_hooks(&loader, TARGET_MODULE, &hooks()).expect("install");

        for (i, &symbol) in HOOKED_SYMBOLS.iter().enumerate() {
            assert_eq!(table.original(symbol), table.resolved(symbol));
            assert_eq!(loader.target(symbol), Some(SymbolAddr(0xdead_0000 + i as u64)));
        }
        assert_eq!(table.hooked().count(), HOOKED_SYMBOLS.len());
    }

    #[test]
    fn missing_symbols_abort_before_any_hook() {
        let loader = StubLoader::new()
            .without("DSXEngine_Mimic")
            .without("DSXGrammar_Unregister");
        let err = install_hooks(&loader, TARGET_MODULE, &hooks()).unwrap_err();

        match err {
            DrakeError::SymbolMissing { names, .. } => {
                assert_eq!(names, vec!["DSXEngine_Mimic", "DSXGrammar_Unregister"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let resolved = loader.target("DSXEngine_New");
        assert!(resolved.is_some_and(|addr| addr.0 < 0xdead_0000));
    }

    #[test]
    fn failed_hook_rolls_back_earlier_hooks() {
        let loader = StubLoader::new().refusing("DSXGrammar_Activate");
        let before = loader.resolve(TARGET_MODULE, "DSXEngine_New");

        let err = install_hooks(&loader, TARGET_MODULE, &hooks()).unwrap_err();

        assert!(matches!(err, DrakeError::HookInstall { ref symbol, .. } if symbol == "DSXGrammar_Activate"));
        assert_eq!(loader.target("DSXEngine_New"), before);
    }

    #[test]
    fn missing_replacement_fails_closed() {
        let loader = StubLoader::new();
        let partial: Vec<Hook> = hooks().into_iter().take(2).collect();
        let err = install_hooks(&loader, TARGET_MODULE, &partial).unwrap_err();
        assert!(matches!(err, DrakeError::HookInstall { ref reason, .. } if reason == "no replacement supplied"));
        assert_eq!(
            loader.target("DSXEngine_New"),
            loader.resolve(TARGET_MODULE, "DSXEngine_New")
        );
    }
}
