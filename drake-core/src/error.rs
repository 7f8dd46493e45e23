use thiserror::Error;

/// All errors produced by drake-core.
#[derive(Debug, Error)]
pub enum DrakeError {
    #[error("required symbol(s) missing from {module}: {}", .names.join(", "))]
    SymbolMissing { module: String, names: Vec<String> },

    #[error("failed to hook {symbol}: {reason}")]
    HookInstall { symbol: String, reason: String },

    #[error("not installed")]
    NotInstalled,

    #[error("grammar not found: {0}")]
    GrammarNotFound(String),

    #[error("grammar already registered: {0}")]
    GrammarExists(String),

    #[error("grammar {name} conflicts with exclusive grammar {holder}")]
    ExclusiveConflict { name: String, holder: String },

    #[error("engine call {op} failed with code {code}")]
    Engine { op: &'static str, code: i32 },

    #[error("no engine has been acquired yet")]
    NoEngine,

    #[error("engine does not know parameter {0}")]
    UnknownParam(String),

    #[error("errors while disabling grammar {grammar}: {details}")]
    Teardown { grammar: String, details: String },

    #[error("mimic failed")]
    MimicFailed,

    #[error("mimic timed out after {0:?}")]
    MimicTimeout(std::time::Duration),

    #[error("another mimic request is in flight")]
    MimicBusy,
}

pub type Result<T> = std::result::Result<T, DrakeError>;

/// Convert a raw engine return code (0 = success) into a `Result`.
pub fn check(op: &'static str, code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(DrakeError::Engine { op, code })
    }
}
