//! # drake-core
//!
//! Grammar registry and activation gate for a speech engine whose entry
//! points have been redirected into this crate.
//!
//! ## Architecture
//!
//! ```text
//! host app ──► hooked entry point ──► Shim wrapper ──┬─► GrammarRegistry (local grammars)
//!                                                    ├─► ActivationGate ─► ForeignTracker
//!                                                    └─► EngineApi (original functions)
//!
//! engine threads ──► EngineCallbacks ──► Shim state ──► broadcast::Sender<ShimEvent>
//!
//! control caller ──► ControlApi ──► Shim
//! ```
//!
//! Raw pointers never enter this crate: the platform layer translates them into
//! the opaque handle types in [`handle`] before calling a wrapper.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod foreign;
pub mod gate;
pub mod handle;
pub mod install;
pub mod mimic;
pub mod registry;
pub mod shim;

// Convenience re-exports for downstream crates
pub use config::{KeyPolicy, ShimConfig};
pub use control::{ControlApi, ControlStatus, GrammarSpec};
pub use engine::{EngineApi, EngineCallbacks, EngineCallbackKind, PhrasePhase};
pub use error::DrakeError;
pub use events::ShimEvent;
pub use handle::{CallbackKey, EngineHandle, GrammarHandle, GrammarKey, OpaqueArg, ParamHandle};
pub use install::{ModuleLoader, SymbolAddr, SymbolTable};
pub use shim::Shim;
