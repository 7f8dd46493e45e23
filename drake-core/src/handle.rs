//! Opaque handle types.
//!
//! The engine owns every object these refer to. Handles are compared by
//! identity only and are never dereferenced here; the platform layer converts
//! raw pointers to and from these values at the hook boundary.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Wrap a raw address. Returns `None` for null.
            pub fn from_raw(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            pub fn raw(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0.get())
            }
        }
    };
}

opaque_handle!(
    /// An engine instance created by the host.
    EngineHandle
);
opaque_handle!(
    /// A grammar object loaded into the engine.
    GrammarHandle
);
opaque_handle!(
    /// A parameter object returned by get-param; must be destroyed after use.
    ParamHandle
);

/// Registration key the engine hands back for a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackKey(pub u32);

/// Process-unique key assigned to a local grammar by the registry.
///
/// Passed to the engine as callback user data so per-grammar callbacks can be
/// routed back to the grammar that registered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrammarKey(pub u64);

impl fmt::Display for GrammarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An engine-private activation argument of undocumented meaning.
///
/// Carried through unchanged at full width and never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueArg(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles_are_rejected() {
        assert!(EngineHandle::from_raw(0).is_none());
        assert_eq!(GrammarHandle::from_raw(0x10).map(GrammarHandle::raw), Some(0x10));
    }

    #[test]
    fn handles_display_as_hex_addresses() {
        let handle = GrammarHandle::from_raw(0xbeef).expect("non-null");
        assert_eq!(handle.to_string(), "0xbeef");
    }
}
