//! Runtime configuration for the shim.

use std::time::Duration;

/// How the registry assigns keys to newly registered grammars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Always take the next serial value; released keys are never handed out again.
    Monotonic,
    /// Prefer the oldest released key once it has been free for at least
    /// `quarantine`, otherwise take the next serial value.
    ReuseFirst { quarantine: Duration },
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::ReuseFirst {
            quarantine: Duration::ZERO,
        }
    }
}

/// Configuration for `Shim`.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Silence (ms) after which a complete phrase is finalised. Default: 80.
    pub timeout_complete_ms: u32,
    /// Silence (ms) after which an incomplete phrase is abandoned. Default: 500.
    pub timeout_incomplete_ms: u32,
    /// Extra engine parameters written after the baseline table, in order.
    pub extra_params: Vec<(String, String)>,
    /// Upper bound on how long a mimic request waits for the engine. Default: 5 s.
    pub mimic_timeout: Duration,
    /// Grammar key assignment policy.
    pub key_policy: KeyPolicy,
    /// Resume recognition immediately when the engine reports a pause.
    pub resume_on_pause: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            timeout_complete_ms: 80,
            timeout_incomplete_ms: 500,
            extra_params: Vec::new(),
            mimic_timeout: Duration::from_secs(5),
            key_policy: KeyPolicy::default(),
            resume_on_pause: true,
        }
    }
}
