//! Events published to control-API subscribers.
//!
//! ## Topics
//!
//! | Variant | `topic` |
//! |---------|---------|
//! | `Status` | `"status"` |
//! | `Attribute` | `"attribute"` |
//! | `Paused` | `"paused"` |
//! | `PhraseBegin` | `"phraseBegin"` |
//! | `Phrase` | `"phrase"` |
//! | `Mimic` | `"mimic"` |

use serde::{Deserialize, Serialize};

use crate::engine::PhrasePhase;

/// Lifecycle milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCmd {
    /// Engine bound and configured.
    Start,
    /// A speaker profile is loaded; recognition can be used.
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "camelCase")]
pub enum ShimEvent {
    Status { cmd: StatusCmd },
    Attribute { name: String },
    Paused { cookie: u64 },
    PhraseBegin,
    Phrase {
        grammar: String,
        phase: PhrasePhase,
        words: Vec<String>,
    },
    Mimic { success: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_topic_tag() {
        let json = serde_json::to_value(ShimEvent::Status {
            cmd: StatusCmd::Start,
        })
        .expect("serialize status");
        assert_eq!(json["topic"], "status");
        assert_eq!(json["cmd"], "start");
    }

    #[test]
    fn phrase_event_round_trips() {
        let event = ShimEvent::Phrase {
            grammar: "commands".into(),
            phase: PhrasePhase::Hypothesis,
            words: vec!["go".into(), "left".into()],
        };
        let json = serde_json::to_value(&event).expect("serialize phrase");
        assert_eq!(json["topic"], "phrase");
        assert_eq!(json["phase"], "hypothesis");

        let back: ShimEvent = serde_json::from_value(json).expect("deserialize phrase");
        assert_eq!(back, event);
    }

    #[test]
    fn unit_variant_uses_camel_case_topic() {
        let json = serde_json::to_string(&ShimEvent::PhraseBegin).expect("serialize");
        assert_eq!(json, r#"{"topic":"phraseBegin"}"#);
    }
}
