//! Scripted host sessions against the stub engine.
//!
//! A script is a JSON document `{"steps": [...]}`. Each step is either a call
//! the host application would make through a hooked engine entry point, a
//! control request, or a simulated engine-thread event. Foreign grammars are
//! referred to by an alias chosen when the host loads them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use drake_core::engine::stub::{MimicMode, StubCall, StubEngine, StubLoader};
use drake_core::install::{Hook, HOOKED_SYMBOLS};
use drake_core::{
    ControlApi, ControlStatus, EngineApi, EngineHandle, GrammarHandle, GrammarSpec, OpaqueArg,
    PhrasePhase, Shim, ShimConfig, ShimEvent, SymbolAddr,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

const HOOK_BASE: u64 = 0x5000_0000;

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Step {
    // Host calls through hooked entry points.
    EngineNew,
    EngineCreate {
        spec: String,
        #[serde(default)]
        value: u64,
    },
    MicState,
    HostLoad {
        alias: String,
        #[serde(default)]
        format: i32,
        #[serde(default)]
        data: String,
    },
    HostActivate {
        alias: String,
        #[serde(default)]
        arg1: OpaqueArg,
        #[serde(default)]
        arg2: OpaqueArg,
        main_rule: Option<String>,
    },
    HostDeactivate {
        alias: String,
        #[serde(default)]
        arg1: OpaqueArg,
        main_rule: Option<String>,
    },
    HostSetList {
        alias: String,
        name: String,
        #[serde(default)]
        data: String,
    },

    // Control requests.
    Dragon {
        enabled: bool,
    },
    Load {
        grammar: GrammarSpec,
    },
    Unload {
        name: String,
    },
    Enable {
        name: String,
        enabled: bool,
    },
    Exclusive {
        name: String,
        exclusive: bool,
    },
    Priority {
        name: String,
        priority: i32,
    },
    Appname {
        name: String,
        appname: String,
    },
    List {
        name: String,
        list: String,
        #[serde(default)]
        data: String,
    },
    Param {
        key: String,
        value: String,
    },
    Mimic {
        words: Vec<String>,
    },

    // Simulated engine events.
    Speak {
        name: String,
        phase: PhrasePhase,
        words: Vec<String>,
    },
    Attribute {
        name: String,
    },
    Pause {
        cookie: u64,
    },
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::EngineNew => "engineNew",
            Step::EngineCreate { .. } => "engineCreate",
            Step::MicState => "micState",
            Step::HostLoad { .. } => "hostLoad",
            Step::HostActivate { .. } => "hostActivate",
            Step::HostDeactivate { .. } => "hostDeactivate",
            Step::HostSetList { .. } => "hostSetList",
            Step::Dragon { .. } => "dragon",
            Step::Load { .. } => "load",
            Step::Unload { .. } => "unload",
            Step::Enable { .. } => "enable",
            Step::Exclusive { .. } => "exclusive",
            Step::Priority { .. } => "priority",
            Step::Appname { .. } => "appname",
            Step::List { .. } => "list",
            Step::Param { .. } => "param",
            Step::Mimic { .. } => "mimic",
            Step::Speak { .. } => "speak",
            Step::Attribute { .. } => "attribute",
            Step::Pause { .. } => "pause",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub index: usize,
    pub step: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub outcomes: Vec<Outcome>,
    pub events: Vec<ShimEvent>,
    pub engine_calls: Vec<StubCall>,
    pub status: ControlStatus,
}

impl Report {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.ok).count()
    }
}

/// An installed shim over a stub engine, driven one step at a time.
pub struct Session {
    shim: &'static Arc<Shim>,
    control: ControlApi,
    stub: Arc<StubEngine>,
    engine: Option<EngineHandle>,
    foreign: HashMap<String, GrammarHandle>,
    events: broadcast::Receiver<ShimEvent>,
}

impl Session {
    /// Install the process-wide shim over a fresh stub engine.
    pub fn install(config: ShimConfig) -> anyhow::Result<Self> {
        let stub = Arc::new(StubEngine::new());
        stub.set_mimic_mode(MimicMode::Deferred { success: true });

        let hooks: Vec<Hook> = HOOKED_SYMBOLS
            .iter()
            .enumerate()
            .map(|(i, &symbol)| Hook {
                symbol,
                replacement: SymbolAddr(HOOK_BASE + (i as u64) * 0x10),
            })
            .collect();

        let engine_api = Arc::clone(&stub);
        let shim = Shim::install(&StubLoader::new(), &hooks, config, move |table| {
            info!(
                module = table.module(),
                hooked = table.hooked().count(),
                "engine symbols bound"
            );
            engine_api as Arc<dyn EngineApi>
        })
        .context("installing shim")?;

        let control = ControlApi::new(Arc::clone(shim));
        let events = shim.subscribe();
        Ok(Self {
            shim,
            control,
            stub,
            engine: None,
            foreign: HashMap::new(),
            events,
        })
    }

    pub fn run(mut self, script: &Script) -> Report {
        let mut outcomes = Vec::with_capacity(script.steps.len());
        for (index, step) in script.steps.iter().enumerate() {
            let result = self.apply(step);
            let outcome = match result {
                Ok(detail) => Outcome {
                    index,
                    step: step.label(),
                    ok: true,
                    detail,
                },
                Err(e) => {
                    warn!(index, step = step.label(), "step failed: {e:#}");
                    Outcome {
                        index,
                        step: step.label(),
                        ok: false,
                        detail: Some(format!("{e:#}")),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Report {
            outcomes,
            events: self.drain_events(),
            engine_calls: self.stub.calls(),
            status: self.control.status(),
        }
    }

    fn apply(&mut self, step: &Step) -> anyhow::Result<Option<String>> {
        debug!(step = step.label(), "applying step");
        match step {
            Step::EngineNew => {
                let engine = self
                    .shim
                    .hook_engine_new()
                    .ok_or_else(|| anyhow!("engine creation returned nothing"))?;
                self.engine = Some(engine);
                Ok(Some(engine.to_string()))
            }
            Step::EngineCreate { spec, value } => {
                let (code, engine) = self.shim.hook_engine_create(spec, *value);
                if code != 0 {
                    bail!("engine create returned {code}");
                }
                let engine = engine.ok_or_else(|| anyhow!("engine create returned no handle"))?;
                self.engine = Some(engine);
                Ok(Some(engine.to_string()))
            }
            Step::MicState => {
                let (code, state) = self.shim.hook_get_mic_state(self.engine()?);
                host_code("mic state", code)?;
                Ok(Some(state.to_string()))
            }
            Step::HostLoad {
                alias,
                format,
                data,
            } => {
                let (code, grammar) =
                    self.shim
                        .hook_load_grammar(self.engine()?, *format, data.as_bytes());
                host_code("load grammar", code)?;
                let grammar = grammar.ok_or_else(|| anyhow!("engine returned no grammar"))?;
                self.foreign.insert(alias.clone(), grammar);
                Ok(Some(grammar.to_string()))
            }
            Step::HostActivate {
                alias,
                arg1,
                arg2,
                main_rule,
            } => {
                let grammar = self.foreign(alias)?;
                let code =
                    self.shim
                        .hook_grammar_activate(grammar, *arg1, *arg2, main_rule.as_deref());
                host_code("activate", code).map(|_| None)
            }
            Step::HostDeactivate {
                alias,
                arg1,
                main_rule,
            } => {
                let grammar = self.foreign(alias)?;
                let code = self
                    .shim
                    .hook_grammar_deactivate(grammar, *arg1, main_rule.as_deref());
                host_code("deactivate", code).map(|_| None)
            }
            Step::HostSetList { alias, name, data } => {
                let grammar = self.foreign(alias)?;
                let code = self
                    .shim
                    .hook_grammar_set_list(grammar, name, data.as_bytes());
                host_code("set list", code).map(|_| None)
            }
            Step::Dragon { enabled } => Ok(Some(self.control.set_dragon_enabled(*enabled)?)),
            Step::Load { grammar } => {
                let key = self.control.load_grammar(grammar.clone())?;
                Ok(Some(format!("key {}", key.0)))
            }
            Step::Unload { name } => Ok(self.control.unload_grammar(name).map(|_| None)?),
            Step::Enable { name, enabled } => Ok(self
                .control
                .set_grammar_enabled(name, *enabled)
                .map(|_| None)?),
            Step::Exclusive { name, exclusive } => Ok(self
                .control
                .set_grammar_exclusive(name, *exclusive)
                .map(|_| None)?),
            Step::Priority { name, priority } => Ok(self
                .control
                .set_grammar_priority(name, *priority)
                .map(|_| None)?),
            Step::Appname { name, appname } => Ok(self
                .control
                .set_grammar_appname(name, appname)
                .map(|_| None)?),
            Step::List { name, list, data } => Ok(self
                .control
                .set_grammar_list(name, list, data.as_bytes())
                .map(|_| None)?),
            Step::Param { key, value } => Ok(self.shim.set_param(key, value).map(|_| None)?),
            Step::Mimic { words } => Ok(self.control.mimic(words).map(|_| None)?),
            Step::Speak { name, phase, words } => {
                let grammar = self
                    .shim
                    .registry()
                    .get(name)
                    .and_then(|g| g.handle)
                    .ok_or_else(|| anyhow!("no loaded grammar named {name}"))?;
                self.stub.fire_grammar_phrase(grammar, *phase, words);
                Ok(None)
            }
            Step::Attribute { name } => {
                self.stub.fire_attrib_changed(name);
                Ok(None)
            }
            Step::Pause { cookie } => {
                self.stub.fire_paused(*cookie);
                Ok(None)
            }
        }
    }

    fn engine(&self) -> anyhow::Result<EngineHandle> {
        self.engine
            .ok_or_else(|| anyhow!("no engine yet; run engineNew or engineCreate first"))
    }

    fn foreign(&self, alias: &str) -> anyhow::Result<GrammarHandle> {
        self.foreign
            .get(alias)
            .copied()
            .ok_or_else(|| anyhow!("unknown host grammar alias {alias}"))
    }

    fn drain_events(&mut self) -> Vec<ShimEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        events
    }
}

fn host_code(op: &str, code: i32) -> anyhow::Result<()> {
    if code != 0 {
        bail!("{op} returned {code}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drake_core::events::StatusCmd;

    fn script(json: &str) -> Script {
        serde_json::from_str(json).expect("parse script")
    }

    #[test]
    fn parses_every_step_shape() {
        let parsed = script(
            r#"{"steps": [
                {"step": "engineNew"},
                {"step": "hostLoad", "alias": "dict"},
                {"step": "hostActivate", "alias": "dict", "arg1": 7, "mainRule": "main"},
                {"step": "hostDeactivate", "alias": "dict"},
                {"step": "dragon", "enabled": false},
                {"step": "load", "grammar": {"name": "cmd", "mainRule": "root", "exclusive": true}},
                {"step": "speak", "name": "cmd", "phase": "end", "words": ["go"]},
                {"step": "pause", "cookie": 3}
            ]}"#,
        );
        let labels: Vec<_> = parsed.steps.iter().map(Step::label).collect();
        assert_eq!(
            labels,
            [
                "engineNew",
                "hostLoad",
                "hostActivate",
                "hostDeactivate",
                "dragon",
                "load",
                "speak",
                "pause"
            ]
        );
        match &parsed.steps[2] {
            Step::HostActivate {
                arg1,
                arg2,
                main_rule,
                ..
            } => {
                assert_eq!(*arg1, OpaqueArg(7));
                assert_eq!(*arg2, OpaqueArg::default());
                assert_eq!(main_rule.as_deref(), Some("main"));
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &parsed.steps[3] {
            Step::HostDeactivate { main_rule, .. } => assert!(main_rule.is_none()),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_step() {
        let err = serde_json::from_str::<Script>(r#"{"steps": [{"step": "reboot"}]}"#);
        assert!(err.is_err());
    }

    // The shim is process-global, so one session covers the whole flow.
    #[test]
    fn scripted_session_end_to_end() {
        let session = Session::install(ShimConfig::default()).expect("install");
        let report = session.run(&script(
            r#"{"steps": [
                {"step": "speak", "name": "cmd", "phase": "end", "words": []},
                {"step": "engineNew"},
                {"step": "dragon", "enabled": true},
                {"step": "hostLoad", "alias": "dict"},
                {"step": "hostActivate", "alias": "dict", "arg1": 1, "arg2": 2, "mainRule": "main"},
                {"step": "dragon", "enabled": false},
                {"step": "hostActivate", "alias": "dict", "mainRule": "other"},
                {"step": "hostDeactivate", "alias": "dict", "mainRule": "main"},
                {"step": "dragon", "enabled": true},
                {"step": "load", "grammar": {"name": "cmd", "mainRule": "root"}},
                {"step": "enable", "name": "cmd", "enabled": true},
                {"step": "speak", "name": "cmd", "phase": "end", "words": ["open", "file"]},
                {"step": "mimic", "words": ["hello"]},
                {"step": "hostActivate", "alias": "missing"}
            ]}"#,
        ));

        let failed: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| !o.ok)
            .map(|o| o.index)
            .collect();
        assert_eq!(failed, [0, 13]);
        assert_eq!(report.failures(), 2);

        // While gated off, "other" was tracked and "main" dropped, so only
        // "other" is replayed on re-enable.
        let replayed: Vec<_> = report
            .engine_calls
            .iter()
            .filter_map(|call| match call {
                StubCall::Activate { main_rule, .. } => main_rule.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, ["main", "other", "root"]);

        assert!(report.events.contains(&ShimEvent::Status {
            cmd: StatusCmd::Start
        }));
        assert!(report.events.iter().any(|e| matches!(
            e,
            ShimEvent::Phrase { grammar, words, .. } if grammar == "cmd" && words.len() == 2
        )));

        assert!(report.status.installed);
        assert!(report.status.dragon_enabled);
        assert_eq!(report.status.grammars, ["cmd"]);
        assert_eq!(report.status.foreign_grammars, 1);
    }
}
