use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use drake_core::engine::stub::{MimicMode, StubCall, StubEngine, StubOp};
use drake_core::engine::PhrasePhase;
use drake_core::{
    ControlApi, DrakeError, GrammarHandle, GrammarSpec, OpaqueArg, Shim, ShimConfig, ShimEvent,
};

fn bound() -> (ControlApi, Arc<Shim>, Arc<StubEngine>) {
    let stub = Arc::new(StubEngine::new());
    let config = ShimConfig {
        mimic_timeout: Duration::from_millis(200),
        ..ShimConfig::default()
    };
    let shim = Shim::new(stub.clone(), config);
    shim.hook_engine_new().expect("engine");
    (ControlApi::new(Arc::clone(&shim)), shim, stub)
}

fn spec(name: &str) -> GrammarSpec {
    GrammarSpec {
        name: name.into(),
        main_rule: Some("main".into()),
        data: b"compiled".to_vec(),
        ..GrammarSpec::default()
    }
}

fn handle_of(shim: &Shim, name: &str) -> GrammarHandle {
    shim.registry()
        .get(name)
        .and_then(|g| g.handle)
        .expect("loaded grammar")
}

#[test]
fn detached_control_reports_not_installed() {
    // Nothing in this test binary installs the process-wide shim.
    let control = ControlApi::shared();
    assert!(!control.is_installed());
    assert!(!control.status().installed);
    assert!(matches!(
        control.set_dragon_enabled(true),
        Err(DrakeError::NotInstalled)
    ));
    assert!(matches!(
        control.load_grammar(spec("a")),
        Err(DrakeError::NotInstalled)
    ));
}

#[test]
fn load_registers_callbacks_and_applies_settings() {
    let (control, shim, stub) = bound();
    let key = control
        .load_grammar(GrammarSpec {
            priority: 3,
            appname: Some("editor".into()),
            ..spec("commands")
        })
        .expect("load");

    let grammar = shim.registry().get("commands").expect("registered");
    assert_eq!(grammar.key, key);
    assert!(grammar.beginkey.is_some());
    assert!(grammar.endkey.is_some());
    assert!(grammar.hypokey.is_some());
    assert_eq!(stub.phrase_registrations(), 3);

    let handle = handle_of(&shim, "commands");
    let calls = stub.calls();
    assert!(calls.contains(&StubCall::SetAppName {
        grammar: handle,
        appname: "editor".into()
    }));
    assert!(calls.contains(&StubCall::SetPriority {
        grammar: handle,
        priority: 3
    }));
    assert_eq!(control.status().grammars, vec!["commands".to_string()]);
}

#[test]
fn load_without_engine_is_rejected() {
    let stub = Arc::new(StubEngine::new());
    let control = ControlApi::new(Shim::new(stub, ShimConfig::default()));
    assert!(matches!(
        control.load_grammar(spec("a")),
        Err(DrakeError::NoEngine)
    ));
}

#[test]
fn duplicate_and_missing_names_are_typed_errors() {
    let (control, _shim, _stub) = bound();
    control.load_grammar(spec("a")).expect("load");

    assert!(matches!(
        control.load_grammar(spec("a")),
        Err(DrakeError::GrammarExists(name)) if name == "a"
    ));
    assert!(matches!(
        control.unload_grammar("missing"),
        Err(DrakeError::GrammarNotFound(_))
    ));
    assert!(matches!(
        control.set_grammar_enabled("missing", true),
        Err(DrakeError::GrammarNotFound(_))
    ));
}

#[test]
fn failed_phrase_callback_does_not_fail_the_load() {
    let (control, shim, stub) = bound();
    stub.fail(StubOp::RegisterPhraseCallback, 1);

    control.load_grammar(spec("a")).expect("load");

    let grammar = shim.registry().get("a").expect("registered");
    assert!(grammar.beginkey.is_none());
    assert!(grammar.hypokey.is_none());
}

#[test]
fn local_grammars_bypass_the_gate() {
    let (control, shim, stub) = bound();
    control.load_grammar(spec("a")).expect("load");
    assert!(!control.status().dragon_enabled);

    control.set_grammar_enabled("a", true).expect("enable");

    let handle = handle_of(&shim, "a");
    assert_eq!(
        stub.activations(),
        vec![StubCall::Activate {
            grammar: handle,
            arg1: OpaqueArg(0),
            arg2: OpaqueArg(0),
            main_rule: Some("main".into()),
        }]
    );
    assert_eq!(shim.gate().tracked_len(), 0);
    assert!(shim.registry().get("a").is_some_and(|g| g.enabled));
}

#[test]
fn engine_rejection_leaves_grammar_disabled() {
    let (control, shim, stub) = bound();
    control.load_grammar(spec("a")).expect("load");
    stub.fail(StubOp::Activate, 6);

    let err = control.set_grammar_enabled("a", true).unwrap_err();
    assert!(matches!(err, DrakeError::Engine { op: "activate", code: 6 }));
    assert!(shim.registry().get("a").is_some_and(|g| !g.enabled));
}

#[test]
fn exclusive_grammar_blocks_others() {
    let (control, _shim, _stub) = bound();
    control
        .load_grammar(GrammarSpec {
            exclusive: true,
            ..spec("solo")
        })
        .expect("load");
    control.load_grammar(spec("other")).expect("load");

    control.set_grammar_enabled("solo", true).expect("enable solo");
    assert!(matches!(
        control.set_grammar_enabled("other", true),
        Err(DrakeError::ExclusiveConflict { holder, .. }) if holder == "solo"
    ));

    control.set_grammar_enabled("solo", false).expect("disable solo");
    control.set_grammar_enabled("other", true).expect("enable other");
    assert!(matches!(
        control.set_grammar_enabled("solo", true),
        Err(DrakeError::ExclusiveConflict { holder, .. }) if holder == "other"
    ));
}

#[test]
fn racing_exclusive_enables_admit_exactly_one() {
    for _ in 0..50 {
        let (control, shim, stub) = bound();
        for name in ["left", "right"] {
            control
                .load_grammar(GrammarSpec {
                    exclusive: true,
                    ..spec(name)
                })
                .expect("load");
        }

        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|name| {
                let control = control.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    control.set_grammar_enabled(name, true)
                })
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let enabled: Vec<_> = ["left", "right"]
            .into_iter()
            .filter(|name| shim.registry().get(name).is_some_and(|g| g.enabled))
            .collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(stub.activations().len(), 1);
    }
}

#[test]
fn exclusive_flag_is_refused_while_sharing_the_engine() {
    let (control, shim, _stub) = bound();
    control.load_grammar(spec("a")).expect("load");
    control.load_grammar(spec("b")).expect("load");
    control.set_grammar_enabled("a", true).expect("enable a");
    control.set_grammar_enabled("b", true).expect("enable b");

    assert!(matches!(
        control.set_grammar_exclusive("a", true),
        Err(DrakeError::ExclusiveConflict { holder, .. }) if holder == "b"
    ));
    assert!(shim.registry().get("a").is_some_and(|g| !g.exclusive));

    control.set_grammar_enabled("b", false).expect("disable b");
    control.set_grammar_exclusive("a", true).expect("exclusive");
}

#[test]
fn unload_during_load_leaves_no_stray_phrase_callbacks() {
    let (control, shim, stub) = bound();
    let unloader = control.clone();
    stub.before_next_phrase_registration(move || {
        unloader.unload_grammar("a").expect("unload mid-load");
    });

    assert!(matches!(
        control.load_grammar(spec("a")),
        Err(DrakeError::GrammarNotFound(name)) if name == "a"
    ));
    assert!(shim.registry().get("a").is_none());
    assert_eq!(stub.phrase_registrations(), 0);
}

#[test]
fn unload_tears_down_and_is_not_found_afterwards() {
    let (control, shim, stub) = bound();
    control.load_grammar(spec("a")).expect("load");
    control.set_grammar_enabled("a", true).expect("enable");
    let handle = handle_of(&shim, "a");

    control.unload_grammar("a").expect("unload");

    assert!(stub.calls().contains(&StubCall::Destroy { grammar: handle }));
    assert_eq!(stub.phrase_registrations(), 0);
    assert!(matches!(
        control.unload_grammar("a"),
        Err(DrakeError::GrammarNotFound(_))
    ));
    assert_eq!(shim.registry().free_keys(), 1);
}

#[test]
fn phrase_callbacks_are_routed_by_grammar_key() {
    let (control, shim, stub) = bound();
    control.load_grammar(spec("commands")).expect("load");
    let handle = handle_of(&shim, "commands");
    let mut events = control.subscribe().expect("installed");

    stub.fire_grammar_phrase(handle, PhrasePhase::End, &["open".into(), "file".into()]);

    assert_eq!(
        events.try_recv(),
        Ok(ShimEvent::Phrase {
            grammar: "commands".into(),
            phase: PhrasePhase::End,
            words: vec!["open".into(), "file".into()],
        })
    );
}

#[test]
fn mimic_waits_for_deferred_completion() {
    let (control, _shim, stub) = bound();
    stub.set_mimic_mode(MimicMode::Deferred { success: true });
    control.mimic(&["hello".into()]).expect("mimic succeeds");

    stub.set_mimic_mode(MimicMode::Deferred { success: false });
    assert!(matches!(
        control.mimic(&["hello".into()]),
        Err(DrakeError::MimicFailed)
    ));
}

#[test]
fn mimic_times_out_when_completion_is_dropped() {
    let (control, _shim, stub) = bound();
    stub.set_mimic_mode(MimicMode::Dropped);
    assert!(matches!(
        control.mimic(&["hello".into()]),
        Err(DrakeError::MimicTimeout(_))
    ));
}

#[test]
fn priority_and_list_go_straight_to_the_engine() {
    let (control, shim, stub) = bound();
    control.load_grammar(spec("a")).expect("load");
    let handle = handle_of(&shim, "a");

    control.set_grammar_priority("a", 7).expect("priority");
    control.set_grammar_list("a", "names", b"alice\0bob").expect("list");
    control.set_grammar_appname("a", "mail").expect("appname");

    let grammar = shim.registry().get("a").expect("registered");
    assert_eq!(grammar.priority, 7);
    assert_eq!(grammar.appname.as_deref(), Some("mail"));
    assert!(stub.calls().contains(&StubCall::SetList {
        grammar: handle,
        name: "names".into(),
        len: 9,
    }));
}
