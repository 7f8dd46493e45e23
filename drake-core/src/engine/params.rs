//! Baseline engine tuning.
//!
//! Parameters are written through the engine's own get/set/destroy trio.
//! The table is fixed; only the two phrase timeouts and any extra pairs come
//! from `ShimConfig`.

use tracing::{debug, warn};

use crate::{
    config::ShimConfig,
    engine::EngineApi,
    error::{check, DrakeError, Result},
    handle::EngineHandle,
};

/// Fixed parameters applied after the two timeouts, in order.
pub const BASELINE_PARAMS: &[(&str, &str)] = &[
    ("DemonThreadPhraseFinishWait", "0"),
    ("NumWordsAvailable", "10000"),
    ("UseParallelRecognizers", "1"),
    ("Pass1A_DurationThresh_ms", "50"),
    ("ExtraDictationWords", "10000"),
    ("MaxCFGWords", "20000"),
    ("MaxPronGuessedWords", "20000"),
    ("PhraseHypothesisCallbackThread", "1"),
];

/// Full ordered key/value list for `config`.
pub fn baseline_table(config: &ShimConfig) -> Vec<(String, String)> {
    let mut table = Vec::with_capacity(BASELINE_PARAMS.len() + 2 + config.extra_params.len());
    table.push((
        "DwTimeOutComplete".to_string(),
        config.timeout_complete_ms.to_string(),
    ));
    table.push((
        "DwTimeOutIncomplete".to_string(),
        config.timeout_incomplete_ms.to_string(),
    ));
    table.extend(
        BASELINE_PARAMS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    table.extend(config.extra_params.iter().cloned());
    table
}

/// Write one string parameter. The param object is destroyed even when the
/// write fails.
pub fn set_param(
    api: &dyn EngineApi,
    engine: Option<EngineHandle>,
    key: &str,
    value: &str,
) -> Result<()> {
    let engine = engine.ok_or(DrakeError::NoEngine)?;
    let param = api
        .get_param(engine, key)
        .ok_or_else(|| DrakeError::UnknownParam(key.to_string()))?;
    let code = api.set_string_value(engine, param, value);
    api.destroy_param(engine, param);
    check("set-string-value", code)
}

/// Apply the whole table. Returns the number of writes that failed.
pub fn apply_baseline(api: &dyn EngineApi, engine: EngineHandle, config: &ShimConfig) -> usize {
    let mut failed = 0;
    for (key, value) in baseline_table(config) {
        match set_param(api, Some(engine), &key, &value) {
            Ok(()) => debug!(key = %key, value = %value, "engine param set"),
            Err(e) => {
                failed += 1;
                warn!(key = %key, "failed to set engine param: {e}");
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::{StubEngine, StubOp};

    fn engine() -> EngineHandle {
        EngineHandle::from_raw(0x100).expect("non-null")
    }

    #[test]
    fn table_starts_with_configured_timeouts() {
        let config = ShimConfig {
            timeout_complete_ms: 120,
            extra_params: vec![("ReturnNoise".into(), "1".into())],
            ..ShimConfig::default()
        };
        let table = baseline_table(&config);
        assert_eq!(table[0], ("DwTimeOutComplete".into(), "120".into()));
        assert_eq!(table[1], ("DwTimeOutIncomplete".into(), "500".into()));
        assert_eq!(table.len(), BASELINE_PARAMS.len() + 3);
        assert_eq!(table.last().map(|(k, _)| k.as_str()), Some("ReturnNoise"));
    }

    #[test]
    fn set_param_without_engine_is_rejected() {
        let stub = StubEngine::new();
        let err = set_param(&stub, None, "MaxCFGWords", "1").unwrap_err();
        assert!(matches!(err, DrakeError::NoEngine));
        assert!(stub.params().is_empty());
    }

    #[test]
    fn failed_write_still_destroys_the_param() {
        let stub = StubEngine::new();
        stub.fail(StubOp::SetStringValue, 7);
        let err = set_param(&stub, Some(engine()), "MaxCFGWords", "1").unwrap_err();
        assert!(matches!(err, DrakeError::Engine { code: 7, .. }));
        assert_eq!(stub.destroyed_params(), 1);
    }

    #[test]
    fn apply_counts_failures_and_keeps_going() {
        let stub = StubEngine::new();
        stub.reject_param("NumWordsAvailable");
        let config = ShimConfig::default();
        let failed = apply_baseline(&stub, engine(), &config);
        assert_eq!(failed, 1);
        assert_eq!(stub.params().len(), baseline_table(&config).len() - 1);
    }
}
