//! Checks that published checkpoint metadata agrees with the dataset length
//! table. Every mismatch is collected; a run fails once with all of them.

use crate::hub::{FetchError, MetadataSource, RemoteConfig, RemoteTokenizerMeta};
use crate::lengths::{
    checkpoint_id, DatasetLengthSpec, DatasetLengths, PEGASUS_PREFIX, TASK_PARAMS_PREFIX,
};
use log::{debug, warn};
use serde_json::Value;
use std::fmt;

const LOG_TARGET: &str = "consistency";

#[derive(thiserror::Error, Debug)]
pub enum CheckError {
    #[error("The following configs have unexpected settings: {0}")]
    Inconsistent(FailureReport),
    #[error("🐔 {what}: expected {expected}, got {actual}")]
    Mismatch {
        what: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CheckError {
    pub fn mismatch<T: fmt::Debug>(what: &str, expected: T, actual: T) -> Self {
        CheckError::Mismatch {
            what: what.to_string(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FailureReport {
    lines: Vec<String>,
}

impl FailureReport {
    pub fn push(&mut self, line: String) {
        warn!(target: LOG_TARGET, "{}", line);
        self.lines.push(line);
    }

    pub fn extend(&mut self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            self.push(line);
        }
    }

    /// Takes over lines another report already logged.
    pub fn append(&mut self, other: FailureReport) {
        self.lines.extend(other.lines);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_result(self) -> Result<(), CheckError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CheckError::Inconsistent(self))
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lines.join("\n"))
    }
}

/// What one checkpoint reported, next to the lines it contributed.
#[derive(Debug, Clone)]
pub struct DatasetOutcome {
    pub dataset: String,
    pub checkpoint: String,
    pub config: RemoteConfig,
    pub tokenizer: RemoteTokenizerMeta,
    pub failures: Vec<String>,
}

impl DatasetOutcome {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ConfigConsistencyCheck<'a, S: MetadataSource> {
    source: &'a S,
    lengths: &'a DatasetLengthSpec,
    prefix: String,
}

impl<'a, S: MetadataSource> ConfigConsistencyCheck<'a, S> {
    pub fn new(source: &'a S, lengths: &'a DatasetLengthSpec) -> Self {
        Self {
            source,
            lengths,
            prefix: PEGASUS_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Fetches and compares a single dataset's checkpoint.
    pub fn inspect(&self, expected: &DatasetLengths) -> Result<DatasetOutcome, FetchError> {
        let id = checkpoint_id(&self.prefix, &expected.name);
        debug!(target: LOG_TARGET, "checking {}", id);
        let mut failures = vec![];

        let config = self.source.fetch_config(&id)?;
        if config.max_length != expected.max_gen_length {
            failures.push(format!(
                "config for {} had max_length: {}, expected {}",
                id, config.max_length, expected.max_gen_length
            ));
        }

        // fewer positions than inputs fault on indexing once generation reaches the end
        if config.max_position_embeddings < expected.max_model_length {
            failures.push(format!(
                "config for {} had max_position_embeddings: {}, expected {}",
                id, config.max_position_embeddings, expected.max_model_length
            ));
        }

        let tokenizer = self.source.fetch_tokenizer(&id)?;
        if tokenizer.model_max_length != expected.max_model_length {
            failures.push(format!(
                "tokenizer for {} had model_max_length: {}, expected {}",
                id, tokenizer.model_max_length, expected.max_model_length
            ));
        }

        Ok(DatasetOutcome {
            dataset: expected.name.clone(),
            checkpoint: id,
            config,
            tokenizer,
            failures,
        })
    }

    pub fn collect_with<F>(&self, mut on_outcome: F) -> Result<FailureReport, CheckError>
    where
        F: FnMut(&DatasetOutcome),
    {
        let mut report = FailureReport::default();
        for expected in self.lengths.iter() {
            let outcome = self.inspect(expected)?;
            on_outcome(&outcome);
            report.extend(outcome.failures);
        }
        Ok(report)
    }

    pub fn collect(&self) -> Result<FailureReport, CheckError> {
        self.collect_with(|_| {})
    }

    pub fn run(&self) -> Result<(), CheckError> {
        self.collect()?.into_result()
    }

    /// Compares the `task_specific_params` a base checkpoint publishes with
    /// the table.
    pub fn collect_task_params(&self, id: &str) -> Result<FailureReport, CheckError> {
        let mut report = FailureReport::default();
        let config = self.source.fetch_config(id)?;

        let Some(params) = config.task_specific_params else {
            report.push(format!("config for {id} has no task_specific_params"));
            return Ok(report);
        };

        for expected in self.lengths.iter() {
            let key = format!("{TASK_PARAMS_PREFIX}{}", expected.name);
            let Some(entry) = params.get(&key) else {
                report.push(format!("task_specific_params for {id} missing {key}"));
                continue;
            };

            let max_length = entry.get("max_length").and_then(Value::as_u64);
            if max_length != Some(expected.max_gen_length as u64) {
                report.push(format!(
                    "task_specific_params {} for {} had max_length: {}, expected {}",
                    key,
                    id,
                    describe(entry.get("max_length")),
                    expected.max_gen_length
                ));
            }

            let positions = entry.get("max_position_embeddings").and_then(Value::as_u64);
            if positions != Some(expected.max_model_length as u64) {
                report.push(format!(
                    "task_specific_params {} for {} had max_position_embeddings: {}, expected {}",
                    key,
                    id,
                    describe(entry.get("max_position_embeddings")),
                    expected.max_model_length
                ));
            }

            let penalty = entry.get("length_penalty").and_then(Value::as_f64);
            let penalty_matches =
                penalty.is_some_and(|p| (p - expected.length_penalty).abs() < 1e-9);
            if !penalty_matches {
                report.push(format!(
                    "task_specific_params {} for {} had length_penalty: {}, expected {}",
                    key,
                    id,
                    describe(entry.get("length_penalty")),
                    expected.length_penalty
                ));
            }
        }

        Ok(report)
    }

    pub fn run_task_params(&self, id: &str) -> Result<(), CheckError> {
        self.collect_task_params(id)?.into_result()
    }
}

fn describe(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "missing".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeHub {
        configs: HashMap<String, RemoteConfig>,
        tokenizers: HashMap<String, RemoteTokenizerMeta>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeHub {
        fn with(mut self, id: &str, max_length: usize, positions: usize, model_max: usize) -> Self {
            self.configs.insert(id.to_string(), config(max_length, positions));
            self.tokenizers.insert(
                id.to_string(),
                RemoteTokenizerMeta {
                    model_max_length: model_max,
                },
            );
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    fn config(max_length: usize, positions: usize) -> RemoteConfig {
        RemoteConfig {
            max_length,
            max_position_embeddings: positions,
            length_penalty: None,
            num_beams: None,
            task_specific_params: None,
        }
    }

    fn not_found(id: &str, file: &str) -> FetchError {
        FetchError::NotFound {
            id: id.to_string(),
            file: file.to_string(),
        }
    }

    impl MetadataSource for FakeHub {
        fn fetch_config(&self, id: &str) -> Result<RemoteConfig, FetchError> {
            self.calls.borrow_mut().push(format!("config:{id}"));
            self.configs
                .get(id)
                .cloned()
                .ok_or_else(|| not_found(id, "config.json"))
        }

        fn fetch_tokenizer(&self, id: &str) -> Result<RemoteTokenizerMeta, FetchError> {
            self.calls.borrow_mut().push(format!("tokenizer:{id}"));
            self.tokenizers
                .get(id)
                .cloned()
                .ok_or_else(|| not_found(id, "tokenizer_config.json"))
        }
    }

    fn xsum_and_gigaword() -> DatasetLengthSpec {
        DatasetLengthSpec::try_from(vec![
            DatasetLengths::new("xsum", 64, 512, 0.8),
            DatasetLengths::new("gigaword", 32, 128, 0.6),
        ])
        .expect("unique names")
    }

    #[test]
    fn test_all_consistent_passes() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let hub = FakeHub::default()
            .with("google/pegasus-xsum", 64, 1024, 512)
            .with("google/pegasus-gigaword", 32, 128, 128);
        let check = ConfigConsistencyCheck::new(&hub, &lengths);

        assert!(check.collect()?.is_empty());
        check.run()?;
        Ok(())
    }

    #[test]
    fn test_xsum_tokenizer_mismatch_is_one_line() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let hub = FakeHub::default()
            .with("google/pegasus-xsum", 64, 1024, 1024)
            .with("google/pegasus-gigaword", 32, 128, 128);
        let report = ConfigConsistencyCheck::new(&hub, &lengths).collect()?;

        assert_eq!(report.len(), 1);
        let line = &report.lines()[0];
        assert!(line.contains("xsum"));
        assert!(line.contains("1024"));
        assert!(line.contains("512"));
        Ok(())
    }

    #[test]
    fn test_positions_may_exceed_model_length() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let hub = FakeHub::default()
            .with("google/pegasus-xsum", 64, 512, 512)
            .with("google/pegasus-gigaword", 32, 4096, 128);
        assert!(ConfigConsistencyCheck::new(&hub, &lengths)
            .collect()?
            .is_empty());
        Ok(())
    }

    #[test]
    fn test_all_mismatches_reported_once() {
        let lengths = xsum_and_gigaword();
        let hub = FakeHub::default()
            .with("google/pegasus-xsum", 128, 256, 512)
            .with("google/pegasus-gigaword", 32, 128, 512);
        let err = ConfigConsistencyCheck::new(&hub, &lengths)
            .run()
            .unwrap_err();

        let CheckError::Inconsistent(report) = &err else {
            panic!("expected an aggregated failure, got {err:?}");
        };
        assert_eq!(
            report.lines(),
            &[
                "config for google/pegasus-xsum had max_length: 128, expected 64".to_string(),
                "config for google/pegasus-xsum had max_position_embeddings: 256, expected 512"
                    .to_string(),
                "tokenizer for google/pegasus-gigaword had model_max_length: 512, expected 128"
                    .to_string(),
            ]
        );

        let message = err.to_string();
        assert!(message.starts_with("The following configs have unexpected settings: "));
        assert!(message.contains("pegasus-xsum had max_length"));
        assert!(message.contains("\ntokenizer for google/pegasus-gigaword"));
    }

    #[test]
    fn test_fetch_error_aborts_immediately() {
        let lengths = xsum_and_gigaword();
        let hub = FakeHub::default().with("google/pegasus-gigaword", 99, 1, 1);
        let err = ConfigConsistencyCheck::new(&hub, &lengths)
            .run()
            .unwrap_err();

        assert!(matches!(err, CheckError::Fetch(ref e) if e.is_not_found()));
        assert_eq!(hub.calls(), vec!["config:google/pegasus-xsum".to_string()]);
    }

    #[test]
    fn test_fetch_order_per_dataset() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let hub = FakeHub::default()
            .with("acme/xsum", 64, 1024, 512)
            .with("acme/gigaword", 32, 128, 128);
        let mut seen = vec![];
        ConfigConsistencyCheck::new(&hub, &lengths)
            .with_prefix("acme/")
            .collect_with(|outcome| seen.push((outcome.checkpoint.clone(), outcome.passed())))?;

        assert_eq!(
            hub.calls(),
            vec![
                "config:acme/xsum".to_string(),
                "tokenizer:acme/xsum".to_string(),
                "config:acme/gigaword".to_string(),
                "tokenizer:acme/gigaword".to_string(),
            ]
        );
        assert_eq!(
            seen,
            vec![("acme/xsum".to_string(), true), ("acme/gigaword".to_string(), true)]
        );
        Ok(())
    }

    #[test]
    fn test_task_params_match_table() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let mut hub = FakeHub::default();
        let mut large = config(256, 1024);
        large.task_specific_params = Some(lengths.task_specific_params());
        hub.configs.insert("google/pegasus-large".to_string(), large);

        let check = ConfigConsistencyCheck::new(&hub, &lengths);
        check.run_task_params("google/pegasus-large")?;
        Ok(())
    }

    #[test]
    fn test_task_params_mismatches() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let mut hub = FakeHub::default();
        let mut large = config(256, 1024);
        let mut params = serde_json::Map::new();
        params.insert(
            "summarization_xsum".to_string(),
            json!({"max_length": 64, "max_position_embeddings": 1024, "length_penalty": 0.8}),
        );
        large.task_specific_params = Some(params);
        hub.configs.insert("google/pegasus-large".to_string(), large);

        let report = ConfigConsistencyCheck::new(&hub, &lengths)
            .collect_task_params("google/pegasus-large")?;
        assert_eq!(
            report.lines(),
            &[
                "task_specific_params summarization_xsum for google/pegasus-large had max_position_embeddings: 1024, expected 512".to_string(),
                "task_specific_params for google/pegasus-large missing summarization_gigaword".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_task_params_absent() -> anyhow::Result<()> {
        let lengths = xsum_and_gigaword();
        let mut hub = FakeHub::default();
        hub.configs
            .insert("google/pegasus-xsum".to_string(), config(64, 512));
        let report = ConfigConsistencyCheck::new(&hub, &lengths)
            .collect_task_params("google/pegasus-xsum")?;
        assert_eq!(report.len(), 1);
        Ok(())
    }

    #[test]
    fn test_append_keeps_order() {
        let mut report = FailureReport::default();
        report.push("config for a had max_length: 1, expected 2".to_string());
        let mut other = FailureReport::default();
        other.push("task_specific_params for b missing summarization_xsum".to_string());
        report.append(other);

        assert_eq!(report.len(), 2);
        assert!(report.lines()[1].contains("summarization_xsum"));
        assert!(FailureReport::default().into_result().is_ok());
    }

    #[test]
    fn test_mismatch_shows_both_values() {
        let err = CheckError::mismatch("input shape", (2, 421), (2, 400));
        assert_eq!(err.to_string(), "🐔 input shape: expected (2, 421), got (2, 400)");
    }
}
