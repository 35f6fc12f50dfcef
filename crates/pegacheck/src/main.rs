use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use pegacheck_core::config::CheckSettings;
use pegacheck_core::consistency::{CheckError, ConfigConsistencyCheck, DatasetOutcome};
use pegacheck_core::hub::{HubClient, UNBOUNDED_LENGTH};
use pegacheck_core::lengths::DatasetLengthSpec;
use pegacheck_core::seq2seq::{Seq2SeqModel, Seq2SeqSpec, DEFAULT_CHECKPOINT};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "pegacheck")]
#[command(about = "Checks published Pegasus checkpoints against their dataset settings")]
#[command(version)]
struct Cli {
    /// Log level: debug, info, warn or error
    #[arg(long, global = true)]
    log: Option<String>,

    /// Only log this target, e.g. `hub` or `consistency`
    #[arg(long, global = true)]
    log_target: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare every checkpoint's config and tokenizer with the length table
    CheckConfigs {
        /// YAML or JSON settings file, local path or URL
        #[arg(long)]
        config: Option<String>,

        /// Checkpoint id prefix, `google/pegasus-` by default
        #[arg(long)]
        prefix: Option<String>,

        /// YAML or JSON dataset length table replacing the built-in one
        #[arg(long)]
        lengths: Option<String>,

        /// Also check `task_specific_params` of the large checkpoint
        #[arg(long)]
        task_params: bool,
    },
    /// Summarize texts with a Pegasus checkpoint
    Summarize {
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        model: String,

        /// cpu, cuda, cuda:N or metal
        #[arg(long)]
        device: Option<String>,

        /// Load the weights in half precision
        #[arg(long)]
        f16: bool,

        /// Truncate inputs to this many tokens
        #[arg(long)]
        max_input_length: Option<usize>,

        #[arg(required = true)]
        texts: Vec<String>,
    },
}

fn init_logging(level: Option<&str>, target: Option<&str>) {
    let level = match level {
        Some("debug") => log::LevelFilter::Debug,
        Some("info") => log::LevelFilter::Info,
        Some("warn") => log::LevelFilter::Warn,
        Some("error") => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::builder().filter(target, level).init();
}

fn length_cell(value: usize) -> String {
    if value == UNBOUNDED_LENGTH {
        "unbounded".to_string()
    } else {
        value.to_string()
    }
}

fn outcome_row(outcome: &DatasetOutcome) -> Vec<Cell> {
    let status = if outcome.passed() {
        Cell::new("ok").fg(Color::Green)
    } else {
        Cell::new(outcome.failures.join("\n")).fg(Color::Red)
    };
    vec![
        Cell::new(&outcome.checkpoint),
        Cell::new(outcome.config.max_length),
        Cell::new(outcome.config.max_position_embeddings),
        Cell::new(length_cell(outcome.tokenizer.model_max_length)),
        status,
    ]
}

fn check_configs(
    config: Option<String>,
    prefix: Option<String>,
    lengths: Option<String>,
    task_params: bool,
) -> Result<ExitCode> {
    let mut settings = match &config {
        Some(path) => CheckSettings::load(path)?,
        None => CheckSettings::default(),
    };
    if let Some(prefix) = prefix {
        settings.prefix = prefix;
    }

    let lengths = match &lengths {
        Some(path) => DatasetLengthSpec::from_file(path)?,
        None => settings.lengths(),
    };
    let client = HubClient::from_settings(&settings);
    let check = ConfigConsistencyCheck::new(&client, &lengths).with_prefix(&settings.prefix);
    info!(target: "pegacheck", "checking {} checkpoints under {}", lengths.len(), settings.prefix);

    let bar = ProgressBar::new(lengths.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ({pos}/{len}) {msg}",
        )?
        .progress_chars("#>-"),
    );

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "checkpoint",
            "max_length",
            "max_position_embeddings",
            "model_max_length",
            "status",
        ]);

    let mut report = check.collect_with(|outcome| {
        bar.set_message(outcome.checkpoint.clone());
        table.add_row(outcome_row(outcome));
        bar.inc(1);
    })?;
    bar.finish_and_clear();

    if task_params {
        let params = check.collect_task_params(&settings.large_checkpoint)?;
        report.append(params);
    }

    println!("{table}");
    if report.is_empty() {
        println!("{}", style("all checkpoints are consistent").green());
        return Ok(ExitCode::SUCCESS);
    }
    eprintln!("{}", style(CheckError::Inconsistent(report)).red());
    Ok(ExitCode::FAILURE)
}

fn summarize(
    model: String,
    device: Option<String>,
    f16: bool,
    max_input_length: Option<usize>,
    texts: Vec<String>,
) -> Result<ExitCode> {
    let spec = Seq2SeqSpec {
        device,
        dtype: f16.then(|| "f16".to_string()),
        ..Seq2SeqSpec::new(&model, &model)
    };
    let instance = Seq2SeqModel::lazy(spec)?;
    let guard = instance
        .lock()
        .map_err(|e| anyhow!("🐔 lock error: {:?}", e))?;

    let summaries = guard.summarize(&texts, max_input_length)?;
    for summary in summaries {
        println!("{} {}", style("▶").cyan(), summary);
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref(), cli.log_target.as_deref());

    match cli.command {
        Command::CheckConfigs {
            config,
            prefix,
            lengths,
            task_params,
        } => check_configs(config, prefix, lengths, task_params),
        Command::Summarize {
            model,
            device,
            f16,
            max_input_length,
            texts,
        } => summarize(model, device, f16, max_input_length, texts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_configs() {
        let cli = Cli::parse_from(["pegacheck", "--log", "debug", "check-configs", "--task-params"]);
        assert_eq!(cli.log.as_deref(), Some("debug"));
        match cli.command {
            Command::CheckConfigs {
                config,
                prefix,
                lengths,
                task_params,
            } => {
                assert!(config.is_none());
                assert!(prefix.is_none());
                assert!(lengths.is_none());
                assert!(task_params);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_custom_lengths() {
        let cli = Cli::parse_from(["pegacheck", "check-configs", "--lengths", "table.yaml"]);
        match cli.command {
            Command::CheckConfigs { lengths, .. } => {
                assert_eq!(lengths.as_deref(), Some("table.yaml"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_summarize_defaults() {
        let cli = Cli::parse_from(["pegacheck", "summarize", "some text"]);
        match cli.command {
            Command::Summarize {
                model, f16, texts, ..
            } => {
                assert_eq!(model, DEFAULT_CHECKPOINT);
                assert!(!f16);
                assert_eq!(texts, vec!["some text".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_summarize_requires_text() {
        assert!(Cli::try_parse_from(["pegacheck", "summarize"]).is_err());
    }

    #[test]
    fn test_length_cell() {
        assert_eq!(length_cell(512), "512");
        assert_eq!(length_cell(UNBOUNDED_LENGTH), "unbounded");
    }
}
