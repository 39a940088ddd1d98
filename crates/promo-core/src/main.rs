use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use promo_core::prelude::*;
use promo_core::{build_plan, DistributionConfig, SnapshotValidator};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Local stand-in for the two environments
#[derive(Debug, Deserialize)]
struct StateFile {
    primary: DistributionConfig,
    staging: DistributionConfig,
    deployment_policy_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new("promo")
        .version(promo_core::VERSION)
        .about("Staged, gated promotion of a staging distribution onto a primary distribution")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("plan")
                .about("Print the wave plan for a pipeline config")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("validate-snapshot")
                .about("Check a configuration snapshot against the schema")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("JSON snapshot to validate"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run the pipeline end to end against an in-memory control API")
                .arg(config_arg())
                .arg(
                    Arg::new("state")
                        .long("state")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("JSON file with primary, staging and deployment_policy_id"),
                )
                .arg(
                    Arg::new("decision")
                        .long("decision")
                        .default_value("approve")
                        .value_parser(["approve", "reject", "cancel"])
                        .help("What the operator does at the approval gate"),
                )
                .arg(
                    Arg::new("actor")
                        .long("actor")
                        .default_value("operator")
                        .help("Operator recorded in the audit log"),
                )
                .arg(
                    Arg::new("justification")
                        .long("justification")
                        .help("Free-text reason recorded with the decision"),
                ),
        );

    let matches = cli.get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("plan", args)) => {
            let config = load_config(args)?;
            print!("{}", build_plan(&config)?.render());
        }
        Some(("validate-snapshot", args)) => {
            let path = required_path(args, "file")?;
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let snapshot: serde_json::Value =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            let config = SnapshotValidator::new()?.validate(&snapshot)?;
            println!("snapshot for {} is valid", config.id);
        }
        Some(("run", args)) => run(args).await?,
        _ => bail!("unknown subcommand"),
    }
    Ok(())
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_parser(clap::value_parser!(PathBuf))
        .help("Pipeline config (TOML); defaults apply when omitted")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> Result<PipelineConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn required_path(args: &ArgMatches, name: &str) -> Result<PathBuf> {
    args.get_one::<PathBuf>(name)
        .cloned()
        .with_context(|| format!("--{name} is required"))
}

async fn run(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let state_path = required_path(args, "state")?;
    let raw = std::fs::read_to_string(&state_path)
        .with_context(|| format!("reading {}", state_path.display()))?;
    let state: StateFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", state_path.display()))?;

    let control = Arc::new(InMemoryControl::new());
    let primary_id = state.primary.id.clone();
    let names = config.export_names();
    let exports = ExportRegistry::new();
    exports.publish(names.primary_distribution_id, primary_id.as_str())?;
    exports.publish(names.staging_distribution_id, state.staging.id.as_str())?;
    exports.publish(names.deployment_policy_id, state.deployment_policy_id)?;
    control.insert(state.primary);
    control.insert(state.staging);

    let service = StateMachineService::new(
        config.state_machine_name.clone(),
        Arc::clone(&control),
        RetryPolicy::new(config.retry.clone()),
        Arc::new(AuditLog::new()),
    );
    let continuous = config.continuous_deployment;
    let pipeline = Arc::new(PromotionPipeline::new(config, &exports, service)?);
    let outputs = pipeline.collect_staging_outputs(&exports).await?;
    let run = pipeline.start(outputs)?;

    let report = if continuous {
        let gate = pipeline.gate(run)?;
        tokio::select! {
            report = pipeline.wait(run) => report?,
            _ = gate.wait_until_open() => {
                let actor = args
                    .get_one::<String>("actor")
                    .map(String::as_str)
                    .unwrap_or("operator");
                let justification = args.get_one::<String>("justification").cloned();
                match args.get_one::<String>("decision").map(String::as_str) {
                    Some("reject") => pipeline.reject(run, actor, justification)?,
                    Some("cancel") => pipeline.cancel(run, actor)?,
                    _ => pipeline.approve(run, actor, justification)?,
                }
                pipeline.wait(run).await?
            }
        }
    } else {
        pipeline.wait(run).await?
    };

    let output = serde_json::json!({
        "report": report,
        "primary": control.current(&primary_id).map(|v| v.config),
        "audit_events": pipeline.service().audit().len(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if report.status == PipelineStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
