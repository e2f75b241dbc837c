//! Command-line entry point for the governance kernel

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use pgov_audit::{AuditLog, JsonlAuditStore};
use pgov_kernel::{logging, run_simulator, Scenario, SimulatorConfig};
use pgov_policy::GovernanceConfig;
use std::path::PathBuf;
use std::sync::Arc;

fn cli() -> Command {
    Command::new("pgov-kernel")
        .version(pgov_core::VERSION)
        .about("Content pipeline governance kernel")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Governance config (TOML); built-in defaults when omitted"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(Command::new("matrix").about("Print the effective permission matrix as JSON"))
        .subcommand(
            Command::new("check-config")
                .about("Validate a governance config file")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Path to the TOML file"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run seeded tasks through the governed pipeline")
                .arg(
                    Arg::new("tasks")
                        .long("tasks")
                        .default_value("100")
                        .value_parser(value_parser!(usize))
                        .help("Number of tasks to submit"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .default_value("mixed")
                        .help("mixed, clean, critic-reject, trespass, quota-overrun, fallback or cancel"),
                )
                .arg(
                    Arg::new("audit-log")
                        .long("audit-log")
                        .value_parser(value_parser!(PathBuf))
                        .help("Append the audit trail to this JSONL file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<GovernanceConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => GovernanceConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(GovernanceConfig::default()),
    }
}

async fn simulate(config: GovernanceConfig, args: &ArgMatches) -> Result<bool> {
    let tasks = args.get_one::<usize>("tasks").copied().unwrap_or(100);
    let seed = args.get_one::<u64>("seed").copied().unwrap_or(42);
    let scenario = match args.get_one::<String>("scenario").map(String::as_str) {
        None | Some("mixed") => None,
        Some(name) => Some(name.parse::<Scenario>().map_err(anyhow::Error::msg)?),
    };
    let audit = match args.get_one::<PathBuf>("audit-log") {
        Some(path) => AuditLog::new(Arc::new(
            JsonlAuditStore::open(path)
                .with_context(|| format!("opening audit log {}", path.display()))?,
        )),
        None => AuditLog::in_memory(),
    };

    let report = run_simulator(
        SimulatorConfig {
            seed,
            tasks,
            scenario,
            governance: config,
        },
        audit,
    )
    .await?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.generate_text());
    }
    Ok(report.passed())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    logging::init(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("matrix", args)) => {
            let matrix = load_config(args)?.matrix()?;
            println!("{}", serde_json::to_string_pretty(&matrix)?);
        }
        Some(("check-config", args)) => {
            let Some(path) = args.get_one::<PathBuf>("path") else {
                bail!("missing config path");
            };
            let config = GovernanceConfig::load(path)
                .with_context(|| format!("{} is not a valid governance config", path.display()))?;
            println!(
                "{}: ok ({} role override(s), stage timeout {}s, {} concurrent calls)",
                path.display(),
                config.roles.len(),
                config.pipeline.stage_timeout_secs,
                config.pipeline.max_concurrent_calls
            );
        }
        Some(("simulate", args)) => {
            let config = load_config(args)?;
            if !simulate(config, args).await? {
                std::process::exit(1);
            }
        }
        _ => {}
    }
    Ok(())
}
