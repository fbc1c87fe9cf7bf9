use anyhow::Result;
use bench_runner::{
    inspect_plan, scan_log_tree, BenchConfig, CacheState, CellOutcome, FsResultStore, Plan,
    RunReport,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "spatialbench",
    version,
    about = "Idempotent benchmark matrix runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every combination that has no result log yet.
    Run {
        #[arg(long, default_value = bench_runner::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved matrix without running anything.
    Describe {
        #[arg(long, default_value = bench_runner::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List committed logs and orphaned staged output under the log root.
    Status {
        #[arg(long, default_value = bench_runner::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    // no subcommand runs the whole matrix with the default config
    let command = cli.command.unwrap_or(Commands::Run {
        config: PathBuf::from(bench_runner::config::DEFAULT_CONFIG_FILE),
        json: false,
    });
    let json_mode = command_json_mode(&command);
    match run_command(command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<bench_runner::BenchError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let cfg = load_config(&config)?;
            let report = bench_runner::run_config(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "log_root": cfg.log_root.display().to_string(),
                    "report": serde_json::to_value(&report)?,
                    "counts": report_counts(&report),
                })));
            }
            print_report(&cfg, &report);
        }
        Commands::Describe { config, json } => {
            let cfg = load_config(&config)?;
            let plan = Plan::build(&cfg)?;
            let store = FsResultStore::new(&cfg.log_root);
            let cells = inspect_plan(&plan, &store)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "dataset_root": cfg.dataset_root.display().to_string(),
                    "log_root": cfg.log_root.display().to_string(),
                    "marker": cfg.marker,
                    "host_parallelism": bench_runner::host_parallelism(),
                    "cells": serde_json::to_value(&cells)?,
                })));
            }
            println!("dataset_root: {}", cfg.dataset_root.display());
            println!("log_root: {}", cfg.log_root.display());
            println!("marker: {:?}", cfg.marker);
            println!("host_parallelism: {}", bench_runner::host_parallelism());
            println!("combinations: {}", cells.len());
            for cell in &cells {
                println!(
                    "{:<10} {:<24} partitions={:<4} {}",
                    cell.state.as_str(),
                    format!("{}", cell.combination),
                    cell.partitions,
                    cell.command
                );
            }
            let pending = cells
                .iter()
                .filter(|c| c.state != CacheState::Committed)
                .count();
            println!("to_run: {}", pending);
        }
        Commands::Status { config, json } => {
            let cfg = load_config(&config)?;
            let scan = scan_log_tree(&cfg.log_root)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "log_root": cfg.log_root.display().to_string(),
                    "committed": scan.committed.iter().map(|p| display_rel(&cfg.log_root, p)).collect::<Vec<_>>(),
                    "orphaned": scan.orphaned.iter().map(|p| display_rel(&cfg.log_root, p)).collect::<Vec<_>>(),
                })));
            }
            println!("log_root: {}", cfg.log_root.display());
            println!("committed: {}", scan.committed.len());
            println!("orphaned: {}", scan.orphaned.len());
            for p in &scan.orphaned {
                println!("  {}", display_rel(&cfg.log_root, p));
            }
        }
    }
    Ok(None)
}

fn load_config(path: &Path) -> Result<BenchConfig> {
    let cfg = BenchConfig::load(path)?;
    tracing::debug!(config = %path.display(), profiles = cfg.profiles.len(), "loaded config");
    Ok(cfg)
}

fn display_rel(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn report_counts(report: &RunReport) -> Value {
    json!({
        "total": report.cells.len(),
        "committed": report.count(CellOutcome::Committed),
        "failed": report.count(CellOutcome::Failed),
        "skipped": report.count(CellOutcome::Skipped),
    })
}

fn print_report(cfg: &BenchConfig, report: &RunReport) {
    println!("log_root: {}", cfg.log_root.display());
    println!("total: {}", report.cells.len());
    println!("committed: {}", report.count(CellOutcome::Committed));
    println!("failed: {}", report.count(CellOutcome::Failed));
    println!("skipped: {}", report.count(CellOutcome::Skipped));
    for cell in report
        .cells
        .iter()
        .filter(|c| c.outcome == CellOutcome::Failed)
    {
        let status = match (&cell.launch_error, cell.exit_code) {
            (Some(err), _) => format!("not started ({})", err),
            (None, Some(code)) => format!("exit={}", code),
            (None, None) => "exit=signal".to_string(),
        };
        println!(
            "failed: {}/sf_{}/{} {}",
            cell.mode, cell.scale, cell.query, status
        );
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_means_run_everything() {
        let cli = Cli::try_parse_from(["spatialbench"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn subcommands_accept_config_and_json() {
        let cli = Cli::try_parse_from(["spatialbench", "describe", "--config", "x.yaml", "--json"])
            .expect("parse");
        match cli.command {
            Some(Commands::Describe { config, json }) => {
                assert_eq!(config, PathBuf::from("x.yaml"));
                assert!(json);
            }
            _ => panic!("expected describe"),
        }
        let cli = Cli::try_parse_from(["spatialbench", "status"]).expect("parse");
        match cli.command {
            Some(Commands::Status { config, json }) => {
                assert_eq!(config, PathBuf::from("bench.yaml"));
                assert!(!json);
            }
            _ => panic!("expected status"),
        }
    }

    #[test]
    fn json_error_shape() {
        let v = json_error("config_error", "bad".to_string(), json!({}));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("config_error"));
    }
}
