pub mod config;
pub mod error;
pub mod exec;
pub mod matrix;
pub mod params;
pub mod store;

use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use config::{BenchConfig, PartitionOverride, PartitionSpec, Profile};
pub use error::{BenchError, Result};
pub use exec::{Invocation, ProcessExecutor, QueryExecutor, Tee};
pub use matrix::Combination;
pub use params::{host_parallelism, ParameterResolver};
pub use store::{scan_log_tree, CacheState, FsResultStore, ResultKey, ResultStore, TreeScan};

/// A combination with everything needed to run it, resolved up front.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub profile: String,
    pub combination: Combination,
    pub partitions: u32,
    pub invocation: Invocation,
}

impl PlannedRun {
    pub fn key(&self) -> ResultKey {
        ResultKey::for_combination(&self.combination)
    }
}

/// The full matrix across all profiles, in execution order.
#[derive(Debug, Clone)]
pub struct Plan {
    pub marker: String,
    pub log_root: PathBuf,
    pub runs: Vec<PlannedRun>,
}

impl Plan {
    pub fn build(config: &BenchConfig) -> Result<Self> {
        Self::build_with_parallelism(config, host_parallelism())
    }

    /// Enumerates every profile and resolves every parameter before anything
    /// runs, so configuration errors surface with no side effects.
    pub fn build_with_parallelism(config: &BenchConfig, host_parallelism: u32) -> Result<Self> {
        let mut runs = Vec::new();
        for profile in &config.profiles {
            let resolver = ParameterResolver::for_profile(profile, host_parallelism)?;
            debug!(
                profile = %profile.name,
                default_partitions = resolver.default_partitions(),
                "resolved parameter default"
            );
            for combination in matrix::enumerate(profile)? {
                let partitions = resolver.resolve(&combination)?;
                let invocation = Invocation::build(config, profile, &combination, partitions);
                if let Some(script) = &invocation.script {
                    if !script.exists() {
                        // launch failure is recorded per combination at run time
                        warn!(
                            combination = %combination,
                            script = %script.display(),
                            "query program not found"
                        );
                    }
                }
                runs.push(PlannedRun {
                    profile: profile.name.clone(),
                    combination,
                    partitions,
                    invocation,
                });
            }
        }
        Ok(Self {
            marker: config.marker.clone(),
            log_root: config.log_root.clone(),
            runs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellOutcome {
    /// Canonical log already present; nothing executed.
    Skipped,
    Committed,
    /// Marker absent or program not started; staged output kept for retry.
    Failed,
}

impl CellOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellOutcome::Skipped => "skipped",
            CellOutcome::Committed => "committed",
            CellOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellReport {
    pub profile: String,
    pub mode: String,
    pub scale: u32,
    pub query: String,
    pub partitions: u32,
    pub outcome: CellOutcome,
    pub exit_code: Option<i32>,
    pub elapsed_ms: Option<u64>,
    /// Why the program could not be started, when it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cells: Vec<CellReport>,
}

impl RunReport {
    pub fn count(&self, outcome: CellOutcome) -> usize {
        self.cells.iter().filter(|c| c.outcome == outcome).count()
    }

    pub fn executed(&self) -> usize {
        self.cells.len() - self.count(CellOutcome::Skipped)
    }
}

/// Runs every planned combination in order against the given backend.
///
/// A run whose output lacks the marker, or whose program cannot be started, is
/// recorded as failed and the loop moves on. Store errors abort the matrix.
pub fn run_plan<S, E>(
    plan: &Plan,
    store: &mut S,
    executor: &mut E,
    console: &mut dyn Write,
) -> Result<RunReport>
where
    S: ResultStore + ?Sized,
    E: QueryExecutor + ?Sized,
{
    let started_at = Utc::now();
    let mut cells = Vec::with_capacity(plan.runs.len());
    for run in &plan.runs {
        cells.push(run_cell(run, &plan.marker, store, executor, console)?);
    }
    let report = RunReport {
        started_at,
        finished_at: Utc::now(),
        cells,
    };
    info!(
        total = report.cells.len(),
        committed = report.count(CellOutcome::Committed),
        failed = report.count(CellOutcome::Failed),
        skipped = report.count(CellOutcome::Skipped),
        "matrix finished"
    );
    Ok(report)
}

fn run_cell<S, E>(
    run: &PlannedRun,
    marker: &str,
    store: &mut S,
    executor: &mut E,
    console: &mut dyn Write,
) -> Result<CellReport>
where
    S: ResultStore + ?Sized,
    E: QueryExecutor + ?Sized,
{
    let key = run.key();
    let mut cell = CellReport {
        profile: run.profile.clone(),
        mode: key.mode.clone(),
        scale: key.scale,
        query: key.query.clone(),
        partitions: run.partitions,
        outcome: CellOutcome::Skipped,
        exit_code: None,
        elapsed_ms: None,
        launch_error: None,
    };

    store.prepare(&key)?;
    if store.is_committed(&key)? {
        info!(combination = %key, "skipping: result log already exists");
        return Ok(cell);
    }

    info!(
        combination = %key,
        profile = %run.profile,
        partitions = run.partitions,
        "running"
    );
    debug!(command = %run.invocation, "resolved command");
    let started = Instant::now();
    let exit_code = {
        let staged = store.begin_stage(&key)?;
        let mut tee = Tee::new(staged, &mut *console);
        let code = match executor.execute(&run.invocation, &mut tee) {
            Ok(code) => code,
            Err(err @ BenchError::Spawn { .. }) => {
                let text = err.to_string();
                writeln!(tee, "spatialbench: {}", text)
                    .map_err(|e| BenchError::io(store.staged_location(&key), e))?;
                cell.launch_error = Some(text);
                None
            }
            Err(err) => return Err(err),
        };
        tee.flush()
            .map_err(|e| BenchError::io(store.staged_location(&key), e))?;
        code
    };
    cell.exit_code = exit_code;
    cell.elapsed_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

    if let Some(error) = &cell.launch_error {
        warn!(
            combination = %key,
            error = %error,
            staged = %store.staged_location(&key),
            "query program failed to start; staged output kept for retry"
        );
        cell.outcome = CellOutcome::Failed;
        return Ok(cell);
    }

    if store.staged_contains(&key, marker)? {
        store.commit(&key)?;
        if exit_code != Some(0) {
            // marker-only contract: the exit code never blocks a commit
            warn!(
                combination = %key,
                exit_code = ?exit_code,
                "committed despite non-zero exit status"
            );
        }
        info!(combination = %key, elapsed_ms = ?cell.elapsed_ms, "committed");
        cell.outcome = CellOutcome::Committed;
    } else {
        warn!(
            combination = %key,
            exit_code = ?exit_code,
            staged = %store.staged_location(&key),
            "success marker not found; staged output kept for retry"
        );
        cell.outcome = CellOutcome::Failed;
    }
    Ok(cell)
}

/// Runs the whole configured matrix against the filesystem, relaying program
/// output to stdout.
pub fn run_config(config: &BenchConfig) -> Result<RunReport> {
    let plan = Plan::build(config)?;
    let mut store = FsResultStore::new(&config.log_root);
    let mut stdout = std::io::stdout();
    run_plan(&plan, &mut store, &mut ProcessExecutor, &mut stdout)
}

#[derive(Debug, Clone, Serialize)]
pub struct CellStatus {
    pub profile: String,
    #[serde(flatten)]
    pub combination: Combination,
    pub partitions: u32,
    pub state: CacheState,
    pub command: String,
}

/// Cache state of every planned combination. Read-only.
pub fn inspect_plan<S>(plan: &Plan, store: &S) -> Result<Vec<CellStatus>>
where
    S: ResultStore + ?Sized,
{
    plan.runs
        .iter()
        .map(|run| {
            Ok(CellStatus {
                profile: run.profile.clone(),
                combination: run.combination.clone(),
                partitions: run.partitions,
                state: store.state(&run.key())?,
                command: run.invocation.to_string(),
            })
        })
        .collect()
}
