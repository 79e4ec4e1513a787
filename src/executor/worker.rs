//! Worker driver
//!
//! Owns one subprocess: builds the runner command line, injects the
//! coordination environment, captures stdout/stderr, enforces the
//! per-process timeout and interprets the exit code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::plan::{Dispatch, DispatchItem};

use super::SpawnError;

pub const ENV_QUEUE_INDEX: &str = "PABOTQUEUEINDEX";
pub const ENV_LIB_URI: &str = "PABOTLIBURI";
pub const ENV_POOL_ID: &str = "PABOTEXECUTIONPOOLID";
pub const ENV_PROCESS_COUNT: &str = "PABOTNUMBEROFPROCESSES";
pub const ENV_CALLER_ID: &str = "CALLER_ID";

/// First still-running ping after 15 s, then a growing interval.
const FIRST_PING: Duration = Duration::from_secs(15);
const PING_GROWTH: Duration = Duration::from_secs(5);
/// Grace between the soft stop and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// How one worker subprocess ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    Passed,
    /// Runner completed with 1..=249 failing tests.
    Failed(i32),
    /// Exit code 250+ or termination by signal: the runner itself broke.
    RunnerError(Option<i32>),
    /// Killed after exceeding the per-process timeout.
    Timeout,
    /// Killed while draining a cancelled run.
    Cancelled,
}

impl WorkerOutcome {
    pub fn passed(self) -> bool {
        matches!(self, WorkerOutcome::Passed)
    }

    /// True when the runner ran to completion, passing or not.
    pub fn completed(self) -> bool {
        matches!(self, WorkerOutcome::Passed | WorkerOutcome::Failed(_))
    }
}

/// One queued execution: a dispatch bound to an argument-file variant.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub dispatch: Dispatch,
    /// Digits of the `--argumentfileN` flag, empty when none applies.
    pub argfile_index: String,
    pub argfile: Option<PathBuf>,
}

impl QueueItem {
    pub fn display_name(&self) -> String {
        match &self.argfile {
            Some(path) => format!("{} {{{}}}", self.dispatch.name(), path.display()),
            None => self.dispatch.name(),
        }
    }
}

/// Everything fixed across all workers of one run.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub command: Vec<String>,
    pub runner_args: Vec<String>,
    pub datasources: Vec<PathBuf>,
    pub results_dir: PathBuf,
    /// Coordination server URI, empty when disabled.
    pub lib_uri: String,
    pub processes: usize,
    pub verbose: bool,
    pub timeout: Option<Duration>,
}

/// Outcome and bookkeeping of one finished worker.
#[derive(Clone, Debug)]
pub struct WorkerResult {
    pub outcome: WorkerOutcome,
    pub elapsed: Duration,
    pub outs_dir: PathBuf,
}

/// Run one unit in a subprocess, honoring its startup sleep, the process
/// timeout and external cancellation.
pub async fn run_worker(
    ctx: &WorkerContext,
    item: &QueueItem,
    queue_index: usize,
    pool_id: usize,
    cancel: watch::Receiver<bool>,
) -> Result<WorkerResult, SpawnError> {
    let name = item.display_name();

    let sleep = item.dispatch.sleep();
    if sleep > 0 {
        info!("[{pool_id}] [ID:{queue_index}] SLEEPING {sleep} SECONDS BEFORE STARTING {name}");
        tokio::time::sleep(Duration::from_secs(sleep)).await;
    }

    let outs_dir = ctx
        .results_dir
        .join(&item.argfile_index)
        .join(queue_index.to_string());
    std::fs::create_dir_all(&outs_dir).map_err(|source| SpawnError {
        name: name.clone(),
        source,
    })?;

    let caller_id = Uuid::new_v4().simple().to_string();
    let mut command = build_command(ctx, item, &outs_dir, queue_index, pool_id, &caller_id)
        .map_err(|source| SpawnError {
            name: name.clone(),
            source,
        })?;

    let mut child = command.spawn().map_err(|source| SpawnError {
        name: name.clone(),
        source,
    })?;
    let pid = child.id();
    if ctx.verbose {
        info!(
            "[PID:{pid:?}] [{pool_id}] [ID:{queue_index}] EXECUTING PARALLEL {name} with command:\n{}",
            render_command(&command)
        );
    } else {
        info!("[PID:{pid:?}] [{pool_id}] [ID:{queue_index}] EXECUTING {name}");
    }

    let started = Instant::now();
    let deadline = ctx.timeout.map(|t| started + t);
    let mut next_ping = started + FIRST_PING;
    let mut ping_interval = FIRST_PING;

    let cancelled = cancelled(cancel);
    tokio::pin!(cancelled);

    let outcome = loop {
        let wake = match deadline {
            Some(deadline) => next_ping.min(deadline),
            None => next_ping,
        };
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => break interpret_exit(status.code()),
                    Err(err) => {
                        warn!("waiting on worker {name} failed: {err}");
                        break WorkerOutcome::RunnerError(None);
                    }
                }
            }
            _ = &mut cancelled => {
                warn!("[{pool_id}] [ID:{queue_index}] stopping {name}: run is draining");
                terminate(&mut child).await;
                break WorkerOutcome::Cancelled;
            }
            _ = tokio::time::sleep_until(wake) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(
                        "[{pool_id}] [ID:{queue_index}] process {name} killed after exceeding \
                         the timeout of {} seconds",
                        ctx.timeout.unwrap_or_default().as_secs()
                    );
                    terminate(&mut child).await;
                    break WorkerOutcome::Timeout;
                }
                let elapsed = started.elapsed().as_secs();
                info!("[PID:{pid:?}] [{pool_id}] [ID:{queue_index}] still running {name} after {elapsed} seconds");
                ping_interval += PING_GROWTH;
                next_ping += ping_interval;
            }
        }
    };

    let elapsed = started.elapsed();
    report(ctx, &name, queue_index, pool_id, outcome, elapsed, &outs_dir);
    Ok(WorkerResult {
        outcome,
        elapsed,
        outs_dir,
    })
}

fn build_command(
    ctx: &WorkerContext,
    item: &QueueItem,
    outs_dir: &Path,
    queue_index: usize,
    pool_id: usize,
    caller_id: &str,
) -> std::io::Result<Command> {
    let (program, base_args) = ctx
        .command
        .split_first()
        .expect("runner command is never empty");

    let outs_arg = outs_dir.to_string_lossy().into_owned();
    let mut command = Command::new(program);
    command.args(base_args);
    command.args([
        "--outputdir",
        outs_arg.as_str(),
        "--output",
        "output.xml",
        "--log",
        "NONE",
        "--report",
        "NONE",
        "--xunit",
        "NONE",
        "--consolecolors",
        "off",
    ]);
    match &item.dispatch.item {
        DispatchItem::Unit(unit) => {
            command.args([unit.kind.flag(), unit.name.as_str()]);
        }
        DispatchItem::Group(group) => {
            for member in &group.members {
                command.args([member.kind.flag(), member.name.as_str()]);
            }
        }
    }
    if let Some(argfile) = &item.argfile {
        let argfile = argfile.to_string_lossy().into_owned();
        command.args(["--argumentfile", argfile.as_str()]);
    }
    command.args(&ctx.runner_args);
    command.args(ctx.datasources.iter().map(|p| p.as_os_str()));

    command.env(ENV_QUEUE_INDEX, queue_index.to_string());
    command.env(ENV_LIB_URI, &ctx.lib_uri);
    command.env(ENV_POOL_ID, pool_id.to_string());
    command.env(ENV_PROCESS_COUNT, ctx.processes.to_string());
    command.env(ENV_CALLER_ID, caller_id);

    let stem = Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "runner".to_string());
    let stdout = std::fs::File::create(outs_dir.join(format!("{stem}_stdout.out")))?;
    let stderr = std::fs::File::create(outs_dir.join(format!("{stem}_stderr.out")))?;
    command.stdout(Stdio::from(stdout));
    command.stderr(Stdio::from(stderr));
    command.stdin(Stdio::null());
    command.kill_on_drop(true);
    Ok(command)
}

fn render_command(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn interpret_exit(code: Option<i32>) -> WorkerOutcome {
    match code {
        Some(0) => WorkerOutcome::Passed,
        Some(n @ 1..=249) => WorkerOutcome::Failed(n),
        Some(n) => WorkerOutcome::RunnerError(Some(n)),
        None => WorkerOutcome::RunnerError(None),
    }
}

/// Resolves once draining is requested; never resolves when the sender is
/// gone.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Soft-stop, wait for the grace period, then force-kill.
async fn terminate(child: &mut Child) {
    soft_stop(child);
    let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
    if graceful.is_err() {
        if let Err(err) = child.kill().await {
            warn!("force-killing worker failed: {err}");
        }
    }
}

#[cfg(unix)]
fn soft_stop(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn soft_stop(_child: &Child) {}

fn report(
    ctx: &WorkerContext,
    name: &str,
    queue_index: usize,
    pool_id: usize,
    outcome: WorkerOutcome,
    elapsed: Duration,
    outs_dir: &Path,
) {
    let secs = elapsed.as_secs_f64();
    match outcome {
        WorkerOutcome::Passed => {
            info!("[{pool_id}] [ID:{queue_index}] PASSED {name} in {secs:.1} seconds");
        }
        WorkerOutcome::Failed(failures) => {
            if ctx.verbose {
                info!(
                    "[{pool_id}] [ID:{queue_index}] Execution failed in {name} with {failures} failing test(s)\n{}\n{}",
                    captured(outs_dir, "stdout"),
                    captured(outs_dir, "stderr"),
                );
            } else {
                info!("[{pool_id}] [ID:{queue_index}] FAILED {name}");
            }
        }
        WorkerOutcome::RunnerError(code) => {
            warn!(
                "[{pool_id}] [ID:{queue_index}] RUNNER ERROR in {name} (exit {code:?})\n{}",
                captured(outs_dir, "stderr"),
            );
        }
        WorkerOutcome::Timeout => {
            warn!("[{pool_id}] [ID:{queue_index}] TIMEOUT {name} after {secs:.1} seconds");
        }
        WorkerOutcome::Cancelled => {
            warn!("[{pool_id}] [ID:{queue_index}] CANCELLED {name}");
        }
    }
}

fn captured(outs_dir: &Path, stream: &str) -> String {
    let Ok(entries) = std::fs::read_dir(outs_dir) else {
        return String::new();
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(&format!("_{stream}.out")) {
            return std::fs::read_to_string(entry.path()).unwrap_or_default();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Group, Unit};

    fn context(dir: &Path) -> WorkerContext {
        WorkerContext {
            command: vec!["runner".to_string()],
            runner_args: vec!["--loglevel".to_string(), "DEBUG".to_string()],
            datasources: vec![PathBuf::from("tests")],
            results_dir: dir.to_path_buf(),
            lib_uri: "http://127.0.0.1:8270".to_string(),
            processes: 2,
            verbose: false,
            timeout: None,
        }
    }

    fn queue_item(dispatch_item: crate::plan::DispatchItem) -> QueueItem {
        QueueItem {
            dispatch: Dispatch {
                id: 0,
                item: dispatch_item,
                depends: Vec::new(),
            },
            argfile_index: String::new(),
            argfile: None,
        }
    }

    fn rendered(ctx: &WorkerContext, item: &QueueItem, outs: &Path) -> String {
        let command = build_command(ctx, item, outs, 3, 1, "cafe").unwrap();
        render_command(&command)
    }

    #[test]
    fn exit_codes_map_to_outcomes() {
        assert_eq!(interpret_exit(Some(0)), WorkerOutcome::Passed);
        assert_eq!(interpret_exit(Some(1)), WorkerOutcome::Failed(1));
        assert_eq!(interpret_exit(Some(249)), WorkerOutcome::Failed(249));
        assert_eq!(
            interpret_exit(Some(250)),
            WorkerOutcome::RunnerError(Some(250))
        );
        assert_eq!(interpret_exit(None), WorkerOutcome::RunnerError(None));
    }

    #[test]
    fn outcome_classification() {
        assert!(WorkerOutcome::Passed.completed());
        assert!(WorkerOutcome::Failed(3).completed());
        assert!(!WorkerOutcome::Timeout.completed());
        assert!(!WorkerOutcome::Failed(3).passed());
    }

    #[test]
    fn command_carries_selector_and_passthrough_args() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let item = queue_item(crate::plan::DispatchItem::Unit(Unit::suite("Root.A")));
        let line = rendered(&ctx, &item, dir.path());
        assert!(line.contains("--suite Root.A"), "{line}");
        assert!(line.contains("--loglevel DEBUG"), "{line}");
        assert!(line.contains("--output output.xml"), "{line}");
        assert!(line.ends_with("tests"), "{line}");
    }

    #[test]
    fn group_members_become_repeated_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut group = Group::new();
        group.push(Unit::test("S.T1")).unwrap();
        group.push(Unit::test("S.T2")).unwrap();
        let item = queue_item(crate::plan::DispatchItem::Group(group));
        let line = rendered(&ctx, &item, dir.path());
        assert!(line.contains("--test S.T1 --test S.T2"), "{line}");
    }

    #[test]
    fn argumentfile_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut item = queue_item(crate::plan::DispatchItem::Unit(Unit::suite("Root.A")));
        item.argfile_index = "2".to_string();
        item.argfile = Some(PathBuf::from("args2.txt"));
        let line = rendered(&ctx, &item, dir.path());
        assert!(line.contains("--argumentfile args2.txt"), "{line}");
        assert_eq!(item.display_name(), "Root.A {args2.txt}");
    }

    #[test]
    fn environment_is_injected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let item = queue_item(crate::plan::DispatchItem::Unit(Unit::suite("Root.A")));
        let command = build_command(&ctx, &item, dir.path(), 7, 1, "cafe").unwrap();
        let envs: Vec<(String, String)> = command
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| {
                Some((
                    k.to_string_lossy().into_owned(),
                    v?.to_string_lossy().into_owned(),
                ))
            })
            .collect();
        assert!(envs.contains(&(ENV_QUEUE_INDEX.to_string(), "7".to_string())));
        assert!(envs.contains(&(ENV_POOL_ID.to_string(), "1".to_string())));
        assert!(envs.contains(&(ENV_PROCESS_COUNT.to_string(), "2".to_string())));
        assert!(envs.contains(&(ENV_CALLER_ID.to_string(), "cafe".to_string())));
        assert!(envs.contains(&(
            ENV_LIB_URI.to_string(),
            "http://127.0.0.1:8270".to_string()
        )));
    }

    #[test]
    fn capture_files_are_named_after_the_runner() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let item = queue_item(crate::plan::DispatchItem::Unit(Unit::suite("Root.A")));
        build_command(&ctx, &item, dir.path(), 0, 0, "cafe").unwrap();
        assert!(dir.path().join("runner_stdout.out").is_file());
        assert!(dir.path().join("runner_stderr.out").is_file());
    }
}
