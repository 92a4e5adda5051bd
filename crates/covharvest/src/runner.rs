//! Isolated Runner
//!
//! Executes one unit of work inside the sandbox with a raw-profile path, a
//! single-threaded numeric stack and a wall-clock limit. [`IsolatedRunner::run`]
//! always returns a [`RunOutcome`]; nothing a unit does can fail the batch.

use crate::config::{HarvestConfig, INPUT_PLACEHOLDER};
use crate::sandbox::{path_arg, ExecOutput, ExecRequest, Sandbox, SandboxHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Environment variable naming the raw profile destination
pub const PROFILE_ENV: &str = "LLVM_PROFILE_FILE";

/// Thread-count overrides pinned to 1 for every unit
pub const THREAD_ENV: [&str; 9] = [
    "OMP_NUM_THREADS",
    "OMP_THREAD_LIMIT",
    "MKL_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "BLIS_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
    "TF_NUM_INTRAOP_THREADS",
    "TF_NUM_INTEROP_THREADS",
];

/// Exit code reported for units killed by the timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for runner faults
pub const FAULT_EXIT_CODE: i32 = 1;

// `timeout -s KILL` inside a container exits 128 + SIGKILL
const KILLED_EXIT_CODE: i32 = 137;

// ============================================================================
// Shutdown
// ============================================================================

/// Cooperative interrupt shared by the driver, executor and runner
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Untriggered signal
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Request shutdown; idempotent
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown was requested
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is requested
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Units and outcomes
// ============================================================================

/// One program (or one sub-batch directory) to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Path relative to the bucket, used in logs
    pub name: String,
    /// Sandbox path substituted for `{input}`
    pub input: PathBuf,
    /// Sandbox working directory
    pub cwd: PathBuf,
    /// Sandbox path of the raw profile this unit writes
    pub profile: PathBuf,
}

/// How a unit ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Exit status zero
    Success,
    /// Nonzero exit, or killed by a signal (`code` is `None`)
    Failed {
        /// Exit code
        code: Option<i32>,
    },
    /// Killed after exceeding the timeout
    TimedOut,
    /// The runner itself could not invoke the unit
    Fault {
        /// What went wrong
        message: String,
    },
    /// Never started or stopped by an interrupt
    Cancelled,
}

impl RunStatus {
    /// Exit code shown in the run log
    #[must_use]
    pub fn reported_code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Failed { code } => *code,
            Self::TimedOut => Some(TIMEOUT_EXIT_CODE),
            Self::Fault { .. } => Some(FAULT_EXIT_CODE),
            Self::Cancelled => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "OK"),
            Self::Failed { code: Some(code) } => write!(f, "FAIL rc={code}"),
            Self::Failed { code: None } => write!(f, "FAIL rc=signal"),
            Self::TimedOut => write!(f, "TIMEOUT"),
            Self::Fault { .. } => write!(f, "ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Result of executing one [`WorkUnit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Unit name
    pub unit: String,
    /// Final status
    pub status: RunStatus,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall-clock time spent
    pub duration: Duration,
}

impl RunOutcome {
    fn new(unit: &WorkUnit, status: RunStatus, duration: Duration) -> Self {
        Self {
            unit: unit.name.clone(),
            status,
            stdout: String::new(),
            stderr: String::new(),
            duration,
        }
    }

    /// Outcome for a unit that was never dispatched
    #[must_use]
    pub fn cancelled(unit: &WorkUnit) -> Self {
        Self::new(unit, RunStatus::Cancelled, Duration::ZERO)
    }

    /// Attach captured output
    #[must_use]
    pub fn with_output(mut self, output: ExecOutput) -> Self {
        self.stdout = output.stdout;
        self.stderr = output.stderr;
        self
    }

    /// Whether the unit exited cleanly
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Success
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Command template and limits applied to every unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Argv template containing `{input}`
    pub command: Vec<String>,
    /// Wall-clock limit per unit
    pub timeout: Duration,
}

impl RunnerConfig {
    /// Create a runner configuration
    #[must_use]
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// Take the command and timeout from a harvest configuration
    #[must_use]
    pub fn from_harvest(config: &HarvestConfig) -> Self {
        Self::new(config.command.clone(), config.timeout())
    }

    /// Build the request for one unit
    #[must_use]
    pub fn request_for(&self, unit: &WorkUnit) -> ExecRequest {
        let input = path_arg(&unit.input);
        let argv = self
            .command
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input));
        let mut request = ExecRequest::new(argv)
            .cwd(unit.cwd.clone())
            .env(PROFILE_ENV, path_arg(&unit.profile))
            .timeout(self.timeout);
        for var in THREAD_ENV {
            request = request.env(var, "1");
        }
        request
    }
}

/// Executes units against a provisioned sandbox
#[derive(Debug, Clone, Copy)]
pub struct IsolatedRunner<'a> {
    sandbox: &'a dyn Sandbox,
    handle: &'a SandboxHandle,
    config: &'a RunnerConfig,
}

impl<'a> IsolatedRunner<'a> {
    /// Bind a runner to a sandbox handle
    #[must_use]
    pub fn new(
        sandbox: &'a dyn Sandbox,
        handle: &'a SandboxHandle,
        config: &'a RunnerConfig,
    ) -> Self {
        Self {
            sandbox,
            handle,
            config,
        }
    }

    /// Run one unit. Never fails; problems are folded into the outcome.
    pub async fn run(&self, unit: &WorkUnit, shutdown: &Shutdown) -> RunOutcome {
        let start = Instant::now();
        if shutdown.is_triggered() {
            return RunOutcome::cancelled(unit);
        }
        if let Some(parent) = unit.profile.parent() {
            if let Err(e) = self.sandbox.make_dir(self.handle, parent).await {
                return RunOutcome::new(
                    unit,
                    RunStatus::Fault {
                        message: e.to_string(),
                    },
                    start.elapsed(),
                );
            }
        }

        let request = self.config.request_for(unit);
        let limit = self.config.timeout;
        let exec = tokio::time::timeout(limit, self.sandbox.exec(self.handle, &request));
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                RunOutcome::new(unit, RunStatus::Cancelled, start.elapsed())
            }
            result = exec => {
                let elapsed = start.elapsed();
                match result {
                    Err(_) => RunOutcome::new(unit, RunStatus::TimedOut, elapsed),
                    Ok(Err(e)) => RunOutcome::new(
                        unit,
                        RunStatus::Fault { message: e.to_string() },
                        elapsed,
                    ),
                    Ok(Ok(output)) => {
                        let status = classify_exit(&output, elapsed, limit);
                        RunOutcome::new(unit, status, elapsed).with_output(output)
                    }
                }
            }
        };
        debug!(
            unit = %outcome.unit,
            status = %outcome.status,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "unit finished"
        );
        outcome
    }
}

fn classify_exit(output: &ExecOutput, elapsed: Duration, limit: Duration) -> RunStatus {
    match output.exit_code {
        Some(0) => RunStatus::Success,
        Some(TIMEOUT_EXIT_CODE | KILLED_EXIT_CODE) if elapsed >= limit => RunStatus::TimedOut,
        code => RunStatus::Failed { code },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandbox;
    use tempfile::TempDir;

    fn unit(dir: &TempDir, name: &str) -> WorkUnit {
        WorkUnit {
            name: name.to_string(),
            input: dir.path().join(name),
            cwd: dir.path().to_path_buf(),
            profile: dir.path().join("profraw").join(format!("{name}.profraw")),
        }
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> WorkUnit {
        std::fs::write(dir.path().join(name), body).unwrap();
        unit(dir, name)
    }

    fn sh_config(timeout: Duration) -> RunnerConfig {
        RunnerConfig::new(vec!["sh".to_string(), "{input}".to_string()], timeout)
    }

    async fn run(dir: &TempDir, unit: &WorkUnit, config: &RunnerConfig) -> RunOutcome {
        let sb = LocalSandbox::new(dir.path());
        let handle = sb.provision().await.unwrap();
        IsolatedRunner::new(&sb, &handle, config)
            .run(unit, &Shutdown::new())
            .await
    }

    // =========================================================================
    // Request construction
    // =========================================================================

    mod request_tests {
        use super::*;

        #[test]
        fn test_request_substitutes_input_and_sets_env() {
            let config = RunnerConfig::new(
                vec!["python".to_string(), "{input}".to_string()],
                Duration::from_secs(30),
            );
            let unit = WorkUnit {
                name: "g/a.py".to_string(),
                input: PathBuf::from("/root/inputs/0-60/g/a.py"),
                cwd: PathBuf::from("/root/inputs/0-60"),
                profile: PathBuf::from("/root/profraw/0-60/g/a.py.profraw"),
            };
            let request = config.request_for(&unit);
            assert_eq!(request.argv, vec!["python", "/root/inputs/0-60/g/a.py"]);
            assert_eq!(request.cwd, Some(PathBuf::from("/root/inputs/0-60")));
            assert_eq!(request.timeout, Some(Duration::from_secs(30)));
            assert!(request.env.contains(&(
                PROFILE_ENV.to_string(),
                "/root/profraw/0-60/g/a.py.profraw".to_string()
            )));
            for var in THREAD_ENV {
                assert!(request.env.contains(&(var.to_string(), "1".to_string())));
            }
        }

        #[test]
        fn test_status_reporting() {
            assert_eq!(RunStatus::TimedOut.reported_code(), Some(124));
            assert_eq!(RunStatus::Success.to_string(), "OK");
            assert_eq!(RunStatus::Failed { code: Some(2) }.to_string(), "FAIL rc=2");
            assert_eq!(
                RunStatus::Fault {
                    message: "x".to_string()
                }
                .reported_code(),
                Some(1)
            );
            assert_eq!(RunStatus::Cancelled.to_string(), "CANCELLED");
        }

        #[test]
        fn test_classify_exit_needs_elapsed_limit_for_timeout() {
            let output = ExecOutput {
                exit_code: Some(124),
                ..ExecOutput::default()
            };
            let limit = Duration::from_secs(5);
            assert_eq!(
                classify_exit(&output, Duration::from_secs(1), limit),
                RunStatus::Failed { code: Some(124) }
            );
            assert_eq!(
                classify_exit(&output, Duration::from_secs(5), limit),
                RunStatus::TimedOut
            );
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    mod run_tests {
        use super::*;

        #[tokio::test]
        async fn test_success_writes_profile_via_env() {
            let dir = TempDir::new().unwrap();
            let body = "echo $OMP_NUM_THREADS > \"$LLVM_PROFILE_FILE\"\necho done\n";
            let unit = script(&dir, "ok.sh", body);
            let outcome = run(&dir, &unit, &sh_config(Duration::from_secs(10))).await;
            assert!(outcome.is_ok(), "{outcome:?}");
            assert_eq!(outcome.stdout.trim(), "done");
            let written = std::fs::read_to_string(&unit.profile).unwrap();
            assert_eq!(written.trim(), "1");
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_failure() {
            let dir = TempDir::new().unwrap();
            let unit = script(&dir, "bad.sh", "echo boom >&2\nexit 3\n");
            let outcome = run(&dir, &unit, &sh_config(Duration::from_secs(10))).await;
            assert_eq!(outcome.status, RunStatus::Failed { code: Some(3) });
            assert_eq!(outcome.stderr.trim(), "boom");
        }

        #[tokio::test]
        async fn test_timeout_is_sentinel_and_bounded() {
            let dir = TempDir::new().unwrap();
            let unit = script(&dir, "slow.sh", "sleep 30\n");
            let started = Instant::now();
            let outcome = run(&dir, &unit, &sh_config(Duration::from_millis(300))).await;
            assert_eq!(outcome.status, RunStatus::TimedOut);
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_timeout_kills_grandchildren() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("grandchild.pid");
            let body = format!("sleep 41.7 &\necho $! > '{}'\nwait\n", pid_file.display());
            let unit = script(&dir, "spawner.sh", &body);
            let outcome = run(&dir, &unit, &sh_config(Duration::from_millis(500))).await;
            assert_eq!(outcome.status, RunStatus::TimedOut);

            let pid = std::fs::read_to_string(&pid_file).unwrap();
            let stat = format!("/proc/{}/stat", pid.trim());
            // A reaped or zombie process no longer counts as running
            let alive = || {
                std::fs::read_to_string(&stat)
                    .map(|s| !s.contains(") Z "))
                    .unwrap_or(false)
            };
            for _ in 0..40 {
                if !alive() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(!alive(), "grandchild {} survived the timeout", pid.trim());
        }

        #[tokio::test]
        async fn test_spawn_failure_is_fault() {
            let dir = TempDir::new().unwrap();
            let unit = unit(&dir, "x");
            let config = RunnerConfig::new(
                vec!["/no/such/interpreter".to_string(), "{input}".to_string()],
                Duration::from_secs(5),
            );
            let outcome = run(&dir, &unit, &config).await;
            assert!(matches!(outcome.status, RunStatus::Fault { .. }));
        }

        #[tokio::test]
        async fn test_triggered_shutdown_cancels() {
            let dir = TempDir::new().unwrap();
            let unit = script(&dir, "slow.sh", "sleep 30\n");
            let sb = LocalSandbox::new(dir.path());
            let handle = sb.provision().await.unwrap();
            let config = sh_config(Duration::from_secs(60));
            let shutdown = Shutdown::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.trigger();
            });
            let started = Instant::now();
            let outcome = IsolatedRunner::new(&sb, &handle, &config)
                .run(&unit, &shutdown)
                .await;
            assert_eq!(outcome.status, RunStatus::Cancelled);
            assert!(started.elapsed() < Duration::from_secs(10));
        }
    }

    #[test]
    fn test_shutdown_is_shared_between_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());
        shutdown.trigger();
        assert!(clone.is_triggered());
    }
}
