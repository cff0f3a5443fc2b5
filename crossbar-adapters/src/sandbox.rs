//! Sandboxed child-process execution for the CLI adapter.
//!
//! Every invocation gets a fresh, single-use container: no network,
//! bounded memory and CPU, read-only root filesystem, dropped
//! capabilities, a non-root uid and a tmpfs workspace. The request
//! payload travels over stdin only; the command line holds nothing the
//! caller controls. Commands and images must be on the operator
//! allowlist.
//!
//! The deadline is enforced with the runtime's stop path (SIGTERM, then
//! SIGKILL after a grace period); a container that outlives the client
//! process is removed by force and logged as a leak.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::provider::CliConfig;

/// Upper bound on captured child output; anything larger is a protocol
/// violation by the tool, not a payload we should buffer.
const MAX_CAPTURED_OUTPUT: usize = 8 * 1024 * 1024;

/// How the child process is isolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Single-use container via the configured runtime binary.
    Container { runtime: String },
    /// Direct execution on the host. Development and tests only; the
    /// executor logs a warning per run.
    None,
}

#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub isolation: Isolation,
    pub allowed_images: HashSet<String>,
    pub allowed_commands: HashSet<String>,
    /// SIGTERM-to-SIGKILL grace on the stop path.
    pub kill_grace: Duration,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            isolation: Isolation::Container {
                runtime: "docker".to_string(),
            },
            allowed_images: HashSet::new(),
            allowed_commands: HashSet::new(),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Everything a run produces, successful or not.
#[derive(Debug)]
pub struct SandboxOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub duration: Duration,
}

/// The fully-resolved argv for one invocation. Built separately from
/// execution so the isolation flags are testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub program: String,
    pub args: Vec<String>,
    pub container_name: Option<String>,
    /// Static environment for direct execution; in container mode the
    /// equivalent travels as `--env` flags instead.
    pub env: Vec<(String, String)>,
}

pub struct SandboxExecutor {
    policy: SandboxPolicy,
}

impl SandboxExecutor {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Validate a CLI config against the allowlists and build the argv.
    ///
    /// Only operator-vetted values reach the command line: the runtime
    /// flags, the image, the command and its static args.
    pub fn plan(&self, config: &CliConfig) -> Result<CommandPlan, AdapterError> {
        if !self.policy.allowed_commands.contains(&config.command) {
            return Err(AdapterError::config(format!(
                "command {} is not on the sandbox allowlist",
                config.command
            )));
        }
        match &self.policy.isolation {
            Isolation::Container { runtime } => {
                if !self.policy.allowed_images.contains(&config.image) {
                    return Err(AdapterError::config(format!(
                        "image {} is not on the sandbox allowlist",
                        config.image
                    )));
                }
                let container_name = format!("crossbar-{}", uuid::Uuid::new_v4().simple());
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "-i".to_string(),
                    "--name".to_string(),
                    container_name.clone(),
                    "--network".to_string(),
                    "none".to_string(),
                    "--memory".to_string(),
                    format!("{}m", config.memory_limit_mb),
                    "--cpus".to_string(),
                    format!("{}", config.cpu_limit),
                    "--read-only".to_string(),
                    "--cap-drop".to_string(),
                    "ALL".to_string(),
                    "--security-opt".to_string(),
                    "no-new-privileges".to_string(),
                    "--user".to_string(),
                    "65534:65534".to_string(),
                    "--tmpfs".to_string(),
                    "/tmp:rw,size=64m".to_string(),
                ];
                for (key, value) in &config.env {
                    args.push("--env".to_string());
                    args.push(format!("{key}={value}"));
                }
                args.push(config.image.clone());
                args.push(config.command.clone());
                args.extend(config.args.iter().cloned());
                Ok(CommandPlan {
                    program: runtime.clone(),
                    args,
                    container_name: Some(container_name),
                    env: Vec::new(),
                })
            }
            Isolation::None => Ok(CommandPlan {
                program: config.command.clone(),
                args: config.args.clone(),
                container_name: None,
                env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }),
        }
    }

    /// Run the command to completion, feeding `stdin_payload` to the
    /// child and collecting stdout/stderr.
    ///
    /// The effective wall clock is `min(deadline, config timeout)` as
    /// decided by the caller; expiry terminates the container and returns
    /// whatever stdout was collected so far.
    pub async fn run(
        &self,
        config: &CliConfig,
        stdin_payload: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutput, AdapterError> {
        let plan = self.plan(config)?;
        let started = Instant::now();
        let mut child = self.spawn(&plan)?;

        // Stdin is the only channel for dynamic content. Write then close
        // so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_payload)
                .await
                .map_err(|e| AdapterError::transient(format!("sandbox stdin write: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AdapterError::transient(format!("sandbox stdin close: {e}")))?;
        }

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::config("sandbox stdout pipe unavailable"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| AdapterError::config("sandbox stderr pipe unavailable"))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        enum Waited {
            Done(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        // The collect future and its borrows end with the select block;
        // the partial buffers stay usable afterwards.
        let waited = {
            let collect = async {
                let out = read_capped(&mut stdout_pipe, &mut stdout);
                let err = read_capped(&mut stderr_pipe, &mut stderr);
                tokio::join!(out, err);
                child.wait().await
            };
            tokio::select! {
                status = tokio::time::timeout(timeout, collect) => match status {
                    Ok(status) => Waited::Done(status),
                    Err(_) => Waited::TimedOut,
                },
                _ = cancel.cancelled() => Waited::Cancelled,
            }
        };

        match waited {
            Waited::Done(status) => {
                let status = status
                    .map_err(|e| AdapterError::transient(format!("sandbox wait: {e}")))?;
                Ok(SandboxOutput {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    timed_out: false,
                    duration: started.elapsed(),
                })
            }
            Waited::TimedOut => {
                self.terminate(&plan, &mut child).await;
                Ok(SandboxOutput {
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: true,
                    duration: started.elapsed(),
                })
            }
            Waited::Cancelled => {
                self.terminate(&plan, &mut child).await;
                Err(AdapterError::Cancelled)
            }
        }
    }

    /// Spawn and hand back the child plus its stdout line stream, for
    /// streaming CLI tools emitting newline-delimited JSON.
    pub async fn spawn_streaming(
        &self,
        config: &CliConfig,
        stdin_payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<StreamingChild, AdapterError> {
        let plan = self.plan(config)?;
        let mut child = self.spawn(&plan)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_payload)
                .await
                .map_err(|e| AdapterError::transient(format!("sandbox stdin write: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AdapterError::transient(format!("sandbox stdin close: {e}")))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::config("sandbox stdout pipe unavailable"))?;

        Ok(StreamingChild {
            lines: BufReader::new(stdout),
            child,
            plan,
            policy: self.policy.clone(),
            cancel: cancel.clone(),
        })
    }

    fn spawn(&self, plan: &CommandPlan) -> Result<tokio::process::Child, AdapterError> {
        if plan.container_name.is_none() {
            tracing::warn!(
                program = %plan.program,
                "sandbox isolation disabled; running child directly"
            );
        }
        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if plan.container_name.is_none() {
            // Direct execution gets a scrubbed environment with only the
            // operator-set variables.
            command.env_clear().envs(plan.env.iter().map(|(k, v)| (k, v)));
        }
        command.spawn().map_err(|e| {
            AdapterError::config(format!("failed to spawn {}: {e}", plan.program))
        })
    }

    /// Stop the container (SIGTERM, SIGKILL after the grace period) and
    /// reap the client process. A container that cannot be reaped is
    /// force-removed and logged as a leak.
    async fn terminate(&self, plan: &CommandPlan, child: &mut tokio::process::Child) {
        terminate_child(&self.policy, plan, child).await;
    }
}

/// A live streaming invocation; killing it stops the container.
pub struct StreamingChild {
    pub lines: BufReader<tokio::process::ChildStdout>,
    child: tokio::process::Child,
    plan: CommandPlan,
    policy: SandboxPolicy,
    cancel: CancellationToken,
}

impl StreamingChild {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for exit, used after stdout reaches EOF.
    pub async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }

    /// Stop the container and reap the child.
    pub async fn terminate(&mut self) {
        terminate_child(&self.policy, &self.plan, &mut self.child).await;
    }
}

async fn terminate_child(
    policy: &SandboxPolicy,
    plan: &CommandPlan,
    child: &mut tokio::process::Child,
) {
    if let (Isolation::Container { runtime }, Some(name)) =
        (&policy.isolation, plan.container_name.as_deref())
    {
        // `stop` delivers SIGTERM, waits out the grace period, then
        // SIGKILLs inside the container.
        let stop = Command::new(runtime)
            .args(["stop", "--time", &policy.kill_grace.as_secs().to_string(), name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = stop {
            tracing::warn!(container = name, error = %e, "sandbox stop failed");
        }
    } else {
        let _ = child.start_kill();
    }

    // Reap within a bounded time; a straggler is an alarm condition.
    let reaped = tokio::time::timeout(policy.kill_grace + Duration::from_secs(2), child.wait())
        .await
        .is_ok();
    if !reaped {
        let _ = child.start_kill();
        if let (Isolation::Container { runtime }, Some(name)) =
            (&policy.isolation, plan.container_name.as_deref())
        {
            let _ = Command::new(runtime)
                .args(["rm", "-f", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            tracing::error!(container = name, "leaked sandbox container force-removed");
        }
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > MAX_CAPTURED_OUTPUT {
                    buf.extend_from_slice(&chunk[..MAX_CAPTURED_OUTPUT - buf.len()]);
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => break,
        }
    }
}
