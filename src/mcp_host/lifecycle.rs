//! Server process lifecycle management.
//!
//! Spawns one child process per server id, runs the initialization handshake,
//! drains stderr, watches for exit, and terminates processes on demand. The
//! child's three standard streams are owned here and nowhere else.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch, Mutex};
use uuid::Uuid;

use super::command;
use super::config::BridgeSettings;
use super::errors::BridgeError;
use super::registry::Registry;
use super::transport::StdioTransport;
use super::types::{InitState, LaunchSpec, RiskTier, ServerDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines kept per process for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

// ─── ManagedProcess ──────────────────────────────────────────────────────────

/// How and when a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// A spawned server process with its transport.
pub struct ManagedProcess {
    pub server_id: String,
    /// Distinguishes this spawn from earlier or later ones under the same id.
    instance: Uuid,
    pub pid: Option<u32>,
    /// Tier copied from the definition at spawn time.
    pub risk_tier: Option<RiskTier>,
    /// The effective, possibly transformed, launch configuration.
    pub launch: LaunchSpec,
    /// Container image when running sandboxed.
    pub sandbox_image: Option<String>,
    pub transport: StdioTransport,
    child: Mutex<Child>,
    exit: watch::Sender<Option<ExitRecord>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("server_id", &self.server_id)
            .field("instance", &self.instance)
            .field("pid", &self.pid)
            .field("risk_tier", &self.risk_tier)
            .field("sandboxed", &self.launch.sandboxed)
            .field("exit", &self.exit_record())
            .finish_non_exhaustive()
    }
}

impl ManagedProcess {
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn is_sandboxed(&self) -> bool {
        self.launch.sandboxed
    }

    /// Whether the process has been observed to exit.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        *self.exit.borrow()
    }

    /// Most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Check liveness without blocking. Returns `true` once exited.
    ///
    /// Skips the check while another task holds the child (a shutdown in
    /// progress records the exit itself).
    pub fn poll_exit(&self) -> bool {
        if self.has_exited() {
            return true;
        }
        let Ok(mut child) = self.child.try_lock() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status.code());
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(server = %self.server_id, error = %e, "failed to poll process, assuming exited");
                self.record_exit(None);
                true
            }
        }
    }

    /// Force-kill immediately and wait for the process to be reaped.
    pub async fn kill_now(&self) {
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            self.record_exit(status.code());
            return;
        }
        if let Err(e) = child.kill().await {
            tracing::warn!(server = %self.server_id, error = %e, "failed to kill process");
        }
        let code = child.try_wait().ok().flatten().and_then(|s| s.code());
        self.record_exit(code);
    }

    /// Ask the process to exit, wait up to `grace`, then force-kill.
    pub async fn terminate(&self, grace: Duration) {
        let mut child = self.child.lock().await;

        if let Ok(Some(status)) = child.try_wait() {
            self.record_exit(status.code());
            return;
        }

        if self.signal_graceful() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(server = %self.server_id, code = ?status.code(), "server exited gracefully");
                    self.record_exit(status.code());
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server_id, error = %e, "failed waiting for server exit");
                }
                Err(_) => {
                    tracing::warn!(
                        server = %self.server_id,
                        grace_ms = grace.as_millis() as u64,
                        "server did not exit within grace period, killing"
                    );
                }
            }
        }

        if let Err(e) = child.kill().await {
            tracing::warn!(server = %self.server_id, error = %e, "failed to kill process");
        }
        let code = child.try_wait().ok().flatten().and_then(|s| s.code());
        self.record_exit(code);
    }

    #[cfg(unix)]
    fn signal_graceful(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(server = %self.server_id, pid, error = %e, "SIGTERM failed");
                false
            }
        }
    }

    /// No portable graceful signal for console-less children; terminate directly.
    #[cfg(not(unix))]
    fn signal_graceful(&self) -> bool {
        false
    }

    fn record_exit(&self, code: Option<i32>) {
        self.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(ExitRecord {
                code,
                at: Utc::now(),
            });
            true
        });
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

fn spawn_failed(id: &str, reason: impl Into<String>) -> BridgeError {
    BridgeError::SpawnFailed {
        server: id.to_string(),
        reason: reason.into(),
    }
}

/// Start the OS process with piped stdio. Must run inside a Tokio runtime.
fn launch_process(
    id: &str,
    launch: LaunchSpec,
    risk_tier: Option<RiskTier>,
    sandbox_image: Option<String>,
) -> Result<ManagedProcess, BridgeError> {
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args);
    cmd.envs(&launch.env);
    if let Some(dir) = &launch.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_failed(id, format!("{}: {e}", launch.program)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed(id, "failed to capture stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed(id, "failed to capture stdout"))?;

    let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(id.to_string(), stderr, Arc::clone(&stderr_tail)));
    }

    let pid = child.id();
    tracing::info!(
        server = id,
        pid = ?pid,
        program = %launch.program,
        sandboxed = launch.sandboxed,
        "spawned server process"
    );

    let (exit, _) = watch::channel(None);

    Ok(ManagedProcess {
        server_id: id.to_string(),
        instance: Uuid::new_v4(),
        pid,
        risk_tier,
        transport: StdioTransport::new(id, stdin, stdout),
        launch,
        sandbox_image,
        child: Mutex::new(child),
        exit,
        stderr_tail,
    })
}

async fn drain_stderr(server_id: String, stderr: ChildStderr, tail: Arc<StdMutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::warn!(server = %server_id, line = %line, "stderr");
                let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server_id, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Owns spawn, handshake, exit monitoring, and shutdown for every server id.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<Registry>,
    settings: Arc<BridgeSettings>,
}

/// A spawned process whose handshake is still running.
pub struct PendingSpawn {
    process: Arc<ManagedProcess>,
    ready: oneshot::Receiver<Result<(), BridgeError>>,
}

impl PendingSpawn {
    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    /// Wait for the handshake outcome.
    pub async fn wait_ready(self) -> Result<Arc<ManagedProcess>, BridgeError> {
        match self.ready.await {
            Ok(Ok(())) => Ok(self.process),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::Transport {
                server: self.process.server_id.clone(),
                reason: "initialization task ended without a result".into(),
            }),
        }
    }
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, settings: Arc<BridgeSettings>) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Transform `def` into its launch invocation and spawn it.
    pub async fn spawn_definition(&self, def: &ServerDefinition) -> Result<PendingSpawn, BridgeError> {
        let launch = command::transform(def);
        let sandbox_image = if launch.sandboxed {
            def.sandbox.as_ref().map(|s| s.image.clone())
        } else {
            None
        };
        self.spawn(&def.id, launch, def.risk_tier, sandbox_image).await
    }

    /// Launch a process, register it as STARTING, and start its handshake
    /// and exit monitor.
    ///
    /// A HIGH risk launch that is not sandboxed is refused before anything runs.
    pub async fn spawn(
        &self,
        id: &str,
        launch: LaunchSpec,
        risk_tier: Option<RiskTier>,
        sandbox_image: Option<String>,
    ) -> Result<PendingSpawn, BridgeError> {
        if risk_tier == Some(RiskTier::High) && !launch.sandboxed {
            tracing::error!(server = id, "refusing to run HIGH risk server outside a sandbox");
            return Err(BridgeError::SandboxMisconfigured {
                server: id.to_string(),
                reason: "no valid docker configuration".into(),
            });
        }

        let process = self
            .registry
            .insert_process_with(id, || launch_process(id, launch, risk_tier, sandbox_image))
            .await?;

        tokio::spawn(monitor_exit(
            Arc::clone(&self.registry),
            Arc::clone(&process),
            self.settings.exit_poll_interval,
        ));

        let (ready_tx, ready) = oneshot::channel();
        tokio::spawn(run_handshake(
            Arc::clone(&self.registry),
            Arc::clone(&process),
            self.settings.handshake_timeout,
            ready_tx,
        ));

        Ok(PendingSpawn { process, ready })
    }

    /// Stop a server and remove it from the registry.
    ///
    /// Returns `false` (and does nothing) when `id` is not registered.
    pub async fn shutdown(&self, id: &str) -> bool {
        let Some(process) = self.registry.get_process(id).await else {
            tracing::warn!(server = id, "shutdown requested for unknown server");
            return false;
        };

        tracing::info!(server = id, pid = ?process.pid, "shutting down server");
        process.terminate(self.settings.shutdown_grace).await;
        self.registry.remove_instance(id, process.instance()).await;
        true
    }

    /// Stop every registered server concurrently.
    pub async fn shutdown_all(&self) {
        let ids = self.registry.server_ids().await;
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "shutting down all servers");
        futures::future::join_all(ids.iter().map(|id| self.shutdown(id))).await;
    }
}

async fn run_handshake(
    registry: Arc<Registry>,
    process: Arc<ManagedProcess>,
    timeout: Duration,
    ready: oneshot::Sender<Result<(), BridgeError>>,
) {
    let outcome = handshake(&registry, &process, timeout).await;
    // The caller may have stopped waiting; the registry carries the outcome.
    let _ = ready.send(outcome);
}

async fn handshake(
    registry: &Registry,
    process: &ManagedProcess,
    timeout: Duration,
) -> Result<(), BridgeError> {
    let id = process.server_id.as_str();

    let result = match process.transport.initialize(timeout).await {
        Ok(result) => process
            .transport
            .notify(INITIALIZED_NOTIFICATION, None)
            .await
            .map(|()| result),
        Err(e) => Err(e),
    };

    match result {
        Ok(result) => {
            process.transport.mark_initialized();
            registry
                .set_init_state(id, process.instance(), InitState::Initialized)
                .await;
            tracing::info!(
                server = id,
                protocol_version = %result.get("protocolVersion").unwrap_or(&serde_json::Value::Null),
                server_info = %result.get("serverInfo").unwrap_or(&serde_json::Value::Null),
                "server initialized"
            );
            Ok(())
        }
        Err(e) => {
            let state = match e {
                BridgeError::Timeout { .. } => InitState::Timeout,
                _ => InitState::Error,
            };
            registry.set_init_state(id, process.instance(), state).await;
            process.kill_now().await;

            let stderr = process.stderr_tail();
            if !stderr.is_empty() {
                tracing::warn!(server = id, stderr = %stderr.join("\n"), "server stderr captured on failure");
            }
            tracing::error!(server = id, state = %state, error = %e, "server initialization failed");

            Err(with_stderr_context(e, &stderr))
        }
    }
}

/// Append captured stderr to errors that carry a free-form reason.
fn with_stderr_context(err: BridgeError, stderr: &[String]) -> BridgeError {
    if stderr.is_empty() {
        return err;
    }
    let suffix = format!(" (stderr: {})", stderr.join(" | "));
    match err {
        BridgeError::Transport { server, reason } => BridgeError::Transport {
            server,
            reason: reason + &suffix,
        },
        other => other,
    }
}

async fn monitor_exit(registry: Arc<Registry>, process: Arc<ManagedProcess>, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if process.poll_exit() {
            break;
        }
    }

    let id = process.server_id.as_str();
    let still_registered = registry
        .get_process(id)
        .await
        .is_some_and(|p| p.instance() == process.instance());
    if !still_registered {
        return;
    }

    let code = process.exit_record().and_then(|r| r.code);
    match registry.init_state(id).await {
        Some(state) if state.is_handshake_failure() => {
            tracing::debug!(server = id, state = %state, "process exited after failed handshake, keeping state");
        }
        _ => {
            tracing::info!(server = id, code = ?code, "server process exited");
            registry
                .set_init_state(id, process.instance(), InitState::Exited)
                .await;
            registry.remove_instance(id, process.instance()).await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
