use crate::config::DevServerConfig;
use crate::error::StartError;
use crate::readiness::{spawn_http_probe, spawn_log_reader, Readiness, ReadinessSignal};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long the pre-spawn port probe may take
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// State of the supervised dev server
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No process
    Stopped,
    /// Process spawned, waiting for readiness
    Starting,
    /// Process ready to accept traffic
    Running,
    /// Process is being terminated
    Stopping,
    /// Last start attempt failed or the process died
    Failed,
}

/// Handle to the spawned dev server and the tasks attached to it.
///
/// Created by `start()`, consumed by termination. Never shared or reused.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    signal: Arc<ReadinessSignal>,
    reader: JoinHandle<()>,
    probe: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    fn finish(self) {
        if let Some(probe) = self.probe {
            probe.abort();
        }
        self.reader.abort();
    }
}

/// Supervises exactly one dev server process.
///
/// `ProcessSupervisor` is designed to be used behind an `Arc` and shared
/// between the composition root, the shutdown guard and the proxy.
///
/// Lifecycle transitions (`start`/`stop`) are serialized by an async
/// lifecycle lock. The state and handle mutexes are only held for short,
/// non-awaiting sections so [`is_running`](Self::is_running) never waits
/// behind a transition.
pub struct ProcessSupervisor {
    config: Arc<DevServerConfig>,
    state: Mutex<SupervisorState>,
    handle: Mutex<Option<ProcessHandle>>,
    /// Latch of the start attempt in flight, so stop() can cancel it
    pending: Mutex<Option<Arc<ReadinessSignal>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<DevServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SupervisorState::Stopped),
            handle: Mutex::new(None),
            pending: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DevServerConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock() = state;
    }

    /// PID of the current child, if any
    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().map(|h| h.pid)
    }

    /// Configured target address; pair with [`is_running`](Self::is_running)
    pub fn address(&self) -> (String, u16) {
        self.config.address()
    }

    pub fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// True only if the state is Running and the process is still alive.
    ///
    /// Liveness is re-checked on every call. A process found dead moves the
    /// supervisor to Failed.
    pub fn is_running(&self) -> bool {
        if self.state() != SupervisorState::Running {
            return false;
        }

        let exit = {
            let mut guard = self.handle.lock();
            let Some(handle) = guard.as_mut() else {
                return false;
            };
            match handle.child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => Some(status),
                Err(e) => {
                    warn!(pid = handle.pid, error = %e, "Failed to check dev server liveness");
                    None
                }
            }
        };

        let mut state = self.state.lock();
        if *state == SupervisorState::Running {
            *state = SupervisorState::Failed;
            warn!(?exit, "Dev server exited unexpectedly");
        }
        false
    }

    /// Start the dev server if integration and auto-start are enabled
    pub async fn auto_start(&self) -> Result<(), StartError> {
        if !self.config.enabled || !self.config.auto_start {
            info!("Dev server auto-start is disabled");
            return Err(StartError::Disabled);
        }
        self.start().await
    }

    /// Spawn the dev server and wait for readiness.
    ///
    /// Blocks the caller until a readiness pattern is seen, the child
    /// exits, a concurrent `stop()` cancels the attempt, or the startup
    /// timeout elapses. Every failure after spawn tears the child down.
    pub async fn start(&self) -> Result<(), StartError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == SupervisorState::Running {
            if self.is_running() {
                debug!("Dev server already running");
                return Ok(());
            }
            // Died since the last check; clear the stale handle before respawning
            let stale = self.handle.lock().take();
            if let Some(handle) = stale {
                handle.finish();
            }
        }

        // Publish Starting and the latch together, before any await, so a
        // stop() arriving during the prechecks can cancel this attempt
        let previous = self.state();
        let signal = ReadinessSignal::new();
        {
            let mut state = self.state.lock();
            *self.pending.lock() = Some(Arc::clone(&signal));
            *state = SupervisorState::Starting;
        }

        let (host, port) = self.config.address();
        if port_in_use(&host, port).await {
            warn!(host = %host, port, "Dev server port already in use, not starting");
            self.abandon(previous);
            return Err(StartError::AlreadyInUse { host, port });
        }

        let working_dir = self.config.working_dir.clone();
        if !working_dir.is_dir() {
            warn!(path = %working_dir.display(), "Frontend working directory does not exist");
            self.abandon(previous);
            return Err(StartError::MissingWorkingDir(working_dir));
        }

        let argv = match self.config.command_line() {
            Ok(argv) => argv,
            Err(e) => {
                self.abandon(SupervisorState::Failed);
                return Err(StartError::SpawnFailure(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e.to_string(),
                )));
            }
        };

        if signal.get() == Readiness::Closed {
            info!("Dev server start cancelled before spawn");
            self.abandon(SupervisorState::Stopped);
            return Err(StartError::Cancelled);
        }

        info!(
            host = %host,
            port,
            command = ?argv,
            working_dir = %working_dir.display(),
            "Starting dev server"
        );

        let mut child = match self.spawn(&argv) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to spawn dev server");
                self.abandon(SupervisorState::Failed);
                return Err(StartError::SpawnFailure(e));
            }
        };

        let Some(pid) = child.id() else {
            self.abandon(SupervisorState::Failed);
            return Err(StartError::ProcessExited);
        };
        info!(pid, "Dev server process spawned");

        let reader = spawn_log_reader(
            child.stdout.take(),
            child.stderr.take(),
            self.config.readiness_patterns.clone(),
            Arc::clone(&signal),
        );
        let probe = self
            .config
            .readiness_probe
            .then(|| spawn_http_probe(host.clone(), port, Arc::clone(&signal)));

        *self.handle.lock() = Some(ProcessHandle {
            child,
            pid,
            signal: Arc::clone(&signal),
            reader,
            probe,
        });

        let timeout = self.config.startup_timeout();
        let started = Instant::now();
        info!(timeout_secs = timeout.as_secs(), "Waiting for dev server to be ready");

        let outcome = tokio::time::timeout(timeout, signal.wait()).await;
        *self.pending.lock() = None;

        let result = match outcome {
            Ok(Readiness::Ready) => {
                let mut state = self.state.lock();
                if *state == SupervisorState::Starting {
                    *state = SupervisorState::Running;
                    Ok(())
                } else {
                    Err(StartError::Cancelled)
                }
            }
            Ok(_) if self.state() == SupervisorState::Stopping => Err(StartError::Cancelled),
            Ok(_) => Err(StartError::ProcessExited),
            Err(_) => {
                // Settle the latch so a late banner cannot fire into a dead attempt
                signal.close();
                Err(StartError::StartTimeout(timeout))
            }
        };

        match result {
            Ok(()) => {
                info!(
                    url = %self.base_url(),
                    pid,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Dev server started"
                );
                Ok(())
            }
            Err(e) => {
                match &e {
                    StartError::Cancelled => info!("Dev server start cancelled"),
                    other => error!(error = %other, "Dev server failed to start"),
                }
                let handle = self.handle.lock().take();
                if let Some(handle) = handle {
                    self.terminate(handle).await;
                }
                let terminal = if matches!(e, StartError::Cancelled) {
                    SupervisorState::Stopped
                } else {
                    SupervisorState::Failed
                };
                self.set_state(terminal);
                Err(e)
            }
        }
    }

    /// Drop the pending latch of an attempt that never spawned
    fn abandon(&self, state: SupervisorState) {
        let mut current = self.state.lock();
        *self.pending.lock() = None;
        *current = state;
    }

    fn spawn(&self, argv: &[String]) -> std::io::Result<Child> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty start command")
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(&self.config.working_dir);
        cmd.envs(&self.config.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }

    /// Stop the dev server.
    ///
    /// Idempotent and safe to call from shutdown paths. A stop arriving
    /// while a start is waiting for readiness cancels that wait.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == SupervisorState::Starting {
                *state = SupervisorState::Stopping;
                if let Some(signal) = self.pending.lock().as_ref() {
                    signal.close();
                }
            }
        }

        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == SupervisorState::Stopped {
            debug!("Dev server already stopped");
            return;
        }

        self.set_state(SupervisorState::Stopping);
        // A start() future dropped mid-flight can leave its latch behind
        *self.pending.lock() = None;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.terminate(handle).await;
        }
        self.set_state(SupervisorState::Stopped);
        info!("Dev server stopped");
    }

    /// Graceful signal, wait, tree kill, force kill, wait.
    /// Each step is skipped once the process has exited.
    async fn terminate(&self, mut handle: ProcessHandle) {
        let pid = handle.pid;
        let grace_period = self.config.shutdown_grace_period();
        handle.signal.close();

        if let Ok(Some(status)) = handle.child.try_wait() {
            debug!(pid, ?status, "Dev server already exited");
            handle.finish();
            return;
        }

        info!(pid, "Sending graceful termination signal to dev server");
        send_graceful(&mut handle.child, pid).await;

        match tokio::time::timeout(grace_period, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, ?status, "Dev server exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error waiting for dev server to exit");
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, killing dev server process tree"
                );
                kill_process_tree(pid).await;
                if let Err(e) = handle.child.start_kill() {
                    debug!(pid, error = %e, "Force kill after tree kill failed");
                }
                match tokio::time::timeout(grace_period, handle.child.wait()).await {
                    Ok(Ok(status)) => info!(pid, ?status, "Dev server killed"),
                    Ok(Err(e)) => warn!(pid, error = %e, "Error waiting for killed dev server"),
                    Err(_) => error!(pid, "Dev server did not exit after forced kill"),
                }
            }
        }

        handle.finish();
    }

    /// Synchronous best-effort kill for paths that cannot await `stop()`
    pub fn kill_now(&self) {
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            warn!(pid = handle.pid, "Force killing dev server during abnormal shutdown");
            handle.signal.close();
            kill_process_tree_blocking(handle.pid);
            let _ = handle.child.start_kill();
            handle.finish();
        }
        self.set_state(SupervisorState::Stopped);
    }
}

/// Owns the obligation to stop the dev server when the host shuts down.
///
/// Call [`release`](Self::release) on orderly shutdown. If the guard is
/// dropped without it (early return, panic unwind) the process tree is
/// killed synchronously.
pub struct ShutdownGuard {
    supervisor: Arc<ProcessSupervisor>,
    released: bool,
}

impl ShutdownGuard {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.supervisor.stop().await;
        self.released = true;
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if !self.released {
            self.supervisor.kill_now();
        }
    }
}

/// Returns true if something already accepts TCP connections on host:port
pub async fn port_in_use(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
async fn send_graceful(_child: &mut Child, pid: u32) {
    // pgid == pid because the child leads its own group
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
    if rc != 0 {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
async fn send_graceful(child: &mut Child, pid: u32) {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if !matches!(status, Ok(s) if s.success()) {
        let _ = child.start_kill();
    }
}

/// Kill every descendant of `pid`: direct children by parent PID, then
/// the whole process group.
#[cfg(unix)]
async fn kill_process_tree(pid: u32) {
    let status = Command::new("pkill")
        .args(["-KILL", "-P", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        debug!(pid, error = %e, "pkill unavailable, relying on process group kill");
    }
    kill_process_tree_blocking(pid);
}

#[cfg(not(unix))]
async fn kill_process_tree(pid: u32) {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pid, error = %e, "taskkill failed");
    }
}

#[cfg(unix)]
fn kill_process_tree_blocking(pid: u32) {
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "Process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_process_tree_blocking(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn sh_config(script: &str, timeout_secs: u64) -> DevServerConfig {
        DevServerConfig::new("127.0.0.1", free_port())
            .with_command(["sh", "-c", script])
            .with_working_dir(std::env::temp_dir())
            .with_startup_timeout_secs(timeout_secs)
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let supervisor = ProcessSupervisor::new(Arc::new(DevServerConfig::default()));

        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.is_running());
        assert!(supervisor.pid().is_none());
        assert_eq!(supervisor.address(), ("localhost".to_string(), 5173));
        assert_eq!(supervisor.base_url(), "http://localhost:5173");
    }

    #[test]
    fn test_supervisor_state_serialization() {
        assert_eq!(
            serde_json::to_string(&SupervisorState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&SupervisorState::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[tokio::test]
    async fn test_missing_working_dir() {
        let config = sh_config("echo ready in 1ms", 1)
            .with_working_dir(PathBuf::from("/definitely/not/a/real/dir"));
        let supervisor = ProcessSupervisor::new(Arc::new(config));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, StartError::MissingWorkingDir(_)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_port_already_in_use() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = sh_config("echo ready in 1ms; sleep 30", 2);
        config.port = port;
        let supervisor = ProcessSupervisor::new(Arc::new(config));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, StartError::AlreadyInUse { port: p, .. } if p == port));
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = DevServerConfig::new("127.0.0.1", free_port())
            .with_command(["/nonexistent/dev-server-binary"])
            .with_working_dir(std::env::temp_dir())
            .with_startup_timeout_secs(1);
        let supervisor = ProcessSupervisor::new(Arc::new(config));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, StartError::SpawnFailure(_)));
        assert_eq!(supervisor.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let supervisor =
            ProcessSupervisor::new(Arc::new(sh_config("echo 'ready in 12ms'; sleep 30", 5)));

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert!(supervisor.is_running());
        assert!(supervisor.pid().is_some());

        // Second start is a no-op
        supervisor.start().await.unwrap();

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.is_running());
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor =
            ProcessSupervisor::new(Arc::new(sh_config("echo 'ready in 3ms'; sleep 30", 5)));
        supervisor.start().await.unwrap();

        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        // Stop on a never-started supervisor is also fine
        let idle = ProcessSupervisor::new(Arc::new(DevServerConfig::default()));
        idle.stop().await;
        assert_eq!(idle.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let supervisor = ProcessSupervisor::new(Arc::new(sh_config("echo boom; exit 1", 5)));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, StartError::ProcessExited));
        assert_eq!(supervisor.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn test_is_running_detects_exit() {
        let supervisor =
            ProcessSupervisor::new(Arc::new(sh_config("echo 'ready in 1ms'; sleep 0.3", 5)));
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.state(), SupervisorState::Failed);

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_creates_new_process() {
        let supervisor =
            ProcessSupervisor::new(Arc::new(sh_config("echo 'ready in 1ms'; sleep 30", 5)));

        supervisor.start().await.unwrap();
        let first = supervisor.pid().unwrap();
        supervisor.stop().await;

        supervisor.start().await.unwrap();
        let second = supervisor.pid().unwrap();
        assert_ne!(first, second);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_start_cancels_wait() {
        let supervisor = ProcessSupervisor::new(Arc::new(sh_config("sleep 30", 30)));

        let starter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.start().await })
        };

        // Let the child spawn
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.state() != SupervisorState::Starting && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.state(), SupervisorState::Starting);

        let stopped = tokio::time::timeout(Duration::from_secs(10), supervisor.stop()).await;
        assert!(stopped.is_ok(), "stop() deadlocked against start()");

        let result = tokio::time::timeout(Duration::from_secs(10), starter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StartError::Cancelled)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates_to_kill() {
        let mut config = sh_config("trap '' TERM; echo 'ready in 1ms'; sleep 30", 5);
        config.shutdown_grace_period_secs = 1;
        let supervisor = ProcessSupervisor::new(Arc::new(config));
        supervisor.start().await.unwrap();

        let started = Instant::now();
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_auto_start_disabled() {
        let mut config = sh_config("echo 'ready in 1ms'; sleep 30", 5);
        config.auto_start = false;
        let supervisor = ProcessSupervisor::new(Arc::new(config));

        assert!(matches!(
            supervisor.auto_start().await,
            Err(StartError::Disabled)
        ));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_guard_release() {
        let supervisor =
            ProcessSupervisor::new(Arc::new(sh_config("echo 'ready in 1ms'; sleep 30", 5)));
        supervisor.start().await.unwrap();

        let guard = ShutdownGuard::new(Arc::clone(&supervisor));
        guard.release().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_guard_drop_kills() {
        let supervisor =
            ProcessSupervisor::new(Arc::new(sh_config("echo 'ready in 1ms'; sleep 30", 5)));
        supervisor.start().await.unwrap();

        drop(ShutdownGuard::new(Arc::clone(&supervisor)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_http_probe_marks_silent_server_ready() {
        let mut config = sh_config("sleep 30", 10);
        config.readiness_probe = true;
        let port = config.port;
        let supervisor = ProcessSupervisor::new(Arc::new(config));

        let starter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.start().await })
        };

        // Bind only once the port precheck has passed and the child is up
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.pid().is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(supervisor.pid().is_some());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(5), starter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok(), "start failed: {:?}", result);
        assert_eq!(supervisor.state(), SupervisorState::Running);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_env_reaches_child() {
        let mut env = std::collections::HashMap::new();
        env.insert("DEVGATE_TEST_READY".to_string(), "42ms".to_string());
        let config = sh_config("echo \"ready in $DEVGATE_TEST_READY\"; sleep 30", 3)
            .with_env(env)
            .with_readiness_patterns(["ready in 42ms"]);
        let supervisor = ProcessSupervisor::new(Arc::new(config));

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_right_after_start_begins_is_prompt() {
        let supervisor = ProcessSupervisor::new(Arc::new(sh_config("sleep 30", 30)));

        let started = Instant::now();
        let starter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.start().await })
        };

        // Starting is visible from the first await of start(), before the port precheck
        while supervisor.state() == SupervisorState::Stopped {
            tokio::task::yield_now().await;
        }
        supervisor.stop().await;

        let result = starter.await.unwrap();
        assert!(matches!(result, Err(StartError::Cancelled)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.pid().is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stop_after_dropped_start_kills_child() {
        let supervisor = ProcessSupervisor::new(Arc::new(sh_config("sleep 30", 30)));

        // Abandon the start future once the child exists, as a signal racing start would
        let spawned = tokio::time::timeout(Duration::from_secs(2), async {
            let start = supervisor.start();
            tokio::pin!(start);
            loop {
                tokio::select! {
                    _ = &mut start => return false,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {
                        if supervisor.pid().is_some() {
                            return true;
                        }
                    }
                }
            }
        })
        .await;
        assert!(spawned.unwrap(), "start() finished before the child spawned");

        let pid = supervisor.pid().unwrap();
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.pid().is_none());

        #[cfg(unix)]
        assert_ne!(unsafe { libc::kill(pid as i32, 0) }, 0, "child {} survived", pid);
        #[cfg(not(unix))]
        let _ = pid;
    }
}
