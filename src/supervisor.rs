//! Process Supervisor (component B) — spawns, stops, and restarts backend
//! child processes, tracking each one's lifecycle state.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;

use crate::descriptor::BackendDescriptor;
use crate::error::{GatewayError, Result};
use crate::logging::GatewayEvent;

const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const FORCE_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    #[serde(skip)]
    pub stopped_at: Option<Instant>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

struct ProcessRecord {
    descriptor: BackendDescriptor,
    info: ProcessInfo,
}

/// Why a child was stopped, for the `ServerStopped` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    Forced,
}

/// A request delivered to a child's owning task: stop it gracefully and
/// report back how it ended.
struct StopRequest {
    reply: oneshot::Sender<StopReason>,
}

/// The stdin/stdout half of a running child, handed out to the adapter (C)
/// so it can translate HTTP requests without ever touching the `Child`
/// handle itself. Taken out of the `Child` before it is moved into
/// `run_child`, so `wait()`/`kill()` keep working once these are in use.
pub struct StdioChannel {
    stdin: Mutex<ChildStdin>,
    stdout_lines: Mutex<Lines<BufReader<ChildStdout>>>,
}

impl StdioChannel {
    /// Serialises one request at a time per the single-in-flight-request
    /// design: a per-child lock guards the whole write+read round trip.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next non-empty line from the child's stdout, or `None` on EOF.
    pub async fn next_line(&self) -> Result<Option<String>> {
        let mut lines = self.stdout_lines.lock().await;
        Ok(lines.next_line().await?)
    }
}

pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay: DEFAULT_RESTART_DELAY,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Owns every managed child process and its lifecycle record.
///
/// Each live child is driven by its own task (`run_child`), which is the
/// sole owner of the `tokio::process::Child` value. The supervisor talks to
/// that task through a one-shot "please stop" channel rather than sharing
/// the `Child` handle, so a graceful shutdown never blocks a concurrent
/// status read. The child's stdin/stdout are taken out before the handle
/// moves into that task and handed to callers as a [`StdioChannel`] — the
/// adapter (C) reaches a child only through that accessor, never through a
/// shared `Child`, so a restart can't leave it holding a dangling handle.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    records: RwLock<HashMap<String, ProcessRecord>>,
    stop_handles: Mutex<HashMap<String, mpsc::Sender<StopRequest>>>,
    stdio_channels: RwLock<HashMap<String, Arc<StdioChannel>>>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, events: mpsc::UnboundedSender<GatewayEvent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: RwLock::new(HashMap::new()),
            stop_handles: Mutex::new(HashMap::new()),
            stdio_channels: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn with_defaults(events: mpsc::UnboundedSender<GatewayEvent>) -> Arc<Self> {
        Self::new(SupervisorConfig::default(), events)
    }

    /// Spawn `descriptor`'s child, optionally on `port`. Idempotent against
    /// a record already `running` or `starting`.
    pub async fn start_server(self: &Arc<Self>, descriptor: BackendDescriptor, port: Option<u16>) -> Result<()> {
        descriptor.validate_spawnable()?;

        {
            let records = self.records.read().await;
            if let Some(rec) = records.get(&descriptor.name) {
                if matches!(rec.info.state, ProcessState::Running | ProcessState::Starting) {
                    return Ok(());
                }
            }
        }

        {
            let mut records = self.records.write().await;
            let entry = records
                .entry(descriptor.name.clone())
                .or_insert_with(|| ProcessRecord {
                    descriptor: descriptor.clone(),
                    info: ProcessInfo {
                        name: descriptor.name.clone(),
                        state: ProcessState::Idle,
                        pid: None,
                        port,
                        started_at: None,
                        stopped_at: None,
                        restart_count: 0,
                        last_error: None,
                    },
                });
            entry.info.state = ProcessState::Starting;
            entry.info.last_error = None;
            entry.info.started_at = Some(Instant::now());
            entry.info.port = port.or(entry.info.port);
        }

        self.spawn_and_supervise(descriptor, port).await
    }

    async fn spawn_and_supervise(self: &Arc<Self>, descriptor: BackendDescriptor, port: Option<u16>) -> Result<()> {
        let command = descriptor
            .command
            .clone()
            .ok_or_else(|| GatewayError::NoCommand(descriptor.name.clone()))?;

        let mut cmd = Command::new(&command);
        cmd.args(&descriptor.args)
            .envs(std::env::vars())
            .envs(descriptor.env.clone())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(p) = port {
            cmd.env("PORT", p.to_string());
            cmd.env("MCP_PORT", p.to_string());
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.mark_failed(&descriptor.name, e.to_string()).await;
                self.maybe_schedule_restart(descriptor.clone(), port).await;
                return Err(GatewayError::Io(e));
            }
        };

        let pid = child.id();

        // Take stdin/stdout out before the child is handed to its owning
        // task, so the adapter can reach them through us without ever
        // sharing the `Child` handle (wait()/kill() still work on what's
        // left of `child`).
        if let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) {
            let channel = Arc::new(StdioChannel {
                stdin: Mutex::new(stdin),
                stdout_lines: Mutex::new(BufReader::new(stdout).lines()),
            });
            self.stdio_channels.write().await.insert(descriptor.name.clone(), channel);
        }

        // `Command::spawn()` returning `Ok` already *is* the "spawn" event —
        // tokio's spawn is synchronous, the OS has the process by the time we
        // get here, unlike a platform where spawn is reported asynchronously
        // on a later tick. So a successful spawn commits to `running`
        // immediately rather than waiting out `startupTimeout`; the timeout
        // only bounds the narrow race where the child exits before we ever
        // get to look (a bad exec, a script that errors on load), checked
        // here with one non-blocking poll rather than a multi-second wait.
        tokio::task::yield_now().await;
        match child.try_wait() {
            Ok(None) => {
                let (stop_tx, stop_rx) = mpsc::channel(1);
                self.stop_handles.lock().await.insert(descriptor.name.clone(), stop_tx);
                {
                    let mut records = self.records.write().await;
                    if let Some(rec) = records.get_mut(&descriptor.name) {
                        rec.info.state = ProcessState::Running;
                        rec.info.pid = pid;
                    }
                }
                let _ = self.events.send(GatewayEvent::ServerStarted { name: descriptor.name.clone() });

                let me = self.clone();
                let desc = descriptor.clone();
                tokio::spawn(async move {
                    me.run_child(desc, child, port, stop_rx).await;
                });
                Ok(())
            }
            Ok(Some(status)) => {
                let msg = status.to_string();
                self.mark_failed(&descriptor.name, msg.clone()).await;
                self.maybe_schedule_restart(descriptor.clone(), port).await;
                Err(GatewayError::ExitedDuringStartup(descriptor.name.clone(), msg))
            }
            Err(e) => {
                self.mark_failed(&descriptor.name, e.to_string()).await;
                self.maybe_schedule_restart(descriptor.clone(), port).await;
                Err(GatewayError::Io(e))
            }
        }
    }

    /// The sole owner of a running child for its entire lifetime: either it
    /// exits on its own (crash → auto-restart policy) or a `StopRequest`
    /// arrives (graceful stop, escalating to a hard kill on timeout).
    async fn run_child(
        self: Arc<Self>,
        descriptor: BackendDescriptor,
        mut child: Child,
        port: Option<u16>,
        mut stop_rx: mpsc::Receiver<StopRequest>,
    ) {
        tokio::select! {
            status = child.wait() => {
                self.stop_handles.lock().await.remove(&descriptor.name);
                let still_running = {
                    let records = self.records.read().await;
                    records.get(&descriptor.name).map(|r| r.info.state) == Some(ProcessState::Running)
                };
                if !still_running {
                    return;
                }
                let msg = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                self.mark_failed(&descriptor.name, msg).await;
                let _ = self.events.send(GatewayEvent::ServerCrashed { name: descriptor.name.clone() });
                self.maybe_schedule_restart(descriptor, port).await;
            }
            Some(req) = stop_rx.recv() => {
                self.stop_handles.lock().await.remove(&descriptor.name);
                self.stdio_channels.write().await.remove(&descriptor.name);
                send_sigterm(child.id());
                let reason = match timeout(self.config.shutdown_timeout, child.wait()).await {
                    Ok(_) => StopReason::Manual,
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = timeout(FORCE_KILL_GRACE, child.wait()).await;
                        StopReason::Forced
                    }
                };
                let mut records = self.records.write().await;
                if let Some(rec) = records.get_mut(&descriptor.name) {
                    rec.info.state = ProcessState::Stopped;
                    rec.info.stopped_at = Some(Instant::now());
                    rec.info.pid = None;
                }
                drop(records);
                let _ = self.events.send(GatewayEvent::ServerStopped {
                    name: descriptor.name.clone(),
                    reason: format!("{reason:?}").to_lowercase(),
                });
                let _ = req.reply.send(reason);
            }
        }
    }

    async fn mark_failed(&self, name: &str, error: String) {
        let mut records = self.records.write().await;
        if let Some(rec) = records.get_mut(name) {
            rec.info.state = ProcessState::Failed;
            rec.info.last_error = Some(error);
            rec.info.stopped_at = Some(Instant::now());
            rec.info.pid = None;
        }
        drop(records);
        self.stdio_channels.write().await.remove(name);
    }

    /// The adapter's only window into a running child: the stdin/stdout
    /// half, handed out for as long as the backend stays `running`. Gone
    /// once the child stops, crashes, or is restarted (a fresh channel is
    /// installed for the new child on the next successful spawn).
    pub async fn stdio_channel(&self, name: &str) -> Option<Arc<StdioChannel>> {
        self.stdio_channels.read().await.get(name).cloned()
    }

    async fn maybe_schedule_restart(self: &Arc<Self>, descriptor: BackendDescriptor, port: Option<u16>) {
        if !descriptor.restart {
            return;
        }
        let should_restart = {
            let mut records = self.records.write().await;
            match records.get_mut(&descriptor.name) {
                Some(rec) if rec.info.restart_count < self.config.max_restarts => {
                    rec.info.restart_count += 1;
                    true
                }
                _ => false,
            }
        };
        if !should_restart {
            return;
        }
        let me = self.clone();
        let delay = self.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = me.start_server(descriptor, port).await;
        });
    }

    /// Stop a backend's child, waiting gracefully then forcing. No-op if
    /// the record is already stopped/stopping or has no live child.
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        let should_stop = {
            let records = self.records.read().await;
            match records.get(name) {
                Some(rec) => !matches!(rec.info.state, ProcessState::Stopped | ProcessState::Stopping),
                None => false,
            }
        };
        if !should_stop {
            return Ok(());
        }

        let stop_tx = { self.stop_handles.lock().await.get(name).cloned() };
        let Some(stop_tx) = stop_tx else {
            // no owning task (never spawned, or already exited) — mark stopped directly.
            let mut records = self.records.write().await;
            if let Some(rec) = records.get_mut(name) {
                rec.info.state = ProcessState::Stopped;
                rec.info.stopped_at = Some(Instant::now());
                rec.info.pid = None;
            }
            return Ok(());
        };

        {
            let mut records = self.records.write().await;
            if let Some(rec) = records.get_mut(name) {
                rec.info.state = ProcessState::Stopping;
            }
        }

        let (reply, done) = oneshot::channel();
        if stop_tx.send(StopRequest { reply }).await.is_ok() {
            let _ = done.await;
        }
        Ok(())
    }

    /// Stop (if live), reset the restart count, then start again on the
    /// same port.
    pub async fn restart_server(self: &Arc<Self>, name: &str) -> Result<()> {
        let (descriptor, port) = {
            let records = self.records.read().await;
            let rec = records.get(name).ok_or_else(|| {
                GatewayError::InvalidConfig(name.to_string(), "no such backend".into())
            })?;
            (rec.descriptor.clone(), rec.info.port)
        };

        self.stop_server(name).await?;

        {
            let mut records = self.records.write().await;
            if let Some(rec) = records.get_mut(name) {
                rec.info.restart_count = 0;
            }
        }

        self.start_server(descriptor, port).await
    }

    pub async fn process_info(&self, name: &str) -> Option<ProcessInfo> {
        self.records.read().await.get(name).map(|r| r.info.clone())
    }

    pub async fn all_processes(&self) -> Vec<ProcessInfo> {
        self.records.read().await.values().map(|r| r.info.clone()).collect()
    }

    pub async fn running_processes(&self) -> Vec<ProcessInfo> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.info.state == ProcessState::Running)
            .map(|r| r.info.clone())
            .collect()
    }

    pub async fn failed_processes(&self) -> Vec<ProcessInfo> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.info.state == ProcessState::Failed)
            .map(|r| r.info.clone())
            .collect()
    }

    pub async fn stop_all_servers(&self) {
        let names: Vec<String> = self.records.read().await.keys().cloned().collect();
        let stops = names.into_iter().map(|name| async move {
            let _ = self.stop_server(&name).await;
        });
        futures::future::join_all(stops).await;
    }
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe {
        kill(pid as i32, 15);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DetectedType, Protocol};
    use std::collections::HashMap as StdHashMap;

    fn echo_descriptor(name: &str, restart: bool) -> BackendDescriptor {
        BackendDescriptor::new(
            name,
            Protocol::Stdio,
            DetectedType::Custom,
            Some("node".to_string()),
            vec!["-e".into(), "setTimeout(()=>{}, 60000)".into()],
            StdHashMap::new(),
            None,
            restart,
            None,
        )
    }

    #[tokio::test]
    async fn http_descriptor_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::with_defaults(tx);
        let d = BackendDescriptor::new(
            "api", Protocol::Http, DetectedType::Http, None, vec![], StdHashMap::new(),
            Some("http://localhost".into()), false, None,
        );
        assert!(matches!(sup.start_server(d, None).await, Err(GatewayError::HttpNotSpawnable(_))));
    }

    #[tokio::test]
    async fn missing_command_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::with_defaults(tx);
        let d = BackendDescriptor::new(
            "mem", Protocol::Stdio, DetectedType::Custom, None, vec![], StdHashMap::new(), None, false, None,
        );
        assert!(matches!(sup.start_server(d, None).await, Err(GatewayError::NoCommand(_))));
    }

    #[tokio::test]
    async fn stop_unknown_server_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::with_defaults(tx);
        assert!(sup.stop_server("ghost").await.is_ok());
    }

    #[tokio::test]
    async fn restart_count_never_exceeds_max_restarts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cfg = SupervisorConfig {
            max_restarts: 2,
            restart_delay: Duration::from_millis(1),
            ..SupervisorConfig::default()
        };
        let sup = ProcessSupervisor::new(cfg, tx);
        let d = echo_descriptor("flaky", true);
        {
            let mut records = sup.records.write().await;
            records.insert(
                d.name.clone(),
                ProcessRecord {
                    descriptor: d.clone(),
                    info: ProcessInfo {
                        name: d.name.clone(),
                        state: ProcessState::Failed,
                        pid: None,
                        port: None,
                        started_at: None,
                        stopped_at: None,
                        restart_count: 2,
                        last_error: None,
                    },
                },
            );
        }
        sup.maybe_schedule_restart(d.clone(), None).await;
        let info = sup.process_info(&d.name).await.unwrap();
        assert_eq!(info.restart_count, 2);
    }
}
