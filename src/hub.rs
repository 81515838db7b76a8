//! The orchestration engine
//!
//! The hub owns the environment registry and drives every lifecycle
//! transition: provisioning builds in the background, starting and stopping
//! payload servers, deleting environments, and keeping the reverse-proxy
//! configuration consistent with the set of running servers. It is the sole
//! writer of proxy state; container backends never touch the proxy.

use crate::config::Config;
use crate::container::Container;
use crate::environment::{Environment, EnvironmentDefinition, EnvironmentStatus};
use crate::error::HubError;
use crate::nginx::{self, ProxyControl, RouteBlock};
use crate::ports::allocate_ports;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Time between SIGINT and a hard kill when stopping a payload server
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Connect/read timeout for a single liveness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Stateful orchestrator for environment sandboxes.
///
/// # Usage
///
/// `Hub` is shared across async tasks behind an `Arc`; [`new`](Hub::new)
/// returns `Arc<Self>` directly to enforce this. Operations that spawn
/// background work (environment builds) take `self: &Arc<Self>`.
pub struct Hub {
    /// Registry of environments keyed by name
    environments: DashMap<String, Mutex<Environment>>,
    /// Serializes proxy configuration writes
    conf_lock: tokio::sync::Mutex<()>,
    /// Backend selected once at startup, used uniformly thereafter
    container: Container,
    /// Reverse-proxy process control
    proxy: ProxyControl,
    config: Config,
}

impl Hub {
    pub fn new(config: Config) -> Arc<Self> {
        let container = Container::new(
            config.server.backend,
            config.tools.clone(),
            config.payload.clone(),
        );
        let proxy = ProxyControl::new(config.tools.proxy.clone());
        Arc::new(Self {
            environments: DashMap::new(),
            conf_lock: tokio::sync::Mutex::new(()),
            container,
            proxy,
            config,
        })
    }

    /// Boot: recover prior environments from disk, write an initial routeless
    /// proxy configuration, and launch the proxy process.
    ///
    /// Recovery is per-subdirectory and best-effort; a directory the backend
    /// cannot interpret is logged and skipped. No servers are started.
    pub async fn start(&self) -> Result<(), HubError> {
        let env_dir = &self.config.server.environments_dir;
        if tokio::fs::try_exists(env_dir).await.unwrap_or(false) {
            let mut entries = tokio::fs::read_dir(env_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let path = entry.path();
                match self.container.from_existing(&path).await {
                    Ok(env) => {
                        info!(name = %env.name, id = %env.id, "Recovered environment");
                        self.environments.insert(env.name.clone(), Mutex::new(env));
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unrecoverable environment directory");
                    }
                }
            }
        }

        self.write_proxy_config().await?;
        self.proxy.start();
        Ok(())
    }

    /// Shut down: stop every running server concurrently (best-effort, one
    /// failure never blocks the rest), then ask the proxy to stop.
    pub async fn stop(&self) {
        let names: Vec<String> = self.environments.iter().map(|e| e.key().clone()).collect();
        let stops = names.into_iter().map(|name| async move {
            if let Err(e) = self.stop_server_inner(&name, false).await {
                warn!(name, error = %e, "Failed to stop payload server during shutdown");
            }
        });
        futures::future::join_all(stops).await;

        self.proxy.stop().await;
    }

    /// Register a new environment from its YAML manifest and schedule its
    /// build in the background.
    ///
    /// Idempotent by name: if a build is already in flight or the
    /// environment's directory exists on disk, this logs and returns
    /// without error. A registered environment whose directory is missing
    /// means the previous build failed; a repeat create re-runs the build
    /// under the original id. Returns once the build is scheduled, not once
    /// it finishes; progress is visible through
    /// [`environment_status`](Hub::environment_status).
    pub async fn create_environment(self: &Arc<Self>, manifest_yaml: &str) -> Result<(), HubError> {
        let mut definition = EnvironmentDefinition::parse(manifest_yaml)?;
        let name = definition.name.clone();
        let path = self.config.server.environments_dir.join(&name);
        definition.append_dependencies(&self.config.payload.dependencies);

        let built = tokio::fs::try_exists(&path).await.unwrap_or(false);

        if let Some(entry) = self.environments.get(&name) {
            let id = {
                let mut env = entry.lock();
                if env.create_time.is_some() {
                    info!(name, "Environment build already in flight");
                    return Ok(());
                }
                if built || env.process.is_some() {
                    info!(name, "Environment already exists");
                    return Ok(());
                }
                // Registered but never materialized on disk: the previous
                // build failed. Re-arm the build, keeping the original id.
                env.definition = Some(definition.clone());
                env.create_time = Some(0);
                env.id.clone()
            };
            drop(entry);

            info!(name, id, "Re-running failed environment build");
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                hub.run_build(name, id, path, definition).await;
            });
            return Ok(());
        }

        if built {
            info!(name, "Environment already exists on disk");
            return Ok(());
        }

        let id = Uuid::new_v4().to_string();
        match self.environments.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a create/create race on the same name
                info!(name, "Environment already exists");
                return Ok(());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(name, id, "Creating environment");
                slot.insert(Mutex::new(Environment::building(
                    name.clone(),
                    id.clone(),
                    path.clone(),
                    definition.clone(),
                )));
            }
        }

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.run_build(name, id, path, definition).await;
        });
        Ok(())
    }

    /// Run a build and its creation timer as one cancellable unit: the
    /// timer lives exactly as long as the build, no longer.
    async fn run_build(
        &self,
        name: String,
        id: String,
        path: PathBuf,
        definition: EnvironmentDefinition,
    ) {
        let result = tokio::select! {
            result = self.container.build_environment(&id, &path, &definition) => result,
            _ = self.creation_timer(&name) => unreachable!("creation timer never completes"),
        };

        // The timer must be torn down and create_time cleared whether the
        // build succeeded or not
        if let Some(entry) = self.environments.get(&name) {
            let mut env = entry.lock();
            env.create_time = None;
            if result.is_ok() {
                env.definition = None;
            }
        }

        match result {
            Ok(()) => info!(name, "Environment built"),
            Err(e) => error!(name, error = %e, "Environment build failed"),
        }
    }

    /// Tick the environment's elapsed-build counter once per second. Purely
    /// for progress display; cancelled by `run_build` when the build ends.
    async fn creation_timer(&self, name: &str) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(entry) = self.environments.get(name) {
                let mut env = entry.lock();
                if let Some(secs) = env.create_time.as_mut() {
                    *secs += 1;
                }
            }
        }
    }

    /// Start the environment's payload server and block until it answers a
    /// liveness probe.
    ///
    /// The port is published to the registry and the proxy configuration is
    /// written and reloaded *before* probing begins, so routing is already
    /// correct the instant the server becomes reachable. If the server never
    /// responds within the configured startup timeout it is stopped again
    /// and [`HubError::StartupTimeout`] is returned.
    pub async fn start_server(&self, name: &str) -> Result<(), HubError> {
        let (cmd, port) = {
            let entry = self
                .environments
                .get(name)
                .ok_or_else(|| HubError::UnknownEnvironment(name.to_string()))?;
            let env = entry.lock();
            if env.create_time.is_some() {
                return Err(HubError::EnvironmentBuilding(name.to_string()));
            }
            if env.process.is_some() {
                debug!(name, "Payload server already running");
                return Ok(());
            }
            let port = allocate_ports(1)?[0];
            (self.container.server_command(&env, port), port)
        };

        info!(name, port, "Starting payload server");
        let parts = shell_words::split(&cmd).map_err(|e| {
            HubError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unparseable server command: {}", e),
            ))
        })?;
        let (program, args) = parts.split_first().ok_or_else(|| {
            HubError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty server command",
            ))
        })?;
        let mut child = Command::new(program).args(args).spawn()?;

        // Publish port and process before the config write so the rendered
        // config can include this route
        match self.environments.get(name) {
            Some(entry) => {
                let mut env = entry.lock();
                env.port = Some(port);
                env.process = Some(child);
            }
            None => {
                // Deleted out from under us; don't leak the subprocess
                let _ = child.kill().await;
                return Err(HubError::UnknownEnvironment(name.to_string()));
            }
        }

        self.write_proxy_config().await?;
        self.proxy.reload().await;

        match self.wait_until_live(port).await {
            Ok(()) => {
                info!(name, port, "Payload server is live");
                Ok(())
            }
            Err(e) => {
                warn!(name, port, "Payload server never became live, stopping it");
                let _ = self.stop_server_inner(name, true).await;
                Err(e)
            }
        }
    }

    /// Probe the payload server with short-interval HTTP GETs, swallowing
    /// connection errors, until it responds or the startup timeout elapses.
    async fn wait_until_live(&self, port: u16) -> Result<(), HubError> {
        let timeout = self.config.payload.startup_timeout();
        let interval = self.config.payload.probe_interval();
        let start = Instant::now();

        loop {
            tokio::time::sleep(interval).await;
            if probe(port).await {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(HubError::StartupTimeout {
                    port,
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
    }

    /// Stop the environment's payload server. No-op if nothing is running;
    /// otherwise blocks until the tracked process has fully exited, then
    /// regenerates the proxy configuration.
    pub async fn stop_server(&self, name: &str) -> Result<(), HubError> {
        self.stop_server_inner(name, true).await
    }

    async fn stop_server_inner(&self, name: &str, reload_proxy: bool) -> Result<(), HubError> {
        let mut child = {
            let entry = self
                .environments
                .get(name)
                .ok_or_else(|| HubError::UnknownEnvironment(name.to_string()))?;
            let mut env = entry.lock();
            match env.process.take() {
                Some(child) => child,
                None => return Ok(()),
            }
        };

        info!(name, "Stopping payload server");

        // The tracked handle is the shell wrapper, not the payload itself;
        // interrupt its direct child and let the wrapper wind down
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            interrupt_payload(pid);
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(name, %status, "Payload server exited"),
            Ok(Err(e)) => warn!(name, error = %e, "Error waiting for payload server to exit"),
            Err(_) => {
                warn!(
                    name,
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "Grace period exceeded, killing payload server"
                );
                let _ = child.kill().await;
            }
        }

        if let Some(entry) = self.environments.get(name) {
            entry.lock().port = None;
        }

        self.write_proxy_config().await?;
        if reload_proxy {
            self.proxy.reload().await;
        }
        Ok(())
    }

    /// Delete the environment: stop its server first, drop the registry
    /// entry, remove its directory, and regenerate the proxy configuration.
    /// Refused while a build is in flight.
    pub async fn delete_environment(&self, name: &str) -> Result<(), HubError> {
        {
            let entry = self
                .environments
                .get(name)
                .ok_or_else(|| HubError::UnknownEnvironment(name.to_string()))?;
            if entry.lock().create_time.is_some() {
                return Err(HubError::EnvironmentBuilding(name.to_string()));
            }
        }

        self.stop_server_inner(name, true).await?;

        info!(name, "Deleting environment");
        let path = match self.environments.remove(name) {
            Some((_, entry)) => entry.into_inner().path,
            None => return Ok(()),
        };

        // Recursive removal is blocking work; keep it off the scheduler
        let removed = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
            .await
            .map_err(|e| HubError::Io(std::io::Error::other(e)))?;
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.write_proxy_config().await?;
        Ok(())
    }

    /// Regenerate the proxy configuration file from scratch.
    ///
    /// Writers serialize through one mutex so concurrent start/stop cannot
    /// interleave partial writes; the route set is snapshotted from the
    /// registry under that mutex, so a write that runs after a later state
    /// change simply reflects the newer state.
    pub async fn write_proxy_config(&self) -> Result<(), HubError> {
        let _guard = self.conf_lock.lock().await;

        let mut routes: Vec<RouteBlock> = self
            .environments
            .iter()
            .filter_map(|entry| {
                let env = entry.value().lock();
                env.port.map(|port| RouteBlock {
                    id: env.id.clone(),
                    port,
                })
            })
            .collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));

        let conf = nginx::render_config(
            self.config.server.proxy_port,
            self.config.server.hub_port,
            &self.config.payload.base_path,
            &routes,
        );
        nginx::write_atomic(&self.config.server.proxy_conf_path, conf).await?;
        debug!(routes = routes.len(), "Proxy configuration written");
        Ok(())
    }

    /// Snapshot of every registered environment, for status display
    pub fn list_environments(&self) -> Vec<EnvironmentStatus> {
        let mut statuses: Vec<EnvironmentStatus> = self
            .environments
            .iter()
            .map(|entry| EnvironmentStatus::from(&*entry.value().lock()))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Snapshot of one environment, if registered
    pub fn environment_status(&self, name: &str) -> Option<EnvironmentStatus> {
        self.environments
            .get(name)
            .map(|entry| EnvironmentStatus::from(&*entry.value().lock()))
    }
}

/// Send a single HTTP GET to the payload port and report whether anything
/// answered. Connection errors and timeouts are swallowed.
async fn probe(port: u16) -> bool {
    let addr = format!("127.0.0.1:{}", port);

    let connect = tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", addr);
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read = tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    matches!(read, Ok(Ok(line)) if line.starts_with("HTTP/"))
}

/// Interrupt the payload server hiding behind the tracked shell wrapper.
/// Falls back to signalling the wrapper itself when no child is visible
/// (the shell may have exec'd into the payload).
#[cfg(unix)]
fn interrupt_payload(shell_pid: u32) {
    let target = direct_child_pid(shell_pid).unwrap_or(shell_pid as i32);
    debug!(shell_pid, target, "Sending SIGINT to payload server");
    unsafe {
        libc::kill(target, libc::SIGINT);
    }
}

/// First direct child of `pid`, per procfs. Returns `None` off Linux or when
/// the process has no children.
#[cfg(unix)]
fn direct_child_pid(pid: u32) -> Option<i32> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    let children = std::fs::read_to_string(path).ok()?;
    children.split_whitespace().next()?.parse().ok()
}
