//! Docker-backed container runtime, one per DO instance of a
//! container-enabled class.
//!
//! The runtime drives the `docker` CLI: build (with an mtime cache when the
//! image is a Dockerfile path), run with per-instance host ports, a 500 ms
//! health-check loop, a 2 s inspect monitor, and an activity timeout that
//! stops idle containers. Every started container is registered globally so
//! SIGINT/SIGTERM/exit can force-remove whatever is still alive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context as _, Result};
use once_cell::sync::Lazy;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::http_types::{Body, WorkerRequest, WorkerResponse};
use crate::storage::now_ms;

const HEALTH_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
const STOP_WAIT_SECS: u32 = 10;

// ─── Global cleanup registry ──────────────────────────────────────────────────

static LIVE_CONTAINERS: Lazy<StdMutex<HashSet<String>>> =
    Lazy::new(|| StdMutex::new(HashSet::new()));

fn register_container(name: &str) {
    LIVE_CONTAINERS
        .lock()
        .expect("container registry")
        .insert(name.to_string());
}

fn unregister_container(name: &str) {
    LIVE_CONTAINERS
        .lock()
        .expect("container registry")
        .remove(name);
}

/// Force-remove every live container. Called from the signal handlers and
/// process teardown; intentionally synchronous and best-effort.
pub fn cleanup_all_containers() {
    let names: Vec<String> = LIVE_CONTAINERS
        .lock()
        .expect("container registry")
        .drain()
        .collect();
    for name in names {
        let _ = std::process::Command::new("docker")
            .args(["rm", "-f", &name])
            .output();
    }
}

// ─── Spec & state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image name, or a path to a Dockerfile to build.
    pub image: String,
    /// The container port traffic is forwarded to by default.
    pub default_port: u16,
    /// Additional container ports that must be mapped.
    pub required_ports: Vec<u16>,
    pub env: HashMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub args: Vec<String>,
    pub enable_internet: bool,
    /// Health-check path, e.g. `/healthz`.
    pub ping_endpoint: String,
    pub sleep_after: Option<Duration>,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            default_port: 8080,
            required_ports: Vec::new(),
            env: HashMap::new(),
            entrypoint: None,
            args: Vec::new(),
            enable_internet: true,
            ping_endpoint: "/".to_string(),
            sleep_after: None,
        }
    }
}

/// Parse a `sleepAfter` value: `"30s"`, `"5m"`, `"2h"`, or bare seconds.
pub fn parse_sleep_after(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let n: u64 = number
        .parse()
        .with_context(|| format!("invalid sleepAfter '{value}'"))?;
    match unit {
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(anyhow!("invalid sleepAfter unit '{unit}'")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Stopped,
    Running,
    Healthy,
    Stopping,
    StoppedWithCode,
}

#[derive(Debug, Clone)]
pub struct ContainerState {
    pub status: ContainerStatus,
    /// Epoch ms of the last transition.
    pub last_change: i64,
    pub exit_code: Option<i64>,
    /// container port → allocated host port.
    pub ports: HashMap<u16, u16>,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            status: ContainerStatus::Stopped,
            last_change: now_ms(),
            exit_code: None,
            ports: HashMap::new(),
        }
    }
}

type StopCallback = Box<dyn Fn(Option<i64>) + Send + Sync>;

struct RuntimeInner {
    spec: ContainerSpec,
    name: String,
    state: StdMutex<ContainerState>,
    http: reqwest::Client,
    timers: StdMutex<Vec<JoinHandle<()>>>,
    last_activity: StdMutex<i64>,
    on_stop: StdMutex<Option<StopCallback>>,
    monitor_done: Notify,
}

#[derive(Clone)]
pub struct ContainerRuntime {
    inner: Arc<RuntimeInner>,
}

/// Dockerfile build cache: path → (mtime, image tag).
static BUILD_CACHE: Lazy<StdMutex<HashMap<PathBuf, (SystemTime, String)>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

impl ContainerRuntime {
    pub fn new(spec: ContainerSpec, instance_id: &str) -> Self {
        let short = &instance_id[..instance_id.len().min(8)];
        let name = format!("bunflare-{}-{short}", sanitize_image(&spec.image));
        Self {
            inner: Arc::new(RuntimeInner {
                spec,
                name,
                state: StdMutex::new(ContainerState::default()),
                http: reqwest::Client::builder()
                    .timeout(HEALTH_TIMEOUT)
                    .build()
                    .expect("reqwest client"),
                timers: StdMutex::new(Vec::new()),
                last_activity: StdMutex::new(now_ms()),
                on_stop: StdMutex::new(None),
                monitor_done: Notify::new(),
            }),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ContainerState {
        self.inner.state.lock().expect("state lock").clone()
    }

    pub fn set_on_stop(&self, cb: StopCallback) {
        *self.inner.on_stop.lock().expect("on_stop lock") = Some(cb);
    }

    fn transition(&self, status: ContainerStatus, exit_code: Option<i64>) {
        let mut state = self.inner.state.lock().expect("state lock");
        state.status = status;
        state.last_change = now_ms();
        if exit_code.is_some() {
            state.exit_code = exit_code;
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Build (if needed), run, and begin health/monitor/activity loops.
    pub async fn start(&self) -> Result<()> {
        {
            let state = self.inner.state.lock().expect("state lock");
            if !matches!(
                state.status,
                ContainerStatus::Stopped | ContainerStatus::StoppedWithCode
            ) {
                return Ok(());
            }
        }

        let result = self.start_inner().await;
        if let Err(ref e) = result {
            warn!(container = %self.inner.name, err = %e, "container start failed");
            self.transition(ContainerStatus::Stopped, None);
        }
        result
    }

    async fn start_inner(&self) -> Result<()> {
        let image = self.resolve_image().await?;

        let mut ports = HashMap::new();
        let mut container_ports = vec![self.inner.spec.default_port];
        container_ports.extend(&self.inner.spec.required_ports);
        container_ports.dedup();
        for port in container_ports {
            ports.insert(port, allocate_host_port()?);
        }

        // A stale container with the same name blocks `docker run`.
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.inner.name])
            .output()
            .await;

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &self.inner.name]);
        for (container_port, host_port) in &ports {
            cmd.args(["-p", &format!("127.0.0.1:{host_port}:{container_port}")]);
        }
        for (key, value) in &self.inner.spec.env {
            cmd.args(["-e", &format!("{key}={value}")]);
        }
        if !self.inner.spec.enable_internet {
            cmd.args(["--network", "none"]);
        }
        if let Some(entrypoint) = &self.inner.spec.entrypoint {
            if let Some(first) = entrypoint.first() {
                cmd.args(["--entrypoint", first]);
            }
        }
        cmd.arg(&image);
        if let Some(entrypoint) = &self.inner.spec.entrypoint {
            cmd.args(entrypoint.iter().skip(1));
        }
        cmd.args(&self.inner.spec.args);

        let output = cmd.output().await.context("failed to spawn docker")?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.status = ContainerStatus::Running;
            state.last_change = now_ms();
            state.exit_code = None;
            state.ports = ports;
        }
        *self.inner.last_activity.lock().expect("activity lock") = now_ms();
        register_container(&self.inner.name);
        info!(container = %self.inner.name, "container started");

        self.spawn_health_loop();
        self.spawn_monitor_loop();
        if self.inner.spec.sleep_after.is_some() {
            self.spawn_activity_loop();
        }
        Ok(())
    }

    /// The image argument may be a Dockerfile path; build it with an
    /// mtime-keyed cache so unchanged files skip the rebuild.
    async fn resolve_image(&self) -> Result<String> {
        let image = &self.inner.spec.image;
        let path = Path::new(image);
        let is_dockerfile = path
            .file_name()
            .map(|f| f.to_string_lossy().contains("Dockerfile"))
            .unwrap_or(false)
            && path.exists();
        if !is_dockerfile {
            return Ok(image.clone());
        }

        let mtime = std::fs::metadata(path)?.modified()?;
        let tag = format!("bunflare-build-{}", sanitize_image(image));
        {
            let cache = BUILD_CACHE.lock().expect("build cache");
            if let Some((cached_mtime, cached_tag)) = cache.get(path) {
                if *cached_mtime == mtime {
                    return Ok(cached_tag.clone());
                }
            }
        }
        let context_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let output = Command::new("docker")
            .args(["build", "-f"])
            .arg(path)
            .args(["-t", &tag])
            .arg(context_dir)
            .output()
            .await
            .context("failed to spawn docker build")?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker build failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        BUILD_CACHE
            .lock()
            .expect("build cache")
            .insert(path.to_path_buf(), (mtime, tag.clone()));
        Ok(tag)
    }

    /// Graceful stop: SIGTERM via `docker stop` with a bounded wait, then
    /// removal.
    pub async fn stop(&self, _signal: i32) -> Result<()> {
        self.transition(ContainerStatus::Stopping, None);
        self.cancel_timers();
        let _ = Command::new("docker")
            .args(["stop", "-t", &STOP_WAIT_SECS.to_string(), &self.inner.name])
            .output()
            .await;
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.inner.name])
            .output()
            .await;
        unregister_container(&self.inner.name);
        self.transition(ContainerStatus::Stopped, None);
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.ports.clear();
        }
        self.fire_on_stop(None);
        Ok(())
    }

    /// Immediate removal without the graceful wait.
    pub async fn destroy(&self) -> Result<()> {
        self.cancel_timers();
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.inner.name])
            .output()
            .await;
        unregister_container(&self.inner.name);
        self.transition(ContainerStatus::Stopped, None);
        self.inner.state.lock().expect("state lock").ports.clear();
        Ok(())
    }

    /// Resolves when the monitor observes the container gone.
    pub async fn monitor(&self) {
        self.inner.monitor_done.notified().await;
    }

    // ── Background loops ──────────────────────────────────────────────────

    fn spawn_health_loop(&self) {
        let this = self.clone();
        self.keep(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                ticker.tick().await;
                let (status, host_port) = {
                    let state = this.inner.state.lock().expect("state lock");
                    (
                        state.status,
                        state.ports.get(&this.inner.spec.default_port).copied(),
                    )
                };
                match status {
                    ContainerStatus::Running => {}
                    // A healthy container never regresses to running.
                    ContainerStatus::Healthy => return,
                    _ => return,
                }
                let Some(port) = host_port else { return };
                let url = format!(
                    "http://localhost:{port}{}",
                    this.inner.spec.ping_endpoint
                );
                if let Ok(resp) = this.inner.http.get(&url).send().await {
                    if resp.status().is_success() {
                        this.transition(ContainerStatus::Healthy, None);
                        info!(container = %this.inner.name, "container healthy");
                        return;
                    }
                }
            }
        }));
    }

    fn spawn_monitor_loop(&self) {
        let this = self.clone();
        self.keep(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                ticker.tick().await;
                let output = Command::new("docker")
                    .args([
                        "inspect",
                        "-f",
                        "{{.State.Status}} {{.State.ExitCode}}",
                        &this.inner.name,
                    ])
                    .output()
                    .await;
                let Ok(output) = output else { continue };
                if !output.status.success() {
                    continue;
                }
                let text = String::from_utf8_lossy(&output.stdout);
                let mut parts = text.split_whitespace();
                let docker_status = parts.next().unwrap_or("");
                let exit_code: Option<i64> = parts.next().and_then(|c| c.parse().ok());
                if matches!(docker_status, "exited" | "dead") {
                    this.transition(ContainerStatus::StoppedWithCode, exit_code);
                    let _ = Command::new("docker")
                        .args(["rm", "-f", &this.inner.name])
                        .output()
                        .await;
                    unregister_container(&this.inner.name);
                    this.fire_on_stop(exit_code);
                    this.inner.monitor_done.notify_waiters();
                    return;
                }
            }
        }));
    }

    fn spawn_activity_loop(&self) {
        let Some(sleep_after) = self.inner.spec.sleep_after else {
            return;
        };
        let this = self.clone();
        self.keep(tokio::spawn(async move {
            loop {
                let last = *this.inner.last_activity.lock().expect("activity lock");
                let deadline = last + sleep_after.as_millis() as i64;
                let now = now_ms();
                if now >= deadline {
                    info!(container = %this.inner.name, "activity timeout; stopping container");
                    let _ = this.stop(15).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis((deadline - now) as u64)).await;
            }
        }));
    }

    fn keep(&self, handle: JoinHandle<()>) {
        self.inner.timers.lock().expect("timers lock").push(handle);
    }

    fn cancel_timers(&self) {
        let mut timers = self.inner.timers.lock().expect("timers lock");
        for handle in timers.drain(..) {
            handle.abort();
        }
    }

    fn fire_on_stop(&self, exit_code: Option<i64>) {
        if let Some(cb) = self.inner.on_stop.lock().expect("on_stop lock").as_ref() {
            cb(exit_code);
        }
    }

    // ── Fetch forwarding ──────────────────────────────────────────────────

    /// Forward a request to the container, rewriting the URL to the
    /// allocated host port. Resets the activity timer.
    pub async fn fetch(&self, req: WorkerRequest, port: Option<u16>) -> Result<WorkerResponse> {
        let container_port = port.unwrap_or(self.inner.spec.default_port);
        let host_port = {
            let state = self.inner.state.lock().expect("state lock");
            state.ports.get(&container_port).copied()
        }
        .ok_or_else(|| anyhow!("container port {container_port} is not exposed"))?;
        *self.inner.last_activity.lock().expect("activity lock") = now_ms();

        let path_and_query = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://localhost:{host_port}{path_and_query}");
        let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())?;
        let mut outgoing = self.inner.http.request(method, &url);
        for (name, value) in &req.headers {
            if name != &http::header::HOST {
                outgoing = outgoing.header(name.as_str(), value.as_bytes());
            }
        }
        if !req.body.is_empty() {
            outgoing = outgoing.body(req.body.clone());
        }
        let response = outgoing.send().await?;

        let mut out = WorkerResponse::new(http::StatusCode::from_u16(response.status().as_u16())?);
        for (name, value) in response.headers() {
            if let (Ok(n), Ok(v)) = (
                http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                http::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out.headers.insert(n, v);
            }
        }
        out.body = Body::from_bytes(response.bytes().await?);
        Ok(out)
    }
}

fn sanitize_image(image: &str) -> String {
    image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn allocate_host_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_after_parsing() {
        assert_eq!(parse_sleep_after("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_sleep_after("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_sleep_after("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_sleep_after("45").unwrap(), Duration::from_secs(45));
        assert!(parse_sleep_after("10d").is_err());
        assert!(parse_sleep_after("").is_err());
    }

    #[test]
    fn image_names_are_sanitized_into_container_names() {
        let runtime = ContainerRuntime::new(
            ContainerSpec {
                image: "registry.example.com/app:v1.2".into(),
                ..Default::default()
            },
            "deadbeef01234567",
        );
        let name = runtime.container_name();
        assert!(name.starts_with("bunflare-registry-example-com-app-v1-2-"));
        assert!(name.ends_with("deadbeef"));
    }

    #[test]
    fn transitions_stamp_last_change_and_exit_code() {
        let runtime = ContainerRuntime::new(ContainerSpec::default(), "abc");
        let before = runtime.state();
        assert_eq!(before.status, ContainerStatus::Stopped);
        runtime.transition(ContainerStatus::StoppedWithCode, Some(137));
        let after = runtime.state();
        assert_eq!(after.status, ContainerStatus::StoppedWithCode);
        assert_eq!(after.exit_code, Some(137));
        assert!(after.last_change >= before.last_change);
    }

    #[tokio::test]
    async fn fetch_requires_an_exposed_port() {
        let runtime = ContainerRuntime::new(ContainerSpec::default(), "abc");
        let err = runtime
            .fetch(WorkerRequest::get("http://container/x"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not exposed"));
    }

    #[test]
    fn allocated_ports_are_distinct_and_nonzero() {
        let a = allocate_host_port().unwrap();
        let b = allocate_host_port().unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn registry_tracks_names() {
        register_container("bunflare-test-x");
        assert!(LIVE_CONTAINERS.lock().unwrap().contains("bunflare-test-x"));
        unregister_container("bunflare-test-x");
        assert!(!LIVE_CONTAINERS.lock().unwrap().contains("bunflare-test-x"));
    }
}
