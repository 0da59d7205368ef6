use std::collections::HashSet;
use std::io::{Read as _, Write as _};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::builder;
use crate::config::{HostConfig, ResourceConfig};
use crate::deps::{absolutize, import_roots, BuildContext};
use crate::env::Env;
use crate::error::ServeError;
use crate::logger::{self, BufferedLogSink};
use crate::reload::{self, UpdateListeners, LIVE_RELOAD_PROTOCOL};
use crate::templates;
use crate::watcher::{Event, FileWatcher};

const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(2);
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the child process, stored atomically so the reaper and
/// the probe can read it without the work token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Exited = 3,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessState::Running,
            2 => ProcessState::Stopping,
            3 => ProcessState::Exited,
            _ => ProcessState::Created,
        }
    }
}

/// The readiness gate value observed by inbound requests: `Pending`
/// while a build/start cycle is in flight, otherwise the result of the
/// most recently completed cycle.
#[derive(Clone, Debug)]
enum Gate {
    Pending,
    Done(Option<ServeError>),
}

/// A semantic set of root paths plus an ignore predicate.
pub struct ResourceSet {
    paths: Vec<PathBuf>,
    ignore: Option<Regex>,
}

impl ResourceSet {
    pub fn new(config: &ResourceConfig) -> anyhow::Result<Self> {
        let paths = config
            .paths
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| absolutize(Path::new(p)))
            .collect();
        let pattern = config.ignore.trim();
        let ignore = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern).map_err(|err| anyhow::anyhow!("invalid file pattern: {err}"))?)
        };
        Ok(Self { paths, ignore })
    }

    /// True when some root is a prefix of `path` and the ignore
    /// pattern does not match.
    pub fn matches(&self, path: &Path) -> bool {
        self.paths.iter().any(|root| path.starts_with(root)) && !self.ignored(path)
    }

    fn ignored(&self, path: &Path) -> bool {
        self.ignore
            .as_ref()
            .map(|re| re.is_match(&path.to_string_lossy()))
            .unwrap_or(false)
    }

    /// Register every directory under the roots with the watcher,
    /// skipping ignored subtrees. File roots are registered directly.
    fn watch(
        &self,
        watcher: &FileWatcher,
        ch: &mpsc::Sender<Event>,
        registered: &mut Vec<PathBuf>,
    ) {
        for root in &self.paths {
            match std::fs::metadata(root) {
                Ok(meta) if meta.is_dir() => self.watch_tree(root, watcher, ch, registered),
                Ok(_) => {
                    if watcher.add(root, ch).is_ok() {
                        registered.push(root.clone());
                    }
                }
                Err(_) => {}
            }
        }
    }

    fn watch_tree(
        &self,
        dir: &Path,
        watcher: &FileWatcher,
        ch: &mpsc::Sender<Event>,
        registered: &mut Vec<PathBuf>,
    ) {
        if self.ignored(dir) {
            return;
        }
        match watcher.add(dir, ch) {
            Ok(()) => registered.push(dir.to_path_buf()),
            Err(err) => warn!(path = %dir.display(), error = %err, "unable to watch"),
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.watch_tree(&path, watcher, ch, registered);
            }
        }
    }
}

/// Handle to the current child: the reaper owns the `Child` itself,
/// everyone else gets the pid and an exit watch.
#[derive(Clone)]
struct ChildHandle {
    pid: i32,
    exit_rx: watch::Receiver<bool>,
}

struct Inner {
    port: u16,
    addr: String,
    startup: Vec<String>,
    dep: HashSet<PathBuf>,
    child: Option<ChildHandle>,
}

/// The per-host controller: owns the child process lifecycle, the
/// dependency watches and the reload fan-out. All build/start/stop
/// transitions serialize on the `busy` token.
pub struct Supervisor {
    host: String,
    bin: PathBuf,
    target: PathBuf,
    target_dir: PathBuf,
    working_dir: PathBuf,
    builder_cmd: Vec<String>,
    startup_timeout: Duration,
    context: BuildContext,
    env_overlay: Vec<(String, String)>,
    resources: ResourceSet,
    assets: ResourceSet,
    proxy_port: u16,

    watcher: Arc<FileWatcher>,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    watched: Mutex<Vec<PathBuf>>,

    busy: tokio::sync::Mutex<()>,
    gate: watch::Sender<Gate>,
    inner: Mutex<Inner>,
    process_state: AtomicU8,
    last_error: Mutex<Option<ServeError>>,
    listeners: UpdateListeners,
    stderr: BufferedLogSink,
    in_flight: AtomicUsize,
    once: OnceCell<()>,
    closed: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: &HostConfig,
        watcher: Arc<FileWatcher>,
        proxy_port: u16,
    ) -> anyhow::Result<Arc<Self>> {
        let resources = ResourceSet::new(&config.resources)?;
        let assets = ResourceSet::new(&config.assets)?;

        let target = absolutize(Path::new(config.target.trim()));
        let target_dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let working_dir = if config.working_dir.trim().is_empty() {
            target_dir.clone()
        } else {
            absolutize(Path::new(config.working_dir.trim()))
        };
        let bin = if config.bin.trim().is_empty() {
            std::env::temp_dir().join(format!("devgate-{}", config.host))
        } else {
            PathBuf::from(config.bin.trim())
        };

        let mut gopath: Vec<PathBuf> = config
            .gopath
            .iter()
            .map(|p| absolutize(Path::new(p)))
            .collect();
        if !gopath.iter().any(|root| target.starts_with(root)) {
            // The target is outside every configured workspace: guess
            // the workspace root from the path itself.
            let mut roots = import_roots(&target);
            roots.append(&mut gopath);
            gopath = roots;
        }
        let context = BuildContext::new(PathBuf::from(config.goroot.trim()), gopath);

        let builder_cmd = if config.builder.is_empty() {
            vec![
                context.go_binary(),
                "build".to_string(),
                "-o".to_string(),
                bin.to_string_lossy().into_owned(),
            ]
        } else {
            config.builder.clone()
        };

        let startup_timeout = Duration::from_secs(if config.startup_timeout == 0 {
            10
        } else {
            config.startup_timeout
        });

        let mut env_overlay: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env_overlay.sort();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (gate, _) = watch::channel(Gate::Pending);

        Ok(Arc::new(Self {
            host: config.host.clone(),
            bin,
            target,
            target_dir,
            working_dir,
            builder_cmd,
            startup_timeout,
            context,
            env_overlay,
            resources,
            assets,
            proxy_port,
            watcher,
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            watched: Mutex::new(Vec::new()),
            busy: tokio::sync::Mutex::new(()),
            gate,
            inner: Mutex::new(Inner {
                port: config.port,
                addr: String::new(),
                startup: config.startup.clone(),
                dep: HashSet::new(),
                child: None,
            }),
            process_state: AtomicU8::new(ProcessState::Created as u8),
            last_error: Mutex::new(None),
            listeners: UpdateListeners::new(),
            stderr: BufferedLogSink::new(),
            in_flight: AtomicUsize::new(0),
            once: OnceCell::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// The child's resolved `host:port`; empty before the first start.
    pub fn addr(&self) -> String {
        self.inner.lock().addr.clone()
    }

    /// Directories error and viewer lookups resolve sources against.
    pub fn src_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.context.src_dirs();
        dirs.push(self.target_dir.clone());
        dirs
    }

    pub fn process_state(&self) -> ProcessState {
        ProcessState::from_u8(self.process_state.load(Ordering::SeqCst))
    }

    fn set_process_state(&self, state: ProcessState) {
        self.process_state.store(state as u8, Ordering::SeqCst);
    }

    fn set_error(&self, err: Option<ServeError>) {
        *self.last_error.lock() = err;
    }

    fn last_error(&self) -> Option<ServeError> {
        self.last_error.lock().clone()
    }

    /// Latch the most recent result into the gate so every subsequent
    /// receive observes it until the next cycle begins.
    fn publish_ready(&self) {
        self.gate.send_replace(Gate::Done(self.last_error()));
    }

    /// A receiver signalled after the next completed update cycle.
    pub fn on_update(&self) -> mpsc::Receiver<()> {
        self.listeners.register()
    }

    fn attach_stderr(&self, err: ServeError) -> ServeError {
        match err {
            ServeError::Start(msg) => {
                let stderr = self.stderr.read_all();
                if stderr.is_empty() {
                    ServeError::Start(msg)
                } else {
                    ServeError::Start(format!("{msg}\nError: {stderr}"))
                }
            }
            other => other,
        }
    }

    fn runtime_error(&self, message: String) -> ServeError {
        let stderr = self.stderr.read_all();
        if stderr.is_empty() {
            ServeError::Runtime(message)
        } else {
            ServeError::Runtime(format!("{message}\n{stderr}"))
        }
    }

    /// Idempotent first-use bootstrap: build and start the child, set
    /// up the resource/asset watches and spawn the event driver.
    pub async fn run_once(self: &Arc<Self>) {
        let srv = Arc::clone(self);
        self.once
            .get_or_init(|| async move {
                let _busy = srv.busy.lock().await;
                let result = async {
                    srv.build().await?;
                    srv.start().await.map_err(|err| srv.attach_stderr(err))
                }
                .await;
                srv.set_error(result.err());

                let ch = srv.events_tx.lock().clone();
                if let Some(ch) = ch {
                    let mut registered = Vec::new();
                    srv.resources.watch(&srv.watcher, &ch, &mut registered);
                    srv.assets.watch(&srv.watcher, &ch, &mut registered);
                    srv.watched.lock().append(&mut registered);
                }
                if let Some(rx) = srv.events_rx.lock().take() {
                    let driver = Arc::clone(&srv);
                    tokio::spawn(async move { driver.drive_events(rx).await });
                }
                srv.publish_ready();
            })
            .await;
    }

    /// Debounce filesystem events: reset a one-second timer on every
    /// event, then sync with the last event's path.
    async fn drive_events(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            let mut last = event.path;
            loop {
                match timeout(DEBOUNCE_WINDOW, rx.recv()).await {
                    Ok(Some(event)) => last = event.path,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            self.sync(&last).await;
        }
    }

    /// React to a filesystem change: rebuild when the path is in the
    /// dependency set, restart when it is a resource, and only notify
    /// the browsers when it is an asset.
    pub async fn sync(self: &Arc<Self>, path: &Path) {
        let _busy = self.busy.lock().await;
        debug!(host = %self.host, path = %path.display(), "sync");

        let rebuild = self.inner.lock().dep.contains(path);
        let restart = rebuild || self.resources.matches(path);

        if !restart {
            if self.assets.matches(path) {
                self.listeners.notify();
            }
            return;
        }

        if let Err(err) = self.stop().await {
            self.set_error(Some(err));
            self.publish_ready();
            self.listeners.notify();
            return;
        }

        if rebuild {
            if let Err(err) = self.build().await {
                self.set_error(Some(err));
                self.publish_ready();
                // Reload anyway so open browsers surface the error page.
                self.listeners.notify();
                return;
            }
        }

        match self.start().await {
            Ok(()) => self.set_error(None),
            Err(err) => {
                let err = self.attach_stderr(err);
                self.set_error(Some(err));
            }
        }
        self.publish_ready();
    }

    /// Stop then start under the work token.
    pub async fn restart(self: &Arc<Self>) -> Result<(), ServeError> {
        let _busy = self.busy.lock().await;

        if let Err(err) = self.stop().await {
            self.set_error(Some(err.clone()));
            self.publish_ready();
            return Err(err);
        }

        let result = self.start().await.map_err(|err| self.attach_stderr(err));
        self.set_error(result.as_ref().err().cloned());
        self.publish_ready();
        result
    }

    /// Crash fallout: stop what is left and tell the browsers so they
    /// reload into the error page.
    async fn stop_and_notify(self: &Arc<Self>) {
        let _busy = self.busy.lock().await;
        let result = self.stop().await;
        self.set_error(result.err());
        self.publish_ready();
        self.listeners.notify();
    }

    /// Idempotent teardown: unregister every watch and stop the child.
    pub async fn shutdown(self: &Arc<Self>) {
        let _busy = self.busy.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(host = %self.host, "shutting down");

        if let Some(ch) = self.events_tx.lock().take() {
            let dep: Vec<PathBuf> = self.inner.lock().dep.drain().collect();
            for path in dep {
                self.watcher.remove(&path, &ch);
            }
            let watched: Vec<PathBuf> = std::mem::take(&mut *self.watched.lock());
            for path in watched {
                self.watcher.remove(&path, &ch);
            }
        }

        if let Err(err) = self.stop().await {
            warn!(host = %self.host, error = %err, "stop failed during shutdown");
        }
        self.gate.send_replace(Gate::Done(Some(ServeError::Runtime(format!(
            "{}: server closed",
            self.host
        )))));
    }

    /// Latch the stop cycle, give in-flight requests a moment to
    /// observe readiness, drain them, then terminate the child. Never
    /// double-stops: a stop is skipped while one is already pending.
    async fn stop(&self) -> Result<(), ServeError> {
        if matches!(&*self.gate.borrow(), Gate::Pending) {
            return Ok(());
        }
        info!(host = %self.host, "stopping");
        self.gate.send_replace(Gate::Pending);

        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        self.stop_process().await
    }

    /// SIGTERM, await exit, escalate to SIGKILL after the startup
    /// timeout.
    async fn stop_process(&self) -> Result<(), ServeError> {
        let handle = self.inner.lock().child.clone();
        let Some(handle) = handle else {
            return Ok(());
        };
        if *handle.exit_rx.borrow() {
            debug!(host = %self.host, "process already stopped");
            return Ok(());
        }
        if self.process_state() != ProcessState::Running {
            return Ok(());
        }

        self.set_process_state(ProcessState::Stopping);
        unsafe {
            libc::kill(handle.pid, libc::SIGTERM);
        }
        let mut exit_rx = handle.exit_rx.clone();
        if timeout(self.startup_timeout, exit_rx.wait_for(|exited| *exited))
            .await
            .is_err()
        {
            warn!(host = %self.host, pid = handle.pid, "grace period exceeded, sending SIGKILL");
            unsafe {
                libc::kill(handle.pid, libc::SIGKILL);
            }
            let _ = exit_rx.wait_for(|exited| *exited).await;
        }
        Ok(())
    }

    /// Compute dependencies, move the watch set over to them and run
    /// the builder. Files living in the target's own directory are
    /// passed as explicit filenames.
    async fn build(&self) -> Result<(), ServeError> {
        info!(host = %self.host, "building");

        let dep = self
            .context
            .compute_deps(&self.target)
            .map_err(|err| ServeError::Build(err.to_string()))?;

        let ch = self.events_tx.lock().clone();
        let mut build_files = Vec::new();
        {
            let mut inner = self.inner.lock();
            if let Some(ch) = &ch {
                let old: Vec<PathBuf> = inner.dep.drain().collect();
                for path in old {
                    self.watcher.remove(&path, ch);
                }
            } else {
                inner.dep.clear();
            }
            for path in &dep {
                inner.dep.insert(path.clone());
                if let Some(ch) = &ch {
                    if let Err(err) = self.watcher.add(path, ch) {
                        return Err(ServeError::Build(err.to_string()));
                    }
                }
                if path.parent() == Some(self.target_dir.as_path()) {
                    if let Some(name) = path.file_name() {
                        build_files.push(name.to_string_lossy().into_owned());
                    }
                }
            }
        }

        let env = Env::from_os();
        env.set("GOPATH", &[self.context.gopath_list().as_str()]);
        let goroot = self.context.goroot();
        if !goroot.as_os_str().is_empty() {
            env.set("GOROOT", &[goroot.to_string_lossy().as_ref()]);
        }

        builder::build(&self.builder_cmd, &self.target_dir, &env, &build_files)
            .await
            .map_err(ServeError::from)
    }

    /// Spawn the child and probe it until it answers. Listeners are
    /// notified when the attempt finishes, successful or not, so
    /// browsers reload into whatever the result is.
    async fn start(self: &Arc<Self>) -> Result<(), ServeError> {
        info!(host = %self.host, "starting");
        let result = self.start_process().await;
        info!(host = %self.host, "startup completed");
        self.listeners.notify();
        result
    }

    async fn start_process(self: &Arc<Self>) -> Result<(), ServeError> {
        let (addr, startup) = {
            let mut inner = self.inner.lock();
            if inner.port == 0 {
                let port = find_available_port()
                    .map_err(|err| ServeError::Start(err.to_string()))?;
                inner.port = port;
                let addr = format!("{}:{}", self.host, port);
                inner.addr = addr.clone();
                // The child must accept "--addr" when no port is
                // configured.
                inner.startup.push("--addr".to_string());
                inner.startup.push(addr);
            }
            if inner.addr.is_empty() {
                inner.addr = format!("{}:{}", self.host, inner.port);
            }
            (inner.addr.clone(), inner.startup.clone())
        };

        addr.to_socket_addrs()
            .map_err(|err| ServeError::Start(format!("{addr}: {err}")))?;

        self.stderr.reset();
        self.set_process_state(ProcessState::Created);

        let env = Env::from_os();
        for (key, value) in &self.env_overlay {
            env.set(key, &[value.as_str()]);
        }

        debug!(host = %self.host, bin = %self.bin.display(), addr = %addr, "starting process");
        let mut child = Command::new(&self.bin)
            .args(&startup)
            .env_clear()
            .envs(env.pairs())
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ServeError::Start(format!("{}: {err}", self.bin.display())))?;

        if let Some(stdout) = child.stdout.take() {
            logger::stream_stdout(self.host.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            logger::capture_stderr(self.stderr.clone(), stderr);
        }

        let pid = child.id().unwrap_or_default() as i32;
        self.set_process_state(ProcessState::Running);
        let (exit_tx, exit_rx) = watch::channel(false);
        self.inner.lock().child = Some(ChildHandle {
            pid,
            exit_rx: exit_rx.clone(),
        });
        self.spawn_reaper(child, exit_tx);

        self.probe(&addr, exit_rx).await
    }

    /// Await the child's exit. A child that leaves the Running state on
    /// its own either crashed or was killed externally: restart it when
    /// the exit looks transient, otherwise surface the failure.
    fn spawn_reaper(self: &Arc<Self>, mut child: Child, exit_tx: watch::Sender<bool>) {
        let srv = Arc::clone(self);
        tokio::spawn(async move {
            let status_text = match child.wait().await {
                Ok(status) => exit_status_text(&status),
                Err(err) => err.to_string(),
            };
            info!(host = %srv.host, status = %status_text, "process exited");

            let prior = srv.process_state();
            srv.set_process_state(ProcessState::Exited);
            let _ = exit_tx.send(true);

            if prior != ProcessState::Running {
                return;
            }
            let Ok(guard) = srv.busy.try_lock() else {
                return;
            };
            drop(guard);

            if srv.stderr.is_empty() || status_text.contains("terminated") {
                let restarter = Arc::clone(&srv);
                tokio::spawn(async move {
                    if let Err(err) = restarter.restart().await {
                        warn!(host = %restarter.host, error = %err, "restart after exit failed");
                    }
                });
            } else {
                let stopper = Arc::clone(&srv);
                tokio::spawn(async move { stopper.stop_and_notify().await });
            }
        });
    }

    /// HEAD the child every 100 ms until any response arrives - EOF
    /// after an accepted socket still means "started". Resolves early
    /// when the child exits or leaves the Running state; gives up after
    /// the startup timeout.
    async fn probe(&self, addr: &str, mut exit_rx: watch::Receiver<bool>) -> Result<(), ServeError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        let addr = addr.to_string();
        loop {
            if *exit_rx.borrow() {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, TcpStream::connect(&addr)).await {
                Err(_) => {
                    return Err(ServeError::Start(format!(
                        "timeout: gave up waiting for {addr}"
                    )))
                }
                Ok(Ok(mut stream)) => {
                    let head =
                        format!("HEAD / HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
                    let _ = stream.write_all(head.as_bytes()).await;
                    let mut buf = [0u8; 256];
                    let _ = timeout(PROBE_READ_TIMEOUT, stream.read(&mut buf)).await;
                    return Ok(());
                }
                Ok(Err(_)) => {
                    if self.process_state() != ProcessState::Running {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ServeError::Start(format!(
                            "timeout: gave up waiting for {addr}"
                        )));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                        _ = exit_rx.changed() => {}
                    }
                }
            }
        }
    }

    /// Serve one inbound request: wait for readiness, answer reload
    /// sockets even on error, otherwise forward to the child.
    pub async fn serve(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ServeError> {
        self.run_once().await;

        let is_websocket = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let is_live_reload = is_websocket
            && req
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == LIVE_RELOAD_PROTOCOL)
                .unwrap_or(false);

        let mut gate = self.gate.subscribe();
        let latched = match gate.wait_for(|g| matches!(g, Gate::Done(_))).await {
            Ok(value) => match &*value {
                Gate::Done(err) => err.clone(),
                Gate::Pending => None,
            },
            Err(_) => Some(ServeError::Runtime(format!("{}: server closed", self.host))),
        };

        if is_live_reload {
            // Answered even while the error is latched so the browser
            // learns of recovery.
            return Ok(self.serve_live_reload(req));
        }
        if let Some(err) = latched {
            return Err(err);
        }

        let _guard = InFlightGuard::acquire(&self.in_flight);
        if is_websocket {
            return self.serve_websocket(req).await;
        }
        self.forward(req, client_ip).await
    }

    /// Complete the reload-socket handshake, then hold the connection
    /// until an update fires or the client sends anything; closing is
    /// the entire protocol.
    fn serve_live_reload(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let key = req
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let accept = reload::websocket_accept_key(key);
        let mut update = self.listeners.register();
        let host = self.host.clone();

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut io = TokioIo::new(upgraded);
                    let mut buf = [0u8; 8];
                    tokio::select! {
                        _ = update.recv() => {}
                        _ = io.read(&mut buf) => {}
                    }
                }
                Err(err) => debug!(host = %host, error = %err, "live-reload upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .header(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(LIVE_RELOAD_PROTOCOL),
            )
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder")
    }

    /// Bridge a WebSocket upgrade to the child: replay the request line
    /// and headers over TCP with the Host rewritten, relay the child's
    /// answer, then copy bytes both ways until either side ends.
    async fn serve_websocket(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ServeError> {
        let addr = self.addr();
        let raw_request = build_upgrade_request(&req, &addr);

        let mut backend = TcpStream::connect(&addr)
            .await
            .map_err(|err| self.runtime_error(format!("{addr}: {err}")))?;
        backend
            .write_all(&raw_request)
            .await
            .map_err(|err| self.runtime_error(err.to_string()))?;

        let mut response_buf = vec![0u8; 4096];
        let n = backend
            .read(&mut response_buf)
            .await
            .map_err(|err| self.runtime_error(err.to_string()))?;
        if n == 0 {
            return Err(self.runtime_error(format!(
                "{addr}: connection closed before upgrade response"
            )));
        }

        let (status, response_headers) = parse_upgrade_response(&response_buf[..n])
            .ok_or_else(|| self.runtime_error(format!("{addr}: invalid upgrade response")))?;

        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            let lower = name.to_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(host = %self.host, status = %status, "upgrade rejected by backend");
            return Ok(response);
        }

        let host = self.host.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                        Ok((sent, received)) => {
                            debug!(host = %host, sent, received, "websocket closed")
                        }
                        Err(err) => debug!(host = %host, error = %err, "websocket closed"),
                    }
                }
                Err(err) => debug!(host = %host, error = %err, "client upgrade failed"),
            }
        });

        Ok(response)
    }

    /// Forward an HTTP request over a fresh connection (no reuse) and
    /// inject the reload snippet into HTML responses.
    async fn forward(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ServeError> {
        let addr = self.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| self.runtime_error(format!("{addr}: {err}")))?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake::<_, Incoming>(TokioIo::new(stream))
                .await
                .map_err(|err| self.runtime_error(err.to_string()))?;
        let host = self.host.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(host = %host, error = %err, "upstream connection error");
            }
        });

        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        parts.uri = path
            .parse()
            .map_err(|err| self.runtime_error(format!("{path}: {err}")))?;
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(&addr)
                .map_err(|err| self.runtime_error(err.to_string()))?,
        );
        append_forwarded_for(&mut parts.headers, client_ip);
        let backend_req = Request::from_parts(parts, body);

        let response = sender
            .send_request(backend_req)
            .await
            .map_err(|err| self.runtime_error(err.to_string()))?;

        let is_html = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/html"))
            .unwrap_or(false);
        if !is_html {
            let (parts, body) = response.into_parts();
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let (mut parts, body) = response.into_parts();
        let collected = body
            .collect()
            .await
            .map_err(|err| self.runtime_error(err.to_string()))?
            .to_bytes();
        let gzipped = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .map(|v| v == "gzip")
            .unwrap_or(false);

        let mut data = if gzipped {
            gunzip(&collected).map_err(|err| self.runtime_error(err.to_string()))?
        } else {
            collected.to_vec()
        };
        let snippet = reload::reload_script(self.proxy_port);
        data = templates::inject_html(&data, snippet.as_bytes());
        if gzipped {
            data = gzip(&data).map_err(|err| self.runtime_error(err.to_string()))?;
        }
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(data.len()));

        Ok(Response::from_parts(
            parts,
            Full::new(Bytes::from(data))
                .map_err(|never| match never {})
                .boxed(),
        ))
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn append_forwarded_for(headers: &mut hyper::HeaderMap, client_ip: IpAddr) {
    let ip = client_ip.to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Bind an ephemeral port and release it, accepting the inherent race.
fn find_available_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(unix)]
fn exit_status_text(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        return match signal {
            libc::SIGTERM => "signal: terminated".to_string(),
            libc::SIGKILL => "signal: killed".to_string(),
            libc::SIGINT => "signal: interrupt".to_string(),
            other => format!("signal: {other}"),
        };
    }
    format!("exit status {}", status.code().unwrap_or_default())
}

#[cfg(not(unix))]
fn exit_status_text(status: &std::process::ExitStatus) -> String {
    format!("exit status {}", status.code().unwrap_or_default())
}

fn build_upgrade_request(req: &Request<Incoming>, addr: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in req.headers() {
        if name == header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    raw.push_str(&format!("Host: {addr}\r\n\r\n"));
    raw.into_bytes()
}

fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
