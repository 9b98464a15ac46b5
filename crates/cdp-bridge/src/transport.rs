use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::{future::BoxFuture, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeErrorKind};
use crate::util::extract_ws_url;

/// Raw CDP event as it comes off the wire, before the bridge maps it to a
/// [`crate::PageEvent`].
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Whether a command addresses the browser endpoint or a flattened page
/// session.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), BridgeError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError>;
}

/// Inert transport. Every command fails with `Internal`; layers above use it
/// to run without a browser (tests, dry-run mode).
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, BridgeError> {
        Err(BridgeError::new(BridgeErrorKind::Internal)
            .with_hint(format!("no live transport for method {method}")))
    }
}

type RuntimeFactory = Arc<
    dyn Fn(BridgeConfig) -> BoxFuture<'static, Result<Arc<RuntimeState>, BridgeError>>
        + Send
        + Sync,
>;

/// Real transport over a chromiumoxide raw [`Connection`].
///
/// The runtime (child process + read/write loop) is created lazily on first
/// use and recreated transparently if the previous one died, so a browser
/// crash shows up to callers as one failed command followed by a fresh
/// launch rather than a permanently wedged relay.
#[derive(Clone)]
pub struct ChromiumTransport {
    cfg: BridgeConfig,
    state: Arc<OnceCell<Mutex<Option<Arc<RuntimeState>>>>>,
    factory: RuntimeFactory,
}

impl ChromiumTransport {
    pub fn new(cfg: BridgeConfig) -> Self {
        let factory: RuntimeFactory = Arc::new(|cfg: BridgeConfig| {
            Box::pin(async move {
                let state = RuntimeState::start(cfg).await?;
                Ok(Arc::new(state))
            })
        });

        Self {
            cfg,
            state: Arc::new(OnceCell::new()),
            factory,
        }
    }

    async fn runtime(&self) -> Result<Arc<RuntimeState>, BridgeError> {
        let cell = self.state.get_or_init(|| async { Mutex::new(None) }).await;
        let mut guard = cell.lock().await;

        if let Some(rt) = guard.as_ref() {
            if rt.is_alive() {
                return Ok(rt.clone());
            }
        }

        let runtime = (self.factory)(self.cfg.clone()).await?;
        *guard = Some(runtime.clone());
        Ok(runtime)
    }

    #[cfg(test)]
    fn with_factory(cfg: BridgeConfig, factory: RuntimeFactory) -> Self {
        Self {
            cfg,
            state: Arc::new(OnceCell::new()),
            factory,
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), BridgeError> {
        let runtime = self.runtime().await?;

        let deadline = Duration::from_millis(self.cfg.default_deadline_ms);

        runtime
            .send_internal(
                CommandTarget::Browser,
                "Target.setDiscoverTargets",
                json!({ "discover": true }),
                deadline,
            )
            .await?;

        runtime
            .send_internal(
                CommandTarget::Browser,
                "Target.setAutoAttach",
                json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": false,
                    "flatten": true,
                }),
                deadline,
            )
            .await?;

        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.runtime().await {
            Ok(runtime) => runtime.next_event().await,
            Err(err) => {
                warn!(target: "cdp-bridge", ?err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let runtime = self.runtime().await?;
        runtime
            .send_internal(
                target,
                method,
                params,
                Duration::from_millis(self.cfg.default_deadline_ms),
            )
            .await
    }
}

struct ControlMessage {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, BridgeError>>,
}

struct RuntimeState {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    loop_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl RuntimeState {
    async fn start(cfg: BridgeConfig) -> Result<Self, BridgeError> {
        if cfg.websocket_url.is_none() {
            clear_stale_profile_locks(&cfg.user_data_dir);
        }

        let (child, ws_url) = if let Some(url) = cfg.websocket_url.clone() {
            (None, url)
        } else {
            let browser_cfg = Self::browser_config(&cfg)?;
            Self::launch_browser(browser_cfg).await?
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| BridgeError::new(BridgeErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let heartbeat_alive = alive.clone();
        let heartbeat_tx = command_tx.clone();

        let loop_task = tokio::spawn(async move {
            let result = Self::run_loop(conn, command_rx, events_tx).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "cdp-bridge", ?err, "transport loop terminated with error");
            }
        });

        let heartbeat_task = Self::spawn_heartbeat(
            heartbeat_tx,
            heartbeat_alive,
            Duration::from_millis(cfg.heartbeat_interval_ms),
            Duration::from_millis(cfg.default_deadline_ms),
        );

        info!(target: "cdp-bridge", url = %ws_url, "chromium connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task,
            heartbeat_task,
            child: Mutex::new(child),
            alive,
        })
    }

    #[cfg(test)]
    fn test_stub() -> (Arc<Self>, Arc<AtomicBool>) {
        let (command_tx, _command_rx) = mpsc::channel(8);
        let (_events_tx, events_rx) = mpsc::channel(8);
        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            futures::future::pending::<()>().await;
            loop_alive.store(false, Ordering::Relaxed);
        });

        (
            Arc::new(Self {
                command_tx,
                events_rx: Mutex::new(events_rx),
                loop_task,
                heartbeat_task: None,
                child: Mutex::new(None),
                alive: alive.clone(),
            }),
            alive,
        )
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send_internal(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|err| BridgeError::new(BridgeErrorKind::CdpIo).with_hint(err.to_string()))?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(BridgeError::new(BridgeErrorKind::CdpIo)
                .with_hint("command response channel closed")),
            Err(_) => {
                Err(BridgeError::new(BridgeErrorKind::NavTimeout).with_hint("command timed out"))
            }
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    fn spawn_heartbeat(
        sender: mpsc::Sender<ControlMessage>,
        alive: Arc<AtomicBool>,
        interval_duration: Duration,
        deadline: Duration,
    ) -> Option<JoinHandle<()>> {
        if interval_duration.as_millis() == 0 {
            return None;
        }

        let response_deadline = deadline.min(Duration::from_secs(5));

        Some(tokio::spawn(async move {
            let mut ticker = interval(interval_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while alive.load(Ordering::Relaxed) {
                ticker.tick().await;

                if !alive.load(Ordering::Relaxed) {
                    break;
                }

                let (resp_tx, resp_rx) = oneshot::channel();
                let message = ControlMessage {
                    target: CommandTarget::Browser,
                    method: "Browser.getVersion".to_string(),
                    params: Value::Object(Default::default()),
                    responder: resp_tx,
                };

                if sender.send(message).await.is_err() {
                    debug!(target: "cdp-bridge", "heartbeat send failed (channel closed)");
                    break;
                }

                match tokio::time::timeout(response_deadline, resp_rx).await {
                    Ok(Ok(Ok(_))) => {}
                    Ok(Ok(Err(err))) => {
                        warn!(target: "cdp-bridge", ?err, "heartbeat command error");
                        break;
                    }
                    Ok(Err(_)) => {
                        debug!(target: "cdp-bridge", "heartbeat response channel closed");
                        break;
                    }
                    Err(_) => {
                        warn!(target: "cdp-bridge", "heartbeat timed out");
                        break;
                    }
                }
            }
        }))
    }

    fn browser_config(cfg: &BridgeConfig) -> Result<BrowserConfig, BridgeError> {
        if cfg.websocket_url.is_some() {
            return Err(BridgeError::new(BridgeErrorKind::Internal)
                .with_hint("browser_config requested while websocket_url present"));
        }

        if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
            return Err(BridgeError::new(BridgeErrorKind::CdpIo).with_hint(format!(
                "chrome executable not found at {}; set CHATRELAY_CHROME to the full path",
                cfg.executable.display()
            )));
        }

        let profile_dir = if cfg.user_data_dir.is_absolute() {
            cfg.user_data_dir.clone()
        } else {
            let cwd = std::env::current_dir().map_err(|err| {
                BridgeError::new(BridgeErrorKind::Internal)
                    .with_hint(format!("failed to resolve cwd for user-data-dir: {err}"))
            })?;
            cwd.join(&cfg.user_data_dir)
        };

        fs::create_dir_all(&profile_dir).map_err(|err| {
            BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("failed to ensure user-data-dir: {err}"))
        })?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
            .launch_timeout(Duration::from_secs(20));

        if !cfg.headless {
            builder = builder.with_head();
        }

        if std::env::var("CHATRELAY_DISABLE_SANDBOX")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
        {
            builder = builder.no_sandbox();
        }

        // --disable-blink-features=AutomationControlled keeps navigator.webdriver
        // from flipping on; the rest mirrors what the hosted chat site tolerates
        // from a long-lived logged-in profile.
        let mut args = vec![
            "--disable-blink-features=AutomationControlled",
            "--disable-background-networking",
            "--disable-background-timer-throttling",
            "--disable-breakpad",
            "--disable-client-side-phishing-detection",
            "--disable-component-update",
            "--disable-default-apps",
            "--disable-dev-shm-usage",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-prompt-on-repost",
            "--disable-sync",
            "--metrics-recording-only",
            "--no-first-run",
            "--no-default-browser-check",
            "--password-store=basic",
            "--remote-allow-origins=*",
            "--use-mock-keychain",
        ];
        if cfg.headless {
            args.push("--headless=new");
            args.push("--hide-scrollbars");
            args.push("--mute-audio");
        }
        builder = builder.args(args);

        if !cfg.executable.as_os_str().is_empty() {
            builder = builder.chrome_executable(cfg.executable.clone());
        }
        builder = builder.user_data_dir(profile_dir);

        builder.build().map_err(|err| {
            BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("browser config error: {err}"))
        })
    }

    async fn launch_browser(config: BrowserConfig) -> Result<(Option<Child>, String), BridgeError> {
        let mut child = config.launch().map_err(|err| {
            BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("failed to launch chromium: {err}"))
        })?;

        let ws_url = extract_ws_url(&mut child)
            .await
            .map_err(|err| BridgeError::new(BridgeErrorKind::CdpIo).with_hint(err.to_string()))?;

        Ok((Some(child), ws_url))
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        mut event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BridgeError> {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, BridgeError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    Self::handle_command(&mut conn, cmd, &mut inflight).await?;
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(resp))) => {
                            Self::handle_response(resp, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            if let Err(err) = Self::handle_event(event, &mut event_tx).await {
                                warn!(target: "cdp-bridge", ?err, "failed to forward event");
                            }
                        }
                        Some(Err(err)) => {
                            let bridge_err = Self::map_cdp_error(err);
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(bridge_err.clone()));
                            }
                            return Err(bridge_err);
                        }
                        None => {
                            let err = BridgeError::new(BridgeErrorKind::CdpIo)
                                .with_hint("cdp connection closed");
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(err.clone()));
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(
        conn: &mut Connection<CdpEventMessage>,
        cmd: ControlMessage,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, BridgeError>>>,
    ) -> Result<(), BridgeError> {
        let session = match cmd.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
        };

        let method_id: MethodId = cmd.method.clone().into();
        match conn.submit_command(method_id, session, cmd.params) {
            Ok(call_id) => {
                inflight.insert(call_id, cmd.responder);
                Ok(())
            }
            Err(err) => {
                let bridge_err =
                    BridgeError::new(BridgeErrorKind::CdpIo).with_hint(err.to_string());
                let _ = cmd.responder.send(Err(bridge_err.clone()));
                Err(bridge_err)
            }
        }
    }

    fn handle_response(
        resp: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, BridgeError>>>,
    ) {
        let entry = inflight.remove(&resp.id);
        let result = Self::extract_payload(resp);

        if let Some(sender) = entry {
            let _ = sender.send(result);
        }
    }

    async fn handle_event(
        event: CdpEventMessage,
        event_tx: &mut mpsc::Sender<TransportEvent>,
    ) -> Result<(), BridgeError> {
        let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
            BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("failed to decode cdp event: {err}"))
        })?;

        let payload = TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        };

        event_tx
            .send(payload)
            .await
            .map_err(|err| BridgeError::new(BridgeErrorKind::Internal).with_hint(err.to_string()))
    }

    fn extract_payload(resp: Response) -> Result<Value, BridgeError> {
        if let Some(result) = resp.result {
            Ok(result)
        } else if let Some(error) = resp.error {
            let retriable = error.code >= 500;
            Err(BridgeError::new(BridgeErrorKind::CdpIo)
                .with_hint(format!("cdp error {}: {}", error.code, error.message))
                .retriable(retriable))
        } else {
            Err(BridgeError::new(BridgeErrorKind::Internal).with_hint("empty cdp response"))
        }
    }

    fn map_cdp_error(err: CdpError) -> BridgeError {
        let hint = err.to_string();
        match err {
            CdpError::Timeout => BridgeError::new(BridgeErrorKind::NavTimeout)
                .with_hint(hint)
                .retriable(true),
            CdpError::FrameNotFound(_)
            | CdpError::JavascriptException(_)
            | CdpError::Serde(_) => BridgeError::new(BridgeErrorKind::Internal).with_hint(hint),
            _ => BridgeError::new(BridgeErrorKind::CdpIo)
                .with_hint(hint)
                .retriable(true),
        }
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }

        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "cdp-bridge", ?err, "failed to kill chromium child");
                        }
                    });
                } else {
                    debug!(target: "cdp-bridge", "no tokio runtime available to kill chromium child");
                }
            }
        }
    }
}

/// Remove singleton locks and sqlite journals left behind by an unclean
/// browser exit. Chromium refuses to reuse the profile while a SingletonLock
/// is present, and stale `-journal`/`-wal` files can corrupt cookie reads.
pub fn clear_stale_profile_locks(profile_dir: &std::path::Path) {
    for name in ["SingletonLock", "SingletonSocket", "SingletonCookie"] {
        let path = profile_dir.join(name);
        if path.exists() || path.symlink_metadata().is_ok() {
            if let Err(err) = fs::remove_file(&path) {
                debug!(target: "cdp-bridge", path = %path.display(), ?err, "lock cleanup skipped");
            } else {
                info!(target: "cdp-bridge", path = %path.display(), "removed stale profile lock");
            }
        }
    }

    let default_dir = profile_dir.join("Default");
    if let Ok(entries) = fs::read_dir(&default_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with("-journal") || name.ends_with("-wal") || name.ends_with("-shm") {
                if let Err(err) = fs::remove_file(entry.path()) {
                    debug!(target: "cdp-bridge", file = %name, ?err, "journal cleanup skipped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::Mutex as TokioMutex;

    #[tokio::test]
    async fn recreates_runtime_when_dead() {
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let alive_flags = Arc::new(TokioMutex::new(Vec::<Arc<AtomicBool>>::new()));

        let factory: RuntimeFactory = {
            let spawn_count = spawn_count.clone();
            let alive_flags = alive_flags.clone();
            Arc::new(move |cfg: BridgeConfig| {
                let spawn_count = spawn_count.clone();
                let alive_flags = alive_flags.clone();
                Box::pin(async move {
                    let _ = cfg;
                    spawn_count.fetch_add(1, AtomicOrdering::SeqCst);
                    let (runtime, alive) = RuntimeState::test_stub();
                    alive_flags.lock().await.push(alive);
                    Ok(runtime)
                })
            })
        };

        let transport = ChromiumTransport::with_factory(BridgeConfig::default(), factory);

        let rt1 = transport.runtime().await.expect("runtime #1");
        assert_eq!(spawn_count.load(AtomicOrdering::SeqCst), 1);

        {
            let guard = alive_flags.lock().await;
            guard[0].store(false, AtomicOrdering::SeqCst);
        }

        let rt1_clone = rt1.clone();
        drop(rt1);

        let rt2 = transport.runtime().await.expect("runtime #2");
        assert_eq!(spawn_count.load(AtomicOrdering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&rt1_clone, &rt2));
    }

    #[test]
    fn clears_singleton_locks_and_journals() {
        let dir = tempdir().unwrap();
        let profile = dir.path();
        std::fs::write(profile.join("SingletonLock"), b"").unwrap();
        std::fs::create_dir_all(profile.join("Default")).unwrap();
        std::fs::write(profile.join("Default/Cookies-journal"), b"").unwrap();
        std::fs::write(profile.join("Default/Cookies"), b"keep").unwrap();

        clear_stale_profile_locks(profile);

        assert!(!profile.join("SingletonLock").exists());
        assert!(!profile.join("Default/Cookies-journal").exists());
        assert!(profile.join("Default/Cookies").exists());
    }
}
