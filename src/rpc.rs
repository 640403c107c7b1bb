// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON-RPC client for the aria2 download daemon, plus daemon bootstrap.
//!
//! Every call is a JSON-RPC 2.0 envelope POSTed to the daemon's endpoint:
//!
//! ```text
//! { "jsonrpc": "2.0", "id": "<uuid>", "method": "aria2.<method>",
//!   "params": ["token:<secret>", ...] }
//! ```
//!
//! [`DaemonSupervisor::ensure_running`] makes sure somebody is listening
//! before a job operation goes out, launching `aria2c` when nobody is.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

/// Per-call timeout for RPC requests.
pub const RPC_TIMEOUT_SECS: u64 = 10;

/// How long to wait for a freshly launched daemon to answer.
const STARTUP_WINDOW: Duration = Duration::from_secs(3);

/// Delay between liveness probes while waiting for the daemon.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Error talking to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Connection refused, DNS failure, timeout.
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    /// The daemon returned a JSON-RPC error object.
    #[error("{message} (code {code})")]
    Remote { code: i64, message: String },
    /// Non-success HTTP status without a usable JSON-RPC error.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// The reply was not a JSON-RPC response.
    #[error("malformed reply: {0}")]
    Protocol(String),
    /// The daemon binary could not be found.
    #[error("{0}")]
    NotInstalled(String),
    /// The daemon binary was found but could not be started.
    #[error("failed to launch daemon: {0}")]
    Launch(String),
}

/// Something that can carry a JSON-RPC call to the daemon.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Call `aria2.<method>` and return its `result` member.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;
}

/// Build the request envelope for `method`.
pub fn envelope(secret: &str, method: &str, params: Vec<Value>) -> Value {
    let mut all_params = Vec::with_capacity(params.len() + 1);
    all_params.push(Value::String(format!("token:{}", secret)));
    all_params.extend(params);

    json!({
        "jsonrpc": "2.0",
        "id": Uuid::new_v4().to_string(),
        "method": format!("aria2.{}", method),
        "params": all_params,
    })
}

/// Pull `result` out of a reply, turning an `error` member into [`RpcError::Remote`].
pub fn unwrap_reply(reply: Value) -> Result<Value, RpcError> {
    if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(RpcError::Remote { code, message });
    }

    match reply {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| RpcError::Protocol("reply has neither result nor error".to_string())),
        other => Err(RpcError::Protocol(format!("unexpected reply: {}", other))),
    }
}

/// HTTP transport for aria2's `/jsonrpc` endpoint.
#[derive(Debug, Clone)]
pub struct Aria2Rpc {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl Aria2Rpc {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl RpcTransport for Aria2Rpc {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let payload = envelope(&self.secret, method, params);
        tracing::debug!(method = %method, endpoint = %self.endpoint, "aria2 RPC call");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        if let Ok(reply) = serde_json::from_str::<Value>(&body) {
            if status.is_success() || reply.get("error").is_some_and(|e| !e.is_null()) {
                return unwrap_reply(reply);
            }
        }
        if !status.is_success() {
            return Err(RpcError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Err(RpcError::Protocol("reply is not JSON".to_string()))
    }
}

/// Starts the daemon process.
pub trait DaemonLauncher: Send + Sync {
    /// Path of the daemon executable, if one can be found.
    fn locate(&self) -> Option<PathBuf>;

    /// Spawn the daemon detached from us.
    fn launch(&self, binary: &Path) -> Result<(), RpcError>;
}

/// Launches `aria2c` in RPC daemon mode on the loopback interface.
#[derive(Debug, Clone)]
pub struct Aria2Launcher {
    binary: String,
    secret: String,
    port: Option<u16>,
}

impl Aria2Launcher {
    /// `binary` may be a path or a bare command name looked up on `PATH`.
    pub fn new(binary: impl Into<String>, secret: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            binary: binary.into(),
            secret: secret.into(),
            port,
        }
    }

    /// Command-line arguments the daemon is started with.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--enable-rpc=true".to_string(),
            "--rpc-listen-all=false".to_string(),
            format!("--rpc-secret={}", self.secret),
        ];
        if let Some(port) = self.port {
            args.push(format!("--rpc-listen-port={}", port));
        }
        args.extend([
            "--daemon=true".to_string(),
            "--console-log-level=error".to_string(),
            "--disable-ipv6=true".to_string(),
        ]);
        args
    }
}

impl DaemonLauncher for Aria2Launcher {
    fn locate(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.binary);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        which::which(&self.binary).ok()
    }

    fn launch(&self, binary: &Path) -> Result<(), RpcError> {
        tracing::info!(binary = %binary.display(), port = ?self.port, "Launching aria2 daemon");
        Command::new(binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|mut child| {
                // aria2c forks itself in daemon mode; reap the parent so it
                // does not linger as a zombie.
                std::thread::spawn(move || child.wait());
            })
            .map_err(|e| RpcError::Launch(e.to_string()))
    }
}

/// Keeps the daemon reachable.
#[derive(Clone)]
pub struct DaemonSupervisor {
    rpc: Arc<dyn RpcTransport>,
    launcher: Arc<dyn DaemonLauncher>,
    window: Duration,
    interval: Duration,
}

impl DaemonSupervisor {
    pub fn new(rpc: Arc<dyn RpcTransport>, launcher: Arc<dyn DaemonLauncher>) -> Self {
        Self {
            rpc,
            launcher,
            window: STARTUP_WINDOW,
            interval: STARTUP_POLL_INTERVAL,
        }
    }

    /// Override the startup wait (tests use a short window).
    pub fn with_startup_window(mut self, window: Duration, interval: Duration) -> Self {
        self.window = window;
        self.interval = interval;
        self
    }

    /// Whether the daemon answers `getVersion` right now, without launching it.
    pub async fn is_reachable(&self) -> bool {
        self.rpc.call("getVersion", Vec::new()).await.is_ok()
    }

    /// Make sure the daemon answers, starting it if needed.
    ///
    /// When the startup window runs out one last probe is made and its error
    /// is what the caller gets.
    pub async fn ensure_running(&self) -> Result<(), RpcError> {
        if self.is_reachable().await {
            return Ok(());
        }

        let binary = self.launcher.locate().ok_or_else(|| {
            RpcError::NotInstalled("aria2c not found in PATH. Please install aria2c.".to_string())
        })?;
        self.launcher.launch(&binary)?;

        let deadline = Instant::now() + self.window;
        while Instant::now() < deadline {
            if self.is_reachable().await {
                tracing::info!("aria2 daemon is up");
                return Ok(());
            }
            tokio::time::sleep(self.interval).await;
        }

        self.rpc.call("getVersion", Vec::new()).await.map(|_| ())
    }
}

impl std::fmt::Debug for DaemonSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonSupervisor")
            .field("window", &self.window)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_envelope_shape() {
        let payload = envelope("s3cret", "tellStatus", vec![json!("abc"), json!(["status"])]);
        assert_eq!(payload["jsonrpc"], "2.0");
        assert_eq!(payload["method"], "aria2.tellStatus");
        assert_eq!(payload["params"][0], "token:s3cret");
        assert_eq!(payload["params"][1], "abc");
        assert_eq!(payload["params"][2][0], "status");
        assert!(payload["id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn test_envelope_ids_differ() {
        let a = envelope("s", "getVersion", vec![]);
        let b = envelope("s", "getVersion", vec![]);
        assert_ne!(a["id"], b["id"]);
    }

    #[test]
    fn test_unwrap_result() {
        let reply = json!({"jsonrpc": "2.0", "id": "1", "result": "2089b05ecca3d829"});
        assert_eq!(unwrap_reply(reply).unwrap(), json!("2089b05ecca3d829"));
    }

    #[test]
    fn test_unwrap_error() {
        let reply = json!({
            "jsonrpc": "2.0", "id": "1",
            "error": {"code": 1, "message": "GID 0000000000000001 is not found"}
        });
        let err = unwrap_reply(reply).unwrap_err();
        assert_eq!(
            err,
            RpcError::Remote { code: 1, message: "GID 0000000000000001 is not found".into() }
        );
        assert!(err.to_string().contains("is not found"));
    }

    #[test]
    fn test_unwrap_missing_result() {
        assert!(matches!(unwrap_reply(json!({"id": "1"})), Err(RpcError::Protocol(_))));
        assert!(matches!(unwrap_reply(json!([1, 2])), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_launcher_args() {
        let launcher = Aria2Launcher::new("aria2c", "abc", Some(6800));
        let args = launcher.args();
        assert!(args.contains(&"--enable-rpc=true".to_string()));
        assert!(args.contains(&"--rpc-listen-all=false".to_string()));
        assert!(args.contains(&"--rpc-secret=abc".to_string()));
        assert!(args.contains(&"--rpc-listen-port=6800".to_string()));
        assert!(args.contains(&"--daemon=true".to_string()));
    }

    #[test]
    fn test_launcher_missing_explicit_path() {
        let launcher = Aria2Launcher::new("/definitely/not/here/aria2c", "abc", None);
        assert_eq!(launcher.locate(), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // Port 9 on loopback: nothing listens there in a test environment.
        let rpc = Aria2Rpc::new("http://127.0.0.1:9/jsonrpc", "x");
        let err = rpc.call("getVersion", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable(_)));
    }

    /// Transport that starts answering after a number of failed calls.
    struct FlakyRpc {
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcTransport for FlakyRpc {
        async fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value, RpcError> {
            assert_eq!(method, "getVersion");
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(RpcError::Unreachable("connection refused".into()))
            } else {
                Ok(json!({"version": "1.37.0"}))
            }
        }
    }

    struct FakeLauncher {
        found: bool,
        launched: AtomicBool,
    }

    impl DaemonLauncher for FakeLauncher {
        fn locate(&self) -> Option<PathBuf> {
            self.found.then(|| PathBuf::from("/usr/bin/aria2c"))
        }

        fn launch(&self, _binary: &Path) -> Result<(), RpcError> {
            self.launched.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn supervisor(fail_first: usize, found: bool) -> (DaemonSupervisor, Arc<FlakyRpc>, Arc<FakeLauncher>) {
        let rpc = Arc::new(FlakyRpc { fail_first, calls: AtomicUsize::new(0) });
        let launcher = Arc::new(FakeLauncher { found, launched: AtomicBool::new(false) });
        let sup = DaemonSupervisor::new(rpc.clone(), launcher.clone())
            .with_startup_window(Duration::from_millis(200), Duration::from_millis(10));
        (sup, rpc, launcher)
    }

    #[tokio::test]
    async fn test_running_daemon_is_not_relaunched() {
        let (sup, rpc, launcher) = supervisor(0, true);
        sup.ensure_running().await.unwrap();
        assert!(!launcher.launched.load(Ordering::SeqCst));
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_daemon_launched_and_waited_for() {
        let (sup, rpc, launcher) = supervisor(3, true);
        sup.ensure_running().await.unwrap();
        assert!(launcher.launched.load(Ordering::SeqCst));
        assert!(rpc.calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_fast() {
        let (sup, rpc, launcher) = supervisor(usize::MAX, false);
        let err = sup.ensure_running().await.unwrap_err();
        assert!(matches!(err, RpcError::NotInstalled(_)));
        assert!(!launcher.launched.load(Ordering::SeqCst));
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_final_attempt_error_propagates() {
        let (sup, _rpc, launcher) = supervisor(usize::MAX, true);
        let err = sup.ensure_running().await.unwrap_err();
        assert!(launcher.launched.load(Ordering::SeqCst));
        assert!(matches!(err, RpcError::Unreachable(_)));
    }
}
