use std::{
    io::{ErrorKind, Read},
    net::SocketAddr,
    path::PathBuf,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
};
use tracing::{info, warn};

use lightmaster_common::{
    DeviceIdentity, HttpLink, Inputs, JsonTransport, LinkError, LocalRequest, Node, NodeError,
    NodeStatus, Now, RecordBackend, Relay, RuntimeConfig, ServerCommand, StepOutcome, StoreError,
};

const LOOP_PERIOD: Duration = Duration::from_millis(200);
const MAX_RESPONSE_BYTES: u64 = 16 * 1024;

type Reply = oneshot::Sender<Result<NodeStatus, NodeError>>;
type HostNode = Node<FileBackend, HttpLink<UreqTransport>, SimulatedRelay>;

struct LocalCall {
    request: LocalRequest,
    reply: Reply,
}

#[derive(Clone)]
struct AppState {
    requests: mpsc::UnboundedSender<LocalCall>,
    status: watch::Receiver<NodeStatus>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ClearEmergency {
    passkey: String,
}

/// Record file replaced by rename so a crash mid-write leaves the old copy.
struct FileBackend {
    path: PathBuf,
}

impl RecordBackend for FileBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Backend(format!(
                "failed to read {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let backend_err =
            |err: std::io::Error| StoreError::Backend(format!("{}: {err}", self.path.display()));
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(backend_err)?;
        }
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, bytes).map_err(backend_err)?;
        std::fs::rename(&staging, &self.path).map_err(backend_err)
    }
}

struct UreqTransport {
    agent: ureq::Agent,
    base_url: String,
}

impl UreqTransport {
    fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url,
        }
    }
}

impl JsonTransport for UreqTransport {
    fn post(&mut self, path: &str, body: &[u8]) -> Result<Vec<u8>, LinkError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_bytes(body)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => LinkError::Status(code),
                ureq::Error::Transport(transport) => LinkError::Transport(transport.to_string()),
            })?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| {
                if err.kind() == ErrorKind::TimedOut {
                    LinkError::Timeout
                } else {
                    LinkError::Transport(err.to_string())
                }
            })?;
        Ok(bytes)
    }
}

/// Stands in for the relay GPIO on the desktop build.
#[derive(Default)]
struct SimulatedRelay {
    energized: bool,
}

impl Relay for SimulatedRelay {
    type Error = std::convert::Infallible;

    fn set_energized(&mut self, on: bool) -> Result<(), Self::Error> {
        if on != self.energized {
            info!("relay {}", if on { "closed" } else { "open" });
        }
        self.energized = on;
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("LIGHTMASTER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.lightmaster"));

    let mut runtime = load_runtime_config(&data_dir.join("runtime.json")).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(host) = std::env::var("SERVER_HOST") {
        runtime.network.server_host = host;
    }
    if let Some(port) = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.server_port = port;
    }
    runtime.sanitize();
    if runtime.network.use_tls {
        warn!("the desktop build speaks plain HTTP; TLS setting ignored");
        runtime.network.use_tls = false;
    }

    let identity = DeviceIdentity {
        serial_number: runtime.serial_number.clone(),
        hostname: runtime.network.hostname.clone(),
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let transport = UreqTransport::new(
        runtime.network.server_base_url(),
        Duration::from_millis(runtime.supervisor.request_timeout_ms),
    );
    let node = Node::boot(
        &runtime,
        identity.clone(),
        FileBackend {
            path: data_dir.join("record.json"),
        },
        HttpLink::new(transport),
        SimulatedRelay::default(),
        now(),
    );
    info!(
        "reporting to {} as serial {}",
        runtime.network.server_base_url(),
        runtime.serial_number
    );

    let (requests, request_rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(node.status(now()));
    spawn_control_loop(node, runtime, identity, request_rx, status_tx)?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/command", post(handle_command))
        .route("/api/emergency", post(handle_emergency))
        .route("/api/emergency/clear", post(handle_clear_emergency))
        .route("/api/factory-reset", post(handle_factory_reset))
        .with_state(AppState { requests, status });

    let port = std::env::var("NODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind device API at {addr}"))?;

    info!("device API listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_runtime_config(path: &std::path::Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn spawn_control_loop(
    mut node: HostNode,
    runtime: RuntimeConfig,
    identity: DeviceIdentity,
    mut requests: mpsc::UnboundedReceiver<LocalCall>,
    status: watch::Sender<NodeStatus>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || loop {
            let tick = now();

            while let Ok(call) = requests.try_recv() {
                let result = node
                    .handle_local(call.request, tick)
                    .map(|()| node.status(tick));
                let _ = call.reply.send(result);
            }

            if let StepOutcome::Restart(cause) = node.step(Inputs::default(), tick) {
                warn!("connectivity lost ({}), restarting node", cause.as_str());
                let (backend, link, relay) = node.into_parts();
                node = Node::boot(&runtime, identity.clone(), backend, link, relay, now());
            }

            status.send_replace(node.status(tick));
            thread::sleep(LOOP_PERIOD);
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().clone())
}

async fn handle_command(
    State(state): State<AppState>,
    Json(command): Json<ServerCommand>,
) -> impl IntoResponse {
    submit(&state, LocalRequest::Command(command)).await
}

async fn handle_emergency(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, LocalRequest::Emergency).await
}

async fn handle_clear_emergency(
    State(state): State<AppState>,
    Json(body): Json<ClearEmergency>,
) -> impl IntoResponse {
    submit(
        &state,
        LocalRequest::ClearEmergency {
            passkey: body.passkey,
        },
    )
    .await
}

async fn handle_factory_reset(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, LocalRequest::FactoryReset).await
}

async fn submit(state: &AppState, request: LocalRequest) -> axum::response::Response {
    let (reply, response) = oneshot::channel();
    if state.requests.send(LocalCall { request, reply }).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Control loop is not running");
    }

    match response.await {
        Ok(Ok(status)) => Json(status).into_response(),
        Ok(Err(err)) => error_response(
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            &err.to_string(),
        ),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Control loop dropped the request",
        ),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn now() -> Now {
    Now::synced(monotonic_ms(), Utc::now().timestamp())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use lightmaster_common::{record, store::PersistentStore, DeviceRecord, SessionPhase};

    use super::*;

    #[test]
    fn file_backend_round_trips_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("record.json");
        let mut store = PersistentStore::new(
            FileBackend { path: path.clone() },
            lightmaster_common::config::StoreConfig::default(),
        );

        assert_eq!(store.load().unwrap().phase, SessionPhase::Unregistered);

        let mut saved = DeviceRecord {
            device_id: "00042".to_string(),
            is_registered: true,
            phase: SessionPhase::Idle,
            ..DeviceRecord::default()
        };
        store
            .save(
                &mut saved,
                lightmaster_common::store::SaveReason::Transition,
                0,
            )
            .unwrap();

        assert_eq!(store.load().unwrap(), saved);
        assert!(!path.with_extension("json.tmp").exists());
        assert!(record::decode(&std::fs::read(&path).unwrap()).is_ok());
    }

    #[test]
    fn unreadable_record_is_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend {
            path: dir.path().to_path_buf(),
        };

        assert!(matches!(backend.read(), Err(StoreError::Backend(_))));
    }

    #[test]
    fn runtime_config_falls_back_to_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = load_runtime_config(&dir.path().join("runtime.json")).unwrap();
        assert_eq!(runtime.serial_number, "225B0-2-3");
    }
}
