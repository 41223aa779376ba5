use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyIOPin, AnyOutputPin},
        modem::Modem,
        prelude::Peripherals,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use lightmaster_common::{
    DeviceIdentity, HttpLink, Inputs, JsonTransport, LinkError, LocalRequest, NetworkConfig, Node,
    NodeError, NodeStatus, Now, RecordBackend, Relay, RuntimeConfig, ServerCommand, StepOutcome,
    StoreError,
};

const NVS_NAMESPACE: &str = "lightmaster";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_RECORD_KEY: &str = "record";
const NVS_PROVISION_KEY: &str = "force_ap";
const MAX_HTTP_BODY: usize = 1024;
const MAX_RECORD_BYTES: usize = 2048;
const MAX_RESPONSE_BYTES: usize = 8 * 1024;
const PROVISIONING_AP_SSID: &str = "Lightmaster-AP";
const PROVISIONING_AP_PASSWORD: &str = "LightSetup";
const PROVISIONING_PORTAL_TIMEOUT_SEC: u64 = 180;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SNTP_WAIT_SEC: u64 = 15;
const LOOP_PERIOD_MS: u64 = 200;
const LOCAL_API_PORT: u16 = 80;
const LOCAL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type EspNode = Node<NvsStore, HttpLink<EspTransport>, GpioRelay>;
type Reply = Sender<Result<NodeStatus, NodeError>>;

struct LocalCall {
    request: LocalRequest,
    reply: Reply,
}

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct Led {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

struct GpioRelay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl Relay for GpioRelay {
    type Error = EspError;

    fn set_energized(&mut self, on: bool) -> Result<(), Self::Error> {
        if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        }
    }
}

/// One short-lived HTTP connection per request; lights the processing LED
/// while the request is in flight.
struct EspTransport {
    base_url: String,
    timeout: Duration,
    processing_led: Option<Led>,
}

impl JsonTransport for EspTransport {
    fn post(&mut self, path: &str, body: &[u8]) -> Result<Vec<u8>, LinkError> {
        set_led(&mut self.processing_led, true);
        let result = self.exchange(path, body);
        set_led(&mut self.processing_led, false);
        result
    }
}

impl EspTransport {
    fn exchange(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, LinkError> {
        let conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&conf).map_err(transport_err)?);

        let url = format!("{}{path}", self.base_url);
        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let mut request = client
            .request(Method::Post, &url, &headers)
            .map_err(transport_err)?;
        request.write_all(body).map_err(transport_err)?;
        request.flush().map_err(transport_err)?;
        let mut response = request.submit().map_err(transport_err)?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(LinkError::Status(status));
        }

        let mut bytes = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(transport_err)?;
            if read == 0 {
                break;
            }
            if bytes.len() + read > MAX_RESPONSE_BYTES {
                return Err(LinkError::Decode("response body too large".to_string()));
            }
            bytes.extend_from_slice(&chunk[..read]);
        }
        Ok(bytes)
    }
}

impl RecordBackend for NvsStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_err)?;
        let mut buffer = vec![0_u8; MAX_RECORD_BYTES];
        let bytes = nvs.get_blob(NVS_RECORD_KEY, &mut buffer).map_err(nvs_err)?;
        Ok(bytes.map(<[u8]>::to_vec))
    }

    // NVS commits a blob atomically; an interrupted write keeps the old value.
    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_err)?;
        nvs.set_blob(NVS_RECORD_KEY, bytes).map_err(nvs_err)
    }
}

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "serverHost")]
    server_host: String,
    #[serde(rename = "serverPort")]
    server_port: u16,
    #[serde(rename = "useTls")]
    use_tls: bool,
}

#[derive(Debug, Deserialize)]
struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(rename = "serverHost")]
    server_host: String,
    #[serde(rename = "serverPort")]
    server_port: u16,
    #[serde(rename = "useTls", default)]
    use_tls: bool,
}

#[derive(Debug, Deserialize)]
struct ClearEmergency {
    passkey: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    info!(
        "NVS config loaded: ssid=`{}`, server=`{}`",
        runtime.network.wifi_ssid,
        runtime.network.server_base_url()
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let hardware = runtime.hardware.clone();
    let mut ap_led = init_led(hardware.ap_led_pin);
    let ap_button = init_button(hardware.ap_button_pin)
        .map_err(|err| warn!("AP button unavailable on GPIO{}: {err:#}", hardware.ap_button_pin))
        .ok();

    let button_held = ap_button
        .as_ref()
        .is_some_and(|button| held_for(button, hardware.ap_button_hold_ms));
    let force_provisioning = nvs_store.take_provisioning_request() || button_held;

    let wifi = match connect_wifi(
        modem,
        sys_loop.clone(),
        nvs_partition,
        &runtime.network,
        force_provisioning,
    )
    .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => wifi,
        WifiStartup::Provisioning(wifi) => {
            set_led(&mut ap_led, true);
            let _server = create_provisioning_http_server(nvs_store.clone())?;
            let _wifi = wifi;
            thread::sleep(Duration::from_secs(PROVISIONING_PORTAL_TIMEOUT_SEC));
            warn!("provisioning portal timed out; restarting");
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    };

    let mdns = start_mdns(&runtime.network)
        .map_err(|err| warn!("mDNS unavailable: {err:#}"))
        .ok();

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    wait_for_time_sync(&sntp);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let relay_pin = unsafe { PinDriver::output(AnyOutputPin::new(hardware.relay_pin)) }
        .with_context(|| format!("relay unavailable on GPIO{}", hardware.relay_pin))?;
    let emergency = init_button(hardware.emergency_button_pin).with_context(|| {
        format!(
            "emergency input unavailable on GPIO{}",
            hardware.emergency_button_pin
        )
    })?;

    let identity = DeviceIdentity {
        serial_number: runtime.serial_number.clone(),
        hostname: runtime.network.hostname.clone(),
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let transport = EspTransport {
        base_url: runtime.network.server_base_url(),
        timeout: Duration::from_millis(runtime.supervisor.request_timeout_ms),
        processing_led: init_led(hardware.processing_led_pin),
    };
    let node = Node::boot(
        &runtime,
        identity,
        nvs_store.clone(),
        HttpLink::new(transport),
        GpioRelay { pin: relay_pin },
        now(),
    );

    let status = Arc::new(Mutex::new(node.status(now())));
    let (requests, request_rx) = mpsc::channel();
    spawn_control_loop(
        node,
        request_rx,
        status.clone(),
        ControlPins {
            emergency,
            ap_button,
            error_led: init_led(hardware.error_led_pin),
            ap_button_hold_ms: hardware.ap_button_hold_ms,
        },
        nvs_store,
    );

    let server = create_http_server(requests, status)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _mdns = mdns;
    let _sntp = sntp;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

struct ControlPins {
    emergency: PinDriver<'static, AnyIOPin, Input>,
    ap_button: Option<PinDriver<'static, AnyIOPin, Input>>,
    error_led: Option<Led>,
    ap_button_hold_ms: u64,
}

fn spawn_control_loop(
    mut node: EspNode,
    requests: Receiver<LocalCall>,
    status: Arc<Mutex<NodeStatus>>,
    mut pins: ControlPins,
    nvs_store: NvsStore,
) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut ap_pressed_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                let tick = now();

                while let Ok(call) = requests.try_recv() {
                    let result = node
                        .handle_local(call.request, tick)
                        .map(|()| node.status(tick));
                    let _ = call.reply.send(result);
                }

                let inputs = Inputs {
                    emergency_asserted: pins.emergency.is_low(),
                };
                if let StepOutcome::Restart(cause) = node.step(inputs, tick) {
                    warn!("connectivity lost ({}); restarting device", cause.as_str());
                    thread::sleep(Duration::from_millis(100));
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }

                let snapshot = node.status(tick);
                set_led(
                    &mut pins.error_led,
                    snapshot.consecutive_failures > 0 || snapshot.emergency_active,
                );
                if let Ok(mut current) = status.lock() {
                    *current = snapshot;
                }

                let ap_pressed = pins.ap_button.as_ref().is_some_and(|button| button.is_low());
                if !ap_pressed {
                    ap_pressed_since_ms = None;
                } else {
                    let since = *ap_pressed_since_ms.get_or_insert(tick.ms);
                    if tick.ms.saturating_sub(since) >= pins.ap_button_hold_ms {
                        warn!("AP button held; restarting into provisioning mode");
                        if let Err(err) = nvs_store.request_provisioning() {
                            warn!("failed to store provisioning request: {err:#}");
                        }
                        thread::sleep(Duration::from_millis(100));
                        unsafe { esp_idf_svc::sys::esp_restart() };
                    }
                }

                thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
            }
        })
        .expect("failed to spawn control loop thread");
}

fn create_http_server(
    requests: Sender<LocalCall>,
    status: Arc<Mutex<NodeStatus>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: LOCAL_API_PORT,
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler("/api/status", Method::Get, move |req| {
        let snapshot = status
            .lock()
            .map_err(|_| anyhow!("status lock poisoned"))?
            .clone();
        write_json(req, &snapshot)
    })?;

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/api/command", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(command) = serde_json::from_slice::<ServerCommand>(&body) else {
                return write_error(req, 400, "Invalid command payload");
            };
            respond(req, submit(&requests, LocalRequest::Command(command)))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/emergency", Method::Post, move |req| {
            respond(req, submit(&requests, LocalRequest::Emergency))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>(
            "/api/emergency/clear",
            Method::Post,
            move |mut req| {
                let body = read_request_body(&mut req)?;
                let Ok(clear) = serde_json::from_slice::<ClearEmergency>(&body) else {
                    return write_error(req, 400, "Missing 'passkey'");
                };
                let request = LocalRequest::ClearEmergency {
                    passkey: clear.passkey,
                };
                respond(req, submit(&requests, request))
            },
        )?;
    }

    server.fn_handler("/api/factory-reset", Method::Post, move |req| {
        respond(req, submit(&requests, LocalRequest::FactoryReset))
    })?;

    Ok(server)
}

fn create_provisioning_http_server(nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/network", Method::Get, move |req| {
            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            write_json(req, &build_network_config_view(&runtime.network))
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: NetworkConfigUpdate =
            serde_json::from_slice(&body).context("invalid network payload")?;

        if let Err(message) = validate_network_update(&update) {
            return write_error(req, 400, message);
        }

        let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
        runtime.network.wifi_ssid = update.wifi_ssid.trim().to_string();
        if let Some(pass) = update.wifi_pass {
            runtime.network.wifi_pass = pass;
        }
        runtime.network.server_host = update.server_host.trim().to_string();
        runtime.network.server_port = update.server_port;
        runtime.network.use_tls = update.use_tls;
        nvs_store.save_runtime_config(&runtime)?;

        thread::Builder::new()
            .name("prov-restart".into())
            .spawn(|| {
                thread::sleep(Duration::from_secs(3));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })
            .expect("failed to spawn restart thread");

        write_json(req, &build_network_config_view(&runtime.network))
    })?;

    Ok(server)
}

fn submit(requests: &Sender<LocalCall>, request: LocalRequest) -> Result<NodeStatus, (u16, String)> {
    let (reply, response) = mpsc::channel();
    requests
        .send(LocalCall { request, reply })
        .map_err(|_| (503, "Control loop is not running".to_string()))?;

    match response.recv_timeout(LOCAL_REPLY_TIMEOUT) {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(err)) => Err((err.http_status(), err.to_string())),
        Err(_) => Err((504, "Control loop did not answer".to_string())),
    }
}

fn respond(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    result: Result<NodeStatus, (u16, String)>,
) -> anyhow::Result<()> {
    match result {
        Ok(status) => write_json(req, &status),
        Err((code, message)) => write_error(req, code, &message),
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn validate_network_update(update: &NetworkConfigUpdate) -> Result<(), &'static str> {
    let ssid = update.wifi_ssid.trim();
    if ssid.is_empty() || ssid.len() > 32 {
        return Err("wifiSsid must be 1-32 characters");
    }
    if update.wifi_pass.as_ref().is_some_and(|pass| pass.len() > 64) {
        return Err("wifiPass must be at most 64 characters");
    }
    if update.server_host.trim().is_empty() {
        return Err("serverHost is required");
    }
    if update.server_port == 0 {
        return Err("serverPort must be non-zero");
    }
    Ok(())
}

fn build_network_config_view(network: &NetworkConfig) -> NetworkConfigView {
    NetworkConfigView {
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
        server_host: network.server_host.clone(),
        server_port: network.server_port,
        use_tls: network.use_tls,
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    force_provisioning: bool,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if force_provisioning || network.wifi_ssid.trim().is_empty() {
        warn!("entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.wifi_mut()
        .sta_netif_mut()
        .set_hostname(network.mdns_hostname())?;
    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("wifi unavailable ({err:#}); entering provisioning AP mode");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{PROVISIONING_AP_SSID}`");
    Ok(())
}

/// Announces the device API as `<hostname>.local` on the LAN.
fn start_mdns(network: &NetworkConfig) -> anyhow::Result<EspMdns> {
    let hostname = network.mdns_hostname();
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(hostname)?;
    mdns.set_instance_name("Lightmaster relay node")?;
    mdns.add_service(
        None,
        "_http",
        "_tcp",
        LOCAL_API_PORT,
        &[("path", "/api/status"), ("fw", env!("CARGO_PKG_VERSION"))],
    )?;
    info!("mDNS announcing {hostname}.local on port {LOCAL_API_PORT}");
    Ok(mdns)
}

fn wait_for_time_sync(sntp: &EspSntp<'static>) {
    let started = Instant::now();
    while sntp.get_sync_status() != SyncStatus::Completed {
        if started.elapsed() >= Duration::from_secs(SNTP_WAIT_SEC) {
            warn!("SNTP not synced after {SNTP_WAIT_SEC}s; continuing without wall clock");
            return;
        }
        thread::sleep(Duration::from_millis(250));
    }
    info!("SNTP synced");
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }

    fn request_provisioning(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_u8(NVS_PROVISION_KEY, 1)?;
        Ok(())
    }

    fn take_provisioning_request(&self) -> bool {
        let Ok(_guard) = self.lock.lock() else {
            return false;
        };
        let Ok(mut nvs) = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true) else {
            return false;
        };
        let requested = matches!(nvs.get_u8(NVS_PROVISION_KEY), Ok(Some(1)));
        if requested {
            if let Err(err) = nvs.remove(NVS_PROVISION_KEY) {
                warn!("failed to clear provisioning request: {err:?}");
            }
        }
        requested
    }
}

fn nvs_err(err: EspError) -> StoreError {
    StoreError::Backend(format!("nvs: {err}"))
}

fn transport_err<E: core::fmt::Debug>(err: E) -> LinkError {
    LinkError::Transport(format!("{err:?}"))
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn init_led(pin: i32) -> Option<Led> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(Led { pin, lit: false })
        }
        Err(err) => {
            warn!("LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn set_led(led: &mut Option<Led>, on: bool) {
    let Some(led) = led.as_mut() else {
        return;
    };
    if led.lit == on {
        return;
    }

    let result = if on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };
    if let Err(err) = result {
        warn!("failed to drive LED: {err}");
    } else {
        led.lit = on;
    }
}

/// Active-low push button with the internal pull-up enabled.
fn init_button(pin: i32) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut driver = unsafe { PinDriver::input(AnyIOPin::new(pin)) }?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

fn held_for(button: &PinDriver<'static, AnyIOPin, Input>, hold_ms: u64) -> bool {
    let started = Instant::now();
    while button.is_low() {
        if started.elapsed() >= Duration::from_millis(hold_ms) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
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
