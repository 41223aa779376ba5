use serde::{Deserialize, Serialize};

pub const SERIAL_NUMBER: &str = "225B0-2-3";
pub const DEVICE_HOSTNAME: &str = "lightmaster.local";
pub const MIN_SPIFFS_WRITE_INTERVAL: u32 = 10;
pub const MAX_SPIFFS_WRITES_COUNTS: u32 = 20;
pub const MAX_DISCONNECT_COUNTS: u32 = 4;
pub const GRACE_PERIOD_SECONDS: u32 = 3;
pub const AP_BUTTON_HOLD_DURATION_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Added to every metered start so the relay warm-up is not billed.
    pub grace_period_seconds: u32,
    pub max_session_seconds: u32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: GRACE_PERIOD_SECONDS,
            max_session_seconds: 7 * 24 * 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub min_write_interval_seconds: u32,
    pub max_writes_per_window: u32,
    pub write_window_seconds: u32,
    pub max_write_interval_seconds: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_write_interval_seconds: MIN_SPIFFS_WRITE_INTERVAL,
            max_writes_per_window: MAX_SPIFFS_WRITES_COUNTS,
            write_window_seconds: 600,
            max_write_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub heartbeat_interval_ms: u64,
    pub max_disconnect_counts: u32,
    /// Used while the record carries no server-assigned watchdog interval.
    pub default_watchdog_minutes: u32,
    pub request_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            max_disconnect_counts: MAX_DISCONNECT_COUNTS,
            default_watchdog_minutes: 15,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    pub hostname: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            server_host: "192.168.1.100".to_string(),
            server_port: 80,
            use_tls: false,
            hostname: DEVICE_HOSTNAME.to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn server_base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.server_host, self.server_port)
    }

    /// Host label announced over mDNS and DHCP; the `.local` suffix is implied.
    pub fn mdns_hostname(&self) -> &str {
        let label = self.hostname.trim().trim_end_matches('.');
        let label = label.strip_suffix(".local").unwrap_or(label);
        if label.is_empty() {
            DEVICE_HOSTNAME.trim_end_matches(".local")
        } else {
            label
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub relay_pin: i32,
    pub ap_button_pin: i32,
    pub emergency_button_pin: i32,
    pub ap_led_pin: i32,
    pub error_led_pin: i32,
    pub processing_led_pin: i32,
    pub ap_button_hold_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 5,
            ap_button_pin: 4,
            emergency_button_pin: 0,
            ap_led_pin: 2,
            error_led_pin: 13,
            processing_led_pin: 15,
            ap_button_hold_ms: AP_BUTTON_HOLD_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub meter: MeterConfig,
    pub store: StoreConfig,
    pub supervisor: SupervisorConfig,
    pub network: NetworkConfig,
    pub hardware: HardwareConfig,
    pub serial_number: String,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            store: StoreConfig::default(),
            supervisor: SupervisorConfig::default(),
            network: NetworkConfig::default(),
            hardware: HardwareConfig::default(),
            serial_number: SERIAL_NUMBER.to_string(),
            timezone: "Asia/Manila".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.meter.sanitize();
        self.store.sanitize();
        self.supervisor.sanitize();
        self.hardware.sanitize();
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.timezone = "UTC".to_string();
        }
        if self.serial_number.trim().is_empty() {
            self.serial_number = SERIAL_NUMBER.to_string();
        }
    }
}

impl MeterConfig {
    pub fn sanitize(&mut self) {
        self.grace_period_seconds = self.grace_period_seconds.min(60);
        self.max_session_seconds = self.max_session_seconds.max(60);
    }
}

impl StoreConfig {
    pub fn sanitize(&mut self) {
        self.min_write_interval_seconds = self.min_write_interval_seconds.clamp(1, 3_600);
        self.max_write_interval_seconds = self
            .max_write_interval_seconds
            .clamp(self.min_write_interval_seconds, 24 * 3_600);
        self.max_writes_per_window = self.max_writes_per_window.max(1);
        self.write_window_seconds = self.write_window_seconds.max(60);
    }
}

impl SupervisorConfig {
    pub fn sanitize(&mut self) {
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.clamp(1_000, 600_000);
        self.max_disconnect_counts = self.max_disconnect_counts.max(1);
        self.default_watchdog_minutes = self.default_watchdog_minutes.clamp(1, 24 * 60);
        // A request must never outlast the heartbeat period it belongs to.
        self.request_timeout_ms = self
            .request_timeout_ms
            .clamp(500, self.heartbeat_interval_ms);
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.relay_pin < 0 {
            self.relay_pin = defaults.relay_pin;
        }
        if self.emergency_button_pin < 0 {
            self.emergency_button_pin = defaults.emergency_button_pin;
        }
        self.ap_button_hold_ms = self.ap_button_hold_ms.clamp(200, 10_000);
    }
}
