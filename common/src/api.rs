use serde::{Deserialize, Serialize};

use crate::record::PendingStop;

pub const REGISTER_DEVICE_PATH: &str = "/api/device/insert";
pub const UPDATE_DEVICE_PATH: &str = "/api/device/update";
pub const STOP_DEVICE_PATH: &str = "/api/device-time/end";
pub const PAUSE_DEVICE_PATH: &str = "/api/device-time/pause";
pub const HEARTBEAT_DEVICE_PATH: &str = "/api/device/heartbeat";
pub const DEVICE_DELETE_RESPONSE_PATH: &str = "/api/device/response/delete";

/// Commands the server delivers in a heartbeat response or through the local API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerCommand {
    Start {
        #[serde(rename = "threadId")]
        thread_id: u32,
        #[serde(default)]
        seconds: u32,
        #[serde(rename = "openTime", default)]
        open_time: bool,
        #[serde(default)]
        free: bool,
    },
    Pause {
        #[serde(rename = "threadId")]
        thread_id: u32,
    },
    Resume {
        #[serde(rename = "threadId")]
        thread_id: u32,
    },
    Stop {
        #[serde(rename = "threadId")]
        thread_id: u32,
    },
    TopUp {
        #[serde(rename = "threadId")]
        thread_id: u32,
        seconds: u32,
    },
    DeleteAck {
        #[serde(rename = "threadId")]
        thread_id: u32,
    },
}

impl ServerCommand {
    pub fn thread_id(&self) -> u32 {
        match *self {
            Self::Start { thread_id, .. }
            | Self::Pause { thread_id }
            | Self::Resume { thread_id }
            | Self::Stop { thread_id }
            | Self::TopUp { thread_id, .. }
            | Self::DeleteAck { thread_id } => thread_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Stop { .. } => "stop",
            Self::TopUp { .. } => "topUp",
            Self::DeleteAck { .. } => "deleteAck",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub serial_number: String,
    pub hostname: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub device_id: String,
    pub thread_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub device_id: String,
    pub serial_number: String,
    pub hostname: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateResponse {
    pub watchdog_interval_minutes: Option<u32>,
    pub emergency_passkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub device_id: String,
    pub thread_id: u32,
    pub state: &'static str,
    pub stored_time_seconds: u32,
    pub is_paused: bool,
    pub is_free: bool,
    pub is_open_time: bool,
    pub is_manual_mode: bool,
    pub pending_stop: Option<PendingStop>,
    pub needs_reconciliation: bool,
    pub last_rejection: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatResponse {
    pub command: Option<ServerCommand>,
}

/// Body of the pause and end reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub device_id: String,
    pub thread_id: u32,
    pub stored_time_seconds: u32,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConfirmation {
    pub device_id: String,
    pub thread_id: u32,
}
