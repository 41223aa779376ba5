use serde::Serialize;

use crate::record::{PendingStop, SessionPhase, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterState {
    Unregistered,
    Idle,
    Running,
    Paused,
    Stopped(StopReason),
    Manual,
}

impl MeterState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped(StopReason::Expired) => "STOPPED_EXPIRED",
            Self::Stopped(StopReason::Commanded) => "STOPPED_COMMANDED",
            Self::Manual => "MANUAL",
        }
    }
}

impl From<SessionPhase> for MeterState {
    fn from(phase: SessionPhase) -> Self {
        match phase {
            SessionPhase::Unregistered => Self::Unregistered,
            SessionPhase::Idle => Self::Idle,
            SessionPhase::Running => Self::Running,
            SessionPhase::Paused => Self::Paused,
            SessionPhase::Stopped(reason) => Self::Stopped(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub state: &'static str,
    #[serde(rename = "threadId")]
    pub thread_id: u32,
    #[serde(rename = "storedTimeSeconds")]
    pub stored_time_seconds: u32,
    #[serde(rename = "startDateTime")]
    pub start_date_time: String,
    #[serde(rename = "isPaused")]
    pub is_paused: bool,
    #[serde(rename = "isFree")]
    pub is_free: bool,
    #[serde(rename = "isOpenTime")]
    pub is_open_time: bool,
    #[serde(rename = "isManualMode")]
    pub is_manual_mode: bool,
    #[serde(rename = "outputOn")]
    pub output_on: bool,
    #[serde(rename = "emergencyActive")]
    pub emergency_active: bool,
    #[serde(rename = "pendingStop")]
    pub pending_stop: Option<PendingStop>,
    #[serde(rename = "needsReconciliation")]
    pub needs_reconciliation: bool,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "writeIntervalSeconds")]
    pub write_interval_seconds: u32,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}
