use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// Widths of the legacy fixed-offset layout, kept as validation bounds.
pub const DEVICE_ID_WIDTH: usize = 5;
pub const EMERGENCY_PASSKEY_WIDTH: usize = 50;
pub const START_DATE_TIME_WIDTH: usize = 19;

const RECORD_MAGIC: u32 = 0x3152_4D4C; // "LMR1"
const RECORD_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Expired,
    Commanded,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "EXPIRED",
            Self::Commanded => "COMMANDED",
        }
    }
}

/// Where the metering session stands, independent of the manual overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Unregistered,
    Idle,
    Running,
    Paused,
    Stopped(StopReason),
}

/// A stop or expiry the server has not acknowledged yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStop {
    pub thread_id: u32,
    pub reason: StopReason,
    pub stored_time_seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceRecord {
    pub device_id: String,
    pub emergency_passkey: String,
    pub watchdog_interval_minutes: u32,
    pub stored_time_seconds: u32,
    pub last_millis_snapshot: u64,
    pub is_registered: bool,
    pub is_paused: bool,
    pub is_free: bool,
    pub is_open_time: bool,
    pub is_led_on: bool,
    pub start_date_time: String,
    pub thread_id: u32,
    pub spiffs_write_interval_seconds: u32,
    pub is_manual_mode: bool,
    pub phase: SessionPhase,
    pub pending_stop: Option<PendingStop>,
    pub snapshot_epoch_secs: Option<i64>,
    pub needs_reconciliation: bool,
}

impl DeviceRecord {
    /// True when elapsed time is charged against `stored_time_seconds`.
    pub fn is_counting_down(&self) -> bool {
        self.phase == SessionPhase::Running
            && !self.is_manual_mode
            && !self.is_paused
            && !self.is_free
            && !self.is_open_time
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.device_id.len() > DEVICE_ID_WIDTH {
            return Err(format!("deviceId exceeds {DEVICE_ID_WIDTH} bytes"));
        }
        if self.emergency_passkey.len() > EMERGENCY_PASSKEY_WIDTH {
            return Err(format!(
                "emergencyPasskey exceeds {EMERGENCY_PASSKEY_WIDTH} bytes"
            ));
        }
        if self.start_date_time.len() > START_DATE_TIME_WIDTH {
            return Err(format!(
                "startDateTime exceeds {START_DATE_TIME_WIDTH} bytes"
            ));
        }
        if self.is_registered == (self.phase == SessionPhase::Unregistered) {
            return Err("isRegistered disagrees with session phase".to_string());
        }
        if self.is_paused != (self.phase == SessionPhase::Paused) {
            return Err("isPaused disagrees with session phase".to_string());
        }

        match self.phase {
            SessionPhase::Running | SessionPhase::Paused if self.thread_id == 0 => {
                Err("active session without threadId".to_string())
            }
            SessionPhase::Stopped(reason) => match self.pending_stop {
                Some(pending) if pending.reason == reason => Ok(()),
                _ => Err("stopped session without matching pending stop".to_string()),
            },
            _ if self.pending_stop.is_some() => {
                Err("pending stop outside of a stopped session".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    magic: u32,
    version: u8,
    checksum: u32,
    record: String,
}

pub fn encode(record: &DeviceRecord) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_string(record).map_err(|err| StoreError::Encode(err.to_string()))?;
    let envelope = RecordEnvelope {
        magic: RECORD_MAGIC,
        version: RECORD_VERSION,
        checksum: checksum32(body.as_bytes()),
        record: body,
    };
    serde_json::to_vec(&envelope).map_err(|err| StoreError::Encode(err.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<DeviceRecord, StoreError> {
    let envelope: RecordEnvelope = serde_json::from_slice(bytes)
        .map_err(|err| StoreError::CorruptRecord(format!("unreadable envelope: {err}")))?;

    if envelope.magic != RECORD_MAGIC {
        return Err(StoreError::CorruptRecord(format!(
            "bad magic {:#010x}",
            envelope.magic
        )));
    }
    if envelope.version != RECORD_VERSION {
        return Err(StoreError::CorruptRecord(format!(
            "unsupported record version {}",
            envelope.version
        )));
    }

    let checksum = checksum32(envelope.record.as_bytes());
    if checksum != envelope.checksum {
        return Err(StoreError::CorruptRecord(format!(
            "checksum mismatch (stored {:#010x}, computed {checksum:#010x})",
            envelope.checksum
        )));
    }

    let record: DeviceRecord = serde_json::from_str(&envelope.record)
        .map_err(|err| StoreError::CorruptRecord(format!("unreadable record: {err}")))?;
    record.validate().map_err(StoreError::CorruptRecord)?;
    Ok(record)
}

// FNV-1a.
fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C_9DC5_u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}
