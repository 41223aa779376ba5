use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("periodic save throttled, retry in {retry_in_secs}s")]
    Throttled { retry_in_secs: u64 },
    #[error("persisted record is corrupt: {0}")]
    CorruptRecord(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("failed to encode record: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeterError {
    #[error("`{command}` is not valid while {state}")]
    InvalidTransition {
        state: &'static str,
        command: &'static str,
    },
    #[error("command for thread {received} does not match active thread {active}")]
    StaleCommand { active: u32, received: u32 },
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("server request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server answered with HTTP {0}")]
    Status(u16),
    #[error("malformed server response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SafetyError {
    #[error("emergency passkey rejected")]
    WrongPasskey,
    #[error("emergency input is still asserted")]
    EmergencyActive,
    #[error("device is not in manual mode")]
    NotInManual,
    #[error("no emergency passkey has been provisioned")]
    PasskeyNotConfigured,
}

/// Failure of a request arriving over the local device API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Meter(#[from] MeterError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NodeError {
    /// Status code the local device API answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Meter(MeterError::InvalidCommand(_)) => 400,
            Self::Meter(_) => 409,
            Self::Safety(SafetyError::WrongPasskey) => 403,
            Self::Safety(_) => 409,
            Self::Store(_) => 500,
        }
    }
}
