use log::{debug, info, warn};

use crate::{
    config::StoreConfig,
    error::StoreError,
    record::{self, DeviceRecord},
};

/// Raw non-volatile medium holding one encoded record.
///
/// `write` must replace the previous contents atomically: after a power loss
/// mid-write, `read` returns either the old or the new bytes.
pub trait RecordBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    /// Countdown progress; subject to the write interval.
    Periodic,
    /// State-machine edge; bypasses the interval but counts toward wear.
    Transition,
}

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    pub bytes: Option<Vec<u8>>,
    pub writes: usize,
    pub fail_writes: bool,
}

#[cfg(test)]
impl RecordBackend for MemoryBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.bytes.clone())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Backend("simulated write failure".to_string()));
        }
        self.bytes = Some(bytes.to_vec());
        self.writes += 1;
        Ok(())
    }
}

pub struct PersistentStore<B> {
    backend: B,
    config: StoreConfig,
    last_save_ms: Option<u64>,
    window_start_ms: u64,
    transition_writes: u32,
}

impl<B: RecordBackend> PersistentStore<B> {
    pub fn new(backend: B, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            last_save_ms: None,
            window_start_ms: 0,
            transition_writes: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    #[cfg(test)]
    pub(crate) fn transition_writes(&self) -> u32 {
        self.transition_writes
    }

    /// Loads the record; a blank medium yields the first-boot default.
    pub fn load(&mut self) -> Result<DeviceRecord, StoreError> {
        let mut record = match self.backend.read()? {
            Some(bytes) => record::decode(&bytes)?,
            None => DeviceRecord::default(),
        };

        if record.spiffs_write_interval_seconds < self.config.min_write_interval_seconds {
            record.spiffs_write_interval_seconds = self.config.min_write_interval_seconds;
        }
        Ok(record)
    }

    pub fn save(
        &mut self,
        record: &mut DeviceRecord,
        reason: SaveReason,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.roll_window(record, now_ms);
        let interval_secs = self.interval_secs(record);
        // Persist the effective interval so a reload matches what was saved.
        record.spiffs_write_interval_seconds = interval_secs;

        match reason {
            SaveReason::Periodic => {
                if let Some(last) = self.last_save_ms {
                    let elapsed_ms = now_ms.saturating_sub(last);
                    let interval_ms = u64::from(interval_secs) * 1_000;
                    if elapsed_ms < interval_ms {
                        return Err(StoreError::Throttled {
                            retry_in_secs: (interval_ms - elapsed_ms).div_ceil(1_000),
                        });
                    }
                }
            }
            SaveReason::Transition => {
                self.transition_writes = self.transition_writes.saturating_add(1);
                if self.transition_writes > self.config.max_writes_per_window {
                    self.degrade_interval(record, interval_secs);
                }
            }
        }

        let bytes = record::encode(record)?;
        self.backend.write(&bytes)?;
        self.last_save_ms = Some(now_ms);
        debug!("record persisted ({reason:?}, {} bytes)", bytes.len());
        Ok(())
    }

    /// Zeroes the record in a single backend write.
    pub fn factory_reset(&mut self, now_ms: u64) -> Result<DeviceRecord, StoreError> {
        let record = DeviceRecord {
            spiffs_write_interval_seconds: self.config.min_write_interval_seconds,
            ..DeviceRecord::default()
        };
        let bytes = record::encode(&record)?;
        self.backend.write(&bytes)?;
        self.last_save_ms = Some(now_ms);
        self.window_start_ms = now_ms;
        self.transition_writes = 0;
        warn!("device record reset to factory defaults");
        Ok(record)
    }

    fn interval_secs(&self, record: &DeviceRecord) -> u32 {
        record
            .spiffs_write_interval_seconds
            .max(self.config.min_write_interval_seconds)
    }

    fn degrade_interval(&self, record: &mut DeviceRecord, current_secs: u32) {
        let degraded = current_secs
            .saturating_mul(2)
            .min(self.config.max_write_interval_seconds);
        if degraded != record.spiffs_write_interval_seconds {
            warn!(
                "{} transition writes within window (max {}); write interval {}s -> {}s",
                self.transition_writes,
                self.config.max_writes_per_window,
                current_secs,
                degraded
            );
            record.spiffs_write_interval_seconds = degraded;
        }
    }

    fn roll_window(&mut self, record: &mut DeviceRecord, now_ms: u64) {
        let window_ms = u64::from(self.config.write_window_seconds) * 1_000;
        if now_ms.saturating_sub(self.window_start_ms) < window_ms {
            return;
        }

        let quiet = self.transition_writes <= self.config.max_writes_per_window;
        let current = self.interval_secs(record);
        if quiet && current > self.config.min_write_interval_seconds {
            let relaxed = (current / 2).max(self.config.min_write_interval_seconds);
            info!("write burst subsided; write interval {current}s -> {relaxed}s");
            record.spiffs_write_interval_seconds = relaxed;
        }

        self.window_start_ms = now_ms;
        self.transition_writes = 0;
    }
}
