use chrono_tz::Tz;
use log::{info, warn};

use crate::{
    api::ServerCommand,
    clock::{format_start_date_time, Now},
    config::MeterConfig,
    error::MeterError,
    record::{
        DeviceRecord, PendingStop, SessionPhase, StopReason, DEVICE_ID_WIDTH,
        EMERGENCY_PASSKEY_WIDTH,
    },
    store::SaveReason,
    types::MeterState,
};

/// Side effects the control loop carries out after an engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterAction {
    Persist(SaveReason),
    ReportStop(StopReason),
    ReportPause,
    ConfirmDelete { thread_id: u32 },
}

/// The metering state machine. Sole owner and writer of the [`DeviceRecord`].
#[derive(Debug, Clone)]
pub struct MeterEngine {
    config: MeterConfig,
    timezone: Tz,
    record: DeviceRecord,
    last_rejection: Option<String>,
}

impl MeterEngine {
    pub fn new(config: MeterConfig, timezone: &str, record: DeviceRecord) -> Self {
        let timezone = timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!("unknown timezone `{timezone}`, formatting session starts in UTC");
            chrono_tz::UTC
        });

        Self {
            config,
            timezone,
            record,
            last_rejection: None,
        }
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    /// Store policy may adjust the write-interval field on save.
    pub(crate) fn record_mut(&mut self) -> &mut DeviceRecord {
        &mut self.record
    }

    pub fn state(&self) -> MeterState {
        if self.record.is_manual_mode {
            MeterState::Manual
        } else {
            self.record.phase.into()
        }
    }

    pub fn is_manual(&self) -> bool {
        self.record.is_manual_mode
    }

    pub fn output_allowed(&self) -> bool {
        !self.record.is_manual_mode
            && self.record.phase == SessionPhase::Running
            && (self.record.is_free || self.record.is_open_time || self.record.stored_time_seconds > 0)
    }

    pub fn set_led(&mut self, on: bool) {
        self.record.is_led_on = on;
    }

    pub fn last_rejection(&self) -> Option<&str> {
        self.last_rejection.as_deref()
    }

    pub fn take_rejection(&mut self) -> Option<String> {
        self.last_rejection.take()
    }

    /// Replaces the record wholesale, e.g. after a factory reset.
    pub fn reset(&mut self, record: DeviceRecord) {
        self.record = record;
        self.last_rejection = None;
    }

    /// Reconciles a record loaded at boot with the time that passed while off.
    ///
    /// The monotonic clock restarts with the device, so only a wall-clock delta
    /// is trusted. Without one no time is charged and the session is flagged
    /// for server reconciliation.
    pub fn recover(&mut self, now: Now) -> Vec<MeterAction> {
        if !self.record.is_counting_down() {
            self.stamp_snapshot(now.ms, now);
            return Vec::new();
        }

        let gap_secs = match (self.record.snapshot_epoch_secs, now.epoch_secs) {
            (Some(then), Some(current)) if current >= then => Some((current - then) as u64),
            _ => None,
        };
        self.stamp_snapshot(now.ms, now);

        let Some(gap_secs) = gap_secs else {
            warn!(
                "no reliable clock across reboot; keeping {}s and flagging thread {} for reconciliation",
                self.record.stored_time_seconds, self.record.thread_id
            );
            self.record.needs_reconciliation = true;
            return vec![MeterAction::Persist(SaveReason::Transition)];
        };

        let charged = gap_secs.min(u64::from(self.record.stored_time_seconds)) as u32;
        self.record.stored_time_seconds -= charged;
        info!(
            "charged {charged}s of downtime to thread {}, {}s left",
            self.record.thread_id, self.record.stored_time_seconds
        );

        if self.record.stored_time_seconds == 0 {
            self.expire()
        } else {
            vec![MeterAction::Persist(SaveReason::Transition)]
        }
    }

    pub fn register(
        &mut self,
        device_id: &str,
        thread_id: u32,
        now: Now,
    ) -> Result<Vec<MeterAction>, MeterError> {
        if self.record.phase != SessionPhase::Unregistered {
            return Err(self.invalid("register"));
        }
        if device_id.is_empty() || device_id.len() > DEVICE_ID_WIDTH {
            return Err(MeterError::InvalidCommand(
                "deviceId does not fit the device record",
            ));
        }

        self.record.device_id = device_id.to_string();
        self.record.thread_id = thread_id;
        self.record.is_registered = true;
        self.record.phase = SessionPhase::Idle;
        self.clear_accounting();
        self.stamp_snapshot(now.ms, now);
        info!("registered as device {device_id} (thread {thread_id})");

        Ok(vec![MeterAction::Persist(SaveReason::Transition)])
    }

    /// Applies non-accounting fields from a metadata sync.
    pub fn apply_metadata(
        &mut self,
        watchdog_interval_minutes: Option<u32>,
        emergency_passkey: Option<&str>,
    ) -> Vec<MeterAction> {
        let mut changed = false;

        if let Some(minutes) = watchdog_interval_minutes {
            if minutes != self.record.watchdog_interval_minutes {
                self.record.watchdog_interval_minutes = minutes;
                changed = true;
            }
        }

        if let Some(passkey) = emergency_passkey {
            if passkey.len() > EMERGENCY_PASSKEY_WIDTH {
                warn!("ignoring emergency passkey longer than {EMERGENCY_PASSKEY_WIDTH} bytes");
            } else if passkey != self.record.emergency_passkey {
                self.record.emergency_passkey = passkey.to_string();
                changed = true;
            }
        }

        if changed {
            vec![MeterAction::Persist(SaveReason::Transition)]
        } else {
            Vec::new()
        }
    }

    /// Applies a server command. Rejected commands leave the record untouched
    /// and are remembered for the next heartbeat.
    pub fn apply_command(
        &mut self,
        command: ServerCommand,
        now: Now,
    ) -> Result<Vec<MeterAction>, MeterError> {
        let result = self.dispatch(command, now);
        if let Err(err) = &result {
            warn!("rejected {} command: {err}", command.name());
            self.last_rejection = Some(format!("{}: {err}", command.name()));
        }
        result
    }

    pub fn tick(&mut self, now: Now) -> Vec<MeterAction> {
        if !self.record.is_counting_down() {
            self.stamp_snapshot(now.ms, now);
            return Vec::new();
        }
        self.settle(now)
    }

    pub fn enter_manual(&mut self, now: Now) -> Vec<MeterAction> {
        if self.record.is_manual_mode {
            return Vec::new();
        }

        let actions = self.settle(now);
        let was_running = self.record.phase == SessionPhase::Running;
        self.record.is_manual_mode = true;
        self.stamp_snapshot(now.ms, now);
        warn!(
            "manual mode engaged while {}",
            MeterState::from(self.record.phase).as_str()
        );

        let mut actions = with_transition(actions);
        if was_running {
            actions.push(MeterAction::ReportPause);
        }
        actions
    }

    pub fn exit_manual(&mut self, now: Now) -> Result<Vec<MeterAction>, MeterError> {
        if !self.record.is_manual_mode {
            return Err(self.invalid("exitManual"));
        }

        self.record.is_manual_mode = false;
        self.stamp_snapshot(now.ms, now);
        info!(
            "manual mode released, resuming {}",
            MeterState::from(self.record.phase).as_str()
        );
        Ok(vec![MeterAction::Persist(SaveReason::Transition)])
    }

    /// Clears the reconciliation flag once the server has seen it.
    pub fn mark_reconciled(&mut self) -> Vec<MeterAction> {
        if !self.record.needs_reconciliation {
            return Vec::new();
        }
        self.record.needs_reconciliation = false;
        vec![MeterAction::Persist(SaveReason::Transition)]
    }

    fn dispatch(&mut self, command: ServerCommand, now: Now) -> Result<Vec<MeterAction>, MeterError> {
        match command {
            ServerCommand::Start {
                thread_id,
                seconds,
                open_time,
                free,
            } => self.start(thread_id, seconds, open_time, free, now),
            ServerCommand::DeleteAck { thread_id } => self.acknowledge_stop(thread_id),
            ServerCommand::Pause { thread_id } => {
                self.check_thread(thread_id, "pause")?;
                self.pause(now)
            }
            ServerCommand::Resume { thread_id } => {
                self.check_thread(thread_id, "resume")?;
                self.resume(now)
            }
            ServerCommand::Stop { thread_id } => {
                self.check_thread(thread_id, "stop")?;
                self.stop(now)
            }
            ServerCommand::TopUp { thread_id, seconds } => {
                self.check_thread(thread_id, "topUp")?;
                self.top_up(seconds)
            }
        }
    }

    fn start(
        &mut self,
        thread_id: u32,
        seconds: u32,
        open_time: bool,
        free: bool,
        now: Now,
    ) -> Result<Vec<MeterAction>, MeterError> {
        if self.record.phase != SessionPhase::Idle {
            return Err(self.invalid("start"));
        }
        if thread_id == 0 {
            return Err(MeterError::InvalidCommand("start requires a threadId"));
        }

        let metered = !open_time && !free;
        if metered && seconds == 0 {
            return Err(MeterError::InvalidCommand("metered start requires seconds"));
        }

        let seconds = seconds.min(self.config.max_session_seconds);
        let granted = if metered {
            seconds.saturating_add(self.config.grace_period_seconds)
        } else {
            seconds
        };

        self.record.thread_id = thread_id;
        self.record.stored_time_seconds = granted;
        self.record.is_free = free;
        self.record.is_open_time = open_time;
        self.record.is_paused = false;
        self.record.needs_reconciliation = false;
        self.record.start_date_time = format_start_date_time(now.epoch_secs, self.timezone);
        self.record.phase = SessionPhase::Running;
        self.stamp_snapshot(now.ms, now);
        info!("thread {thread_id} started: {granted}s, free={free}, openTime={open_time}");

        Ok(vec![MeterAction::Persist(SaveReason::Transition)])
    }

    fn pause(&mut self, now: Now) -> Result<Vec<MeterAction>, MeterError> {
        match self.record.phase {
            SessionPhase::Paused => Ok(Vec::new()),
            SessionPhase::Running => {
                let actions = self.settle(now);
                if self.record.phase != SessionPhase::Running {
                    return Ok(actions);
                }

                self.record.is_paused = true;
                self.record.phase = SessionPhase::Paused;
                self.stamp_snapshot(now.ms, now);
                info!(
                    "thread {} paused with {}s left",
                    self.record.thread_id, self.record.stored_time_seconds
                );
                Ok(with_transition(actions))
            }
            _ => Err(self.invalid("pause")),
        }
    }

    fn resume(&mut self, now: Now) -> Result<Vec<MeterAction>, MeterError> {
        match self.record.phase {
            SessionPhase::Running => Ok(Vec::new()),
            SessionPhase::Paused => {
                self.record.is_paused = false;
                self.record.phase = SessionPhase::Running;
                self.stamp_snapshot(now.ms, now);
                info!("thread {} resumed", self.record.thread_id);
                Ok(vec![MeterAction::Persist(SaveReason::Transition)])
            }
            _ => Err(self.invalid("resume")),
        }
    }

    fn stop(&mut self, now: Now) -> Result<Vec<MeterAction>, MeterError> {
        match self.record.phase {
            SessionPhase::Stopped(_) => Ok(Vec::new()),
            SessionPhase::Running | SessionPhase::Paused => {
                let actions = self.settle(now);
                if matches!(self.record.phase, SessionPhase::Stopped(_)) {
                    return Ok(actions);
                }

                self.hold_stop(StopReason::Commanded);
                self.stamp_snapshot(now.ms, now);
                Ok(with_transition(actions))
            }
            _ => Err(self.invalid("stop")),
        }
    }

    fn top_up(&mut self, seconds: u32) -> Result<Vec<MeterAction>, MeterError> {
        if seconds == 0 {
            return Err(MeterError::InvalidCommand("top-up requires seconds"));
        }
        match self.record.phase {
            SessionPhase::Running | SessionPhase::Paused => {
                self.record.stored_time_seconds =
                    self.record.stored_time_seconds.saturating_add(seconds);
                info!(
                    "thread {} topped up by {seconds}s to {}s",
                    self.record.thread_id, self.record.stored_time_seconds
                );
                Ok(vec![MeterAction::Persist(SaveReason::Transition)])
            }
            _ => Err(self.invalid("topUp")),
        }
    }

    fn acknowledge_stop(&mut self, thread_id: u32) -> Result<Vec<MeterAction>, MeterError> {
        if !matches!(self.record.phase, SessionPhase::Stopped(_)) {
            return Err(self.invalid("deleteAck"));
        }

        let pending_thread = self
            .record
            .pending_stop
            .map(|pending| pending.thread_id)
            .unwrap_or_default();
        if pending_thread != thread_id {
            return Err(MeterError::StaleCommand {
                active: pending_thread,
                received: thread_id,
            });
        }

        self.record.phase = SessionPhase::Unregistered;
        self.record.is_registered = false;
        self.record.thread_id = 0;
        self.clear_accounting();
        info!("server acknowledged stop of thread {thread_id}");

        Ok(vec![
            MeterAction::Persist(SaveReason::Transition),
            MeterAction::ConfirmDelete { thread_id },
        ])
    }

    /// Charges whole elapsed seconds; the sub-second remainder stays on the
    /// snapshot so frequent ticks never lose time.
    fn settle(&mut self, now: Now) -> Vec<MeterAction> {
        if !self.record.is_counting_down() {
            return Vec::new();
        }

        let elapsed_secs = now.ms.saturating_sub(self.record.last_millis_snapshot) / 1_000;
        if elapsed_secs == 0 {
            return Vec::new();
        }

        let charged = elapsed_secs.min(u64::from(self.record.stored_time_seconds)) as u32;
        self.record.stored_time_seconds -= charged;
        let snapshot_ms = self.record.last_millis_snapshot + elapsed_secs * 1_000;
        self.stamp_snapshot(snapshot_ms, now);

        if self.record.stored_time_seconds == 0 {
            self.expire()
        } else {
            vec![MeterAction::Persist(SaveReason::Periodic)]
        }
    }

    fn expire(&mut self) -> Vec<MeterAction> {
        info!("thread {} expired", self.record.thread_id);
        self.hold_stop(StopReason::Expired);
        vec![
            MeterAction::Persist(SaveReason::Transition),
            MeterAction::ReportStop(StopReason::Expired),
        ]
    }

    fn hold_stop(&mut self, reason: StopReason) {
        self.record.pending_stop = Some(PendingStop {
            thread_id: self.record.thread_id,
            reason,
            stored_time_seconds: self.record.stored_time_seconds,
        });
        self.record.phase = SessionPhase::Stopped(reason);
        self.record.is_paused = false;
        self.record.thread_id = 0;
    }

    fn clear_accounting(&mut self) {
        self.record.stored_time_seconds = 0;
        self.record.is_paused = false;
        self.record.is_free = false;
        self.record.is_open_time = false;
        self.record.start_date_time.clear();
        self.record.pending_stop = None;
        self.record.needs_reconciliation = false;
    }

    fn check_thread(&self, received: u32, command: &'static str) -> Result<(), MeterError> {
        let active = match self.record.phase {
            SessionPhase::Running | SessionPhase::Paused => self.record.thread_id,
            SessionPhase::Stopped(_) => self
                .record
                .pending_stop
                .map(|pending| pending.thread_id)
                .unwrap_or_default(),
            _ => return Err(self.invalid(command)),
        };

        if received != active {
            return Err(MeterError::StaleCommand { active, received });
        }
        Ok(())
    }

    fn invalid(&self, command: &'static str) -> MeterError {
        MeterError::InvalidTransition {
            state: self.state().as_str(),
            command,
        }
    }

    fn stamp_snapshot(&mut self, snapshot_ms: u64, now: Now) {
        self.record.last_millis_snapshot = snapshot_ms;
        self.record.snapshot_epoch_secs = now
            .epoch_secs
            .map(|epoch| epoch - (now.ms.saturating_sub(snapshot_ms) / 1_000) as i64);
    }
}

// A transition write supersedes any periodic write queued by the same call.
fn with_transition(mut actions: Vec<MeterAction>) -> Vec<MeterAction> {
    actions.retain(|action| *action != MeterAction::Persist(SaveReason::Periodic));
    if !actions.contains(&MeterAction::Persist(SaveReason::Transition)) {
        actions.push(MeterAction::Persist(SaveReason::Transition));
    }
    actions
}
