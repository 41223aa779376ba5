use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::{
    api::{DeleteConfirmation, HeartbeatRequest, RegisterRequest, SessionReport, UpdateRequest},
    clock::Now,
    config::SupervisorConfig,
    error::LinkError,
    link::ServerLink,
    meter::{MeterAction, MeterEngine},
    record::{DeviceRecord, SessionPhase},
};

const OUTBOX_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    DisconnectCount,
    Watchdog,
}

impl RestartCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DisconnectCount => "disconnect-count",
            Self::Watchdog => "watchdog",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Contacted,
    ContactFailed { consecutive: u32 },
    /// Raised once per boot; the platform restarts the device.
    ConnectivityLost(RestartCause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub hostname: String,
    pub firmware_version: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub events: Vec<SupervisorEvent>,
    pub actions: Vec<MeterAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outbound {
    Pause(SessionReport),
    Stop(SessionReport),
    Delete(DeleteConfirmation),
}

enum Request {
    Register,
    Update,
    Outbound(Outbound),
    Heartbeat,
}

pub struct ConnectivitySupervisor {
    config: SupervisorConfig,
    identity: DeviceIdentity,
    consecutive_failures: u32,
    last_attempt_ms: Option<u64>,
    last_attempt_ok: bool,
    last_contact_ms: Option<u64>,
    metadata_synced: bool,
    outbox: VecDeque<Outbound>,
    lost: Option<RestartCause>,
}

impl ConnectivitySupervisor {
    pub fn new(config: SupervisorConfig, identity: DeviceIdentity) -> Self {
        Self {
            config,
            identity,
            consecutive_failures: 0,
            last_attempt_ms: None,
            last_attempt_ok: false,
            last_contact_ms: None,
            metadata_synced: false,
            outbox: VecDeque::new(),
            lost: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn pending_reports(&self) -> usize {
        self.outbox.len()
    }

    /// Forgets session traffic after the record was wiped.
    pub fn reset(&mut self) {
        self.outbox.clear();
        self.metadata_synced = false;
        self.last_attempt_ms = None;
    }

    /// Queues the server-facing side of an engine action.
    pub fn queue_report(&mut self, action: MeterAction, record: &DeviceRecord) {
        let item = match action {
            MeterAction::ReportPause => Outbound::Pause(SessionReport {
                device_id: record.device_id.clone(),
                thread_id: record.thread_id,
                stored_time_seconds: record.stored_time_seconds,
                reason: None,
            }),
            MeterAction::ReportStop(reason) => {
                let (thread_id, stored_time_seconds) = record
                    .pending_stop
                    .map(|pending| (pending.thread_id, pending.stored_time_seconds))
                    .unwrap_or((record.thread_id, record.stored_time_seconds));
                Outbound::Stop(SessionReport {
                    device_id: record.device_id.clone(),
                    thread_id,
                    stored_time_seconds,
                    reason: Some(reason.as_str()),
                })
            }
            MeterAction::ConfirmDelete { thread_id } => Outbound::Delete(DeleteConfirmation {
                device_id: record.device_id.clone(),
                thread_id,
            }),
            MeterAction::Persist(_) => return,
        };

        if self.outbox.len() >= OUTBOX_CAPACITY {
            if let Some(dropped) = self.outbox.pop_front() {
                warn!("report outbox full, dropping {dropped:?}");
            }
        }
        self.outbox.push_back(item);
    }

    /// Issues at most one server request when one is due, then applies the
    /// restart policy.
    pub fn poll<L: ServerLink>(
        &mut self,
        link: &mut L,
        engine: &mut MeterEngine,
        now: Now,
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let mut contacted_ms = *self.last_contact_ms.get_or_insert(now.ms);

        if self.is_due(now.ms) {
            self.last_attempt_ms = Some(now.ms);
            let request = self.next_request(engine);
            match self.perform(link, engine, request, now, &mut outcome.actions) {
                Ok(()) => {
                    if self.consecutive_failures > 0 {
                        info!(
                            "server reachable again after {} failed attempts",
                            self.consecutive_failures
                        );
                    }
                    self.consecutive_failures = 0;
                    self.last_attempt_ok = true;
                    self.last_contact_ms = Some(now.ms);
                    contacted_ms = now.ms;
                    outcome.events.push(SupervisorEvent::Contacted);
                }
                Err(err) => {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    self.last_attempt_ok = false;
                    warn!(
                        "server request failed ({} consecutive): {err}",
                        self.consecutive_failures
                    );
                    outcome.events.push(SupervisorEvent::ContactFailed {
                        consecutive: self.consecutive_failures,
                    });
                }
            }
        }

        if self.lost.is_none() {
            let watchdog_ms = u64::from(self.watchdog_minutes(engine.record())) * 60_000;
            let silent_ms = now.ms.saturating_sub(contacted_ms);

            let cause = if self.consecutive_failures >= self.config.max_disconnect_counts {
                Some(RestartCause::DisconnectCount)
            } else if watchdog_ms > 0 && silent_ms >= watchdog_ms {
                Some(RestartCause::Watchdog)
            } else {
                None
            };

            if let Some(cause) = cause {
                warn!(
                    "connectivity lost ({}), {} failures, {}s since last contact",
                    cause.as_str(),
                    self.consecutive_failures,
                    silent_ms / 1_000
                );
                self.lost = Some(cause);
                outcome.events.push(SupervisorEvent::ConnectivityLost(cause));
            }
        }

        outcome
    }

    fn is_due(&self, now_ms: u64) -> bool {
        match self.last_attempt_ms {
            None => true,
            Some(_) if self.last_attempt_ok && !self.outbox.is_empty() => true,
            Some(last) => now_ms.saturating_sub(last) >= self.config.heartbeat_interval_ms,
        }
    }

    // Queued reports go first so a delete confirmation reaches the server
    // before the device registers again.
    fn next_request(&mut self, engine: &MeterEngine) -> Request {
        if let Some(item) = self.outbox.pop_front() {
            return Request::Outbound(item);
        }
        if engine.record().phase == SessionPhase::Unregistered {
            return Request::Register;
        }
        if !self.metadata_synced {
            return Request::Update;
        }
        Request::Heartbeat
    }

    fn perform<L: ServerLink>(
        &mut self,
        link: &mut L,
        engine: &mut MeterEngine,
        request: Request,
        now: Now,
        actions: &mut Vec<MeterAction>,
    ) -> Result<(), LinkError> {
        match request {
            Request::Register => {
                let response = link.register(&RegisterRequest {
                    serial_number: self.identity.serial_number.clone(),
                    hostname: self.identity.hostname.clone(),
                    firmware_version: self.identity.firmware_version.clone(),
                })?;
                let registered = engine
                    .register(&response.device_id, response.thread_id, now)
                    .map_err(|err| LinkError::Decode(err.to_string()))?;
                self.metadata_synced = false;
                actions.extend(registered);
            }
            Request::Update => {
                let record = engine.record();
                let response = link.update(&UpdateRequest {
                    device_id: record.device_id.clone(),
                    serial_number: self.identity.serial_number.clone(),
                    hostname: self.identity.hostname.clone(),
                    firmware_version: self.identity.firmware_version.clone(),
                })?;
                actions.extend(engine.apply_metadata(
                    response.watchdog_interval_minutes,
                    response.emergency_passkey.as_deref(),
                ));
                self.metadata_synced = true;
            }
            Request::Outbound(Outbound::Pause(report)) => link.report_pause(&report)?,
            Request::Outbound(Outbound::Stop(report)) => link.report_stop(&report)?,
            Request::Outbound(Outbound::Delete(confirmation)) => {
                link.confirm_delete(&confirmation)?
            }
            Request::Heartbeat => {
                let request = heartbeat_request(engine);
                let response = link.heartbeat(&request)?;
                engine.take_rejection();
                if request.needs_reconciliation {
                    actions.extend(engine.mark_reconciled());
                }
                if let Some(command) = response.command {
                    debug!(
                        "heartbeat delivered {} for thread {}",
                        command.name(),
                        command.thread_id()
                    );
                    // Rejections are kept by the engine and reported next heartbeat.
                    if let Ok(applied) = engine.apply_command(command, now) {
                        actions.extend(applied);
                    }
                }
            }
        }
        Ok(())
    }

    fn watchdog_minutes(&self, record: &DeviceRecord) -> u32 {
        if record.watchdog_interval_minutes == 0 {
            self.config.default_watchdog_minutes
        } else {
            record.watchdog_interval_minutes
        }
    }
}

fn heartbeat_request(engine: &MeterEngine) -> HeartbeatRequest {
    let record = engine.record();
    HeartbeatRequest {
        device_id: record.device_id.clone(),
        thread_id: record.thread_id,
        state: engine.state().as_str(),
        stored_time_seconds: record.stored_time_seconds,
        is_paused: record.is_paused,
        is_free: record.is_free,
        is_open_time: record.is_open_time,
        is_manual_mode: record.is_manual_mode,
        pending_stop: record.pending_stop,
        needs_reconciliation: record.needs_reconciliation,
        last_rejection: engine.last_rejection().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        api::{HeartbeatResponse, RegisterResponse, ServerCommand, UpdateResponse},
        config::MeterConfig,
        record::StopReason,
        store::SaveReason,
        types::MeterState,
    };

    #[derive(Default)]
    struct ScriptedLink {
        offline: bool,
        commands: VecDeque<ServerCommand>,
        calls: Vec<&'static str>,
        heartbeats: Vec<HeartbeatRequest>,
        stops: Vec<SessionReport>,
    }

    impl ScriptedLink {
        fn attempt(&mut self, call: &'static str) -> Result<(), LinkError> {
            self.calls.push(call);
            if self.offline {
                Err(LinkError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    impl ServerLink for ScriptedLink {
        fn register(&mut self, _: &RegisterRequest) -> Result<RegisterResponse, LinkError> {
            self.attempt("register")?;
            Ok(RegisterResponse {
                device_id: "00042".to_string(),
                thread_id: 1,
            })
        }

        fn update(&mut self, _: &UpdateRequest) -> Result<UpdateResponse, LinkError> {
            self.attempt("update")?;
            Ok(UpdateResponse {
                watchdog_interval_minutes: Some(2),
                emergency_passkey: Some("1357".to_string()),
            })
        }

        fn heartbeat(&mut self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, LinkError> {
            self.attempt("heartbeat")?;
            self.heartbeats.push(request.clone());
            Ok(HeartbeatResponse {
                command: self.commands.pop_front(),
            })
        }

        fn report_pause(&mut self, _: &SessionReport) -> Result<(), LinkError> {
            self.attempt("pause")
        }

        fn report_stop(&mut self, report: &SessionReport) -> Result<(), LinkError> {
            self.attempt("stop")?;
            self.stops.push(report.clone());
            Ok(())
        }

        fn confirm_delete(&mut self, _: &DeleteConfirmation) -> Result<(), LinkError> {
            self.attempt("delete")
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            serial_number: "225B0-2-3".to_string(),
            hostname: "lightmaster.local".to_string(),
            firmware_version: "0.1.0".to_string(),
        }
    }

    fn supervisor(config: SupervisorConfig) -> ConnectivitySupervisor {
        ConnectivitySupervisor::new(config, identity())
    }

    fn engine() -> MeterEngine {
        let config = MeterConfig {
            grace_period_seconds: 0,
            ..MeterConfig::default()
        };
        MeterEngine::new(config, "UTC", DeviceRecord::default())
    }

    fn poll_at(
        supervisor: &mut ConnectivitySupervisor,
        link: &mut ScriptedLink,
        engine: &mut MeterEngine,
        secs: u64,
    ) -> PollOutcome {
        supervisor.poll(link, engine, Now::monotonic(secs * 1_000))
    }

    fn lost_events(events: &[SupervisorEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, SupervisorEvent::ConnectivityLost(_)))
            .count()
    }

    #[test]
    fn registers_then_syncs_metadata_then_heartbeats() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink::default();
        let mut engine = engine();

        let outcome = poll_at(&mut supervisor, &mut link, &mut engine, 0);
        assert_eq!(
            outcome.actions,
            vec![MeterAction::Persist(SaveReason::Transition)]
        );
        assert_eq!(engine.state(), MeterState::Idle);

        poll_at(&mut supervisor, &mut link, &mut engine, 10);
        poll_at(&mut supervisor, &mut link, &mut engine, 20);

        assert_eq!(link.calls, vec!["register", "update", "heartbeat"]);
        assert_eq!(engine.record().watchdog_interval_minutes, 2);
        assert_eq!(engine.record().emergency_passkey, "1357");
    }

    #[test]
    fn requests_wait_for_heartbeat_interval() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink::default();
        let mut engine = engine();

        poll_at(&mut supervisor, &mut link, &mut engine, 0);
        poll_at(&mut supervisor, &mut link, &mut engine, 4);
        poll_at(&mut supervisor, &mut link, &mut engine, 9);

        assert_eq!(link.calls, vec!["register"]);
    }

    #[test]
    fn four_consecutive_failures_raise_exactly_one_restart() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink {
            offline: true,
            ..ScriptedLink::default()
        };
        let mut engine = engine();

        let mut events = Vec::new();
        for poll in 0..10 {
            events.extend(poll_at(&mut supervisor, &mut link, &mut engine, poll * 10).events);
        }

        assert_eq!(lost_events(&events), 1);
        assert!(events.contains(&SupervisorEvent::ConnectivityLost(
            RestartCause::DisconnectCount
        )));
        assert_eq!(
            events
                .iter()
                .position(|event| matches!(event, SupervisorEvent::ConnectivityLost(_))),
            Some(4)
        );
    }

    #[test]
    fn success_resets_failure_count() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink::default();
        let mut engine = engine();
        let mut events = Vec::new();

        for poll in 0..12 {
            link.offline = poll % 4 != 3;
            events.extend(poll_at(&mut supervisor, &mut link, &mut engine, poll * 10).events);
        }

        assert_eq!(lost_events(&events), 0);
        assert!(events.contains(&SupervisorEvent::ContactFailed { consecutive: 3 }));
    }

    #[test]
    fn watchdog_fires_without_contact() {
        let config = SupervisorConfig {
            max_disconnect_counts: 1_000,
            ..SupervisorConfig::default()
        };
        let mut supervisor = supervisor(config);
        let mut link = ScriptedLink {
            offline: true,
            ..ScriptedLink::default()
        };
        let mut engine = engine();
        let mut events = Vec::new();

        for poll in 0..=15 {
            events.extend(poll_at(&mut supervisor, &mut link, &mut engine, poll * 60).events);
        }

        assert_eq!(lost_events(&events), 1);
        assert!(events.contains(&SupervisorEvent::ConnectivityLost(RestartCause::Watchdog)));
    }

    #[test]
    fn heartbeat_command_drives_engine() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink::default();
        let mut engine = engine();
        link.commands.push_back(ServerCommand::Start {
            thread_id: 7,
            seconds: 600,
            open_time: false,
            free: false,
        });

        for poll in 0..3 {
            poll_at(&mut supervisor, &mut link, &mut engine, poll * 10);
        }

        assert_eq!(engine.state(), MeterState::Running);
        assert_eq!(engine.record().thread_id, 7);
        assert_eq!(engine.record().stored_time_seconds, 600);
    }

    #[test]
    fn rejection_is_reported_on_next_heartbeat() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink::default();
        let mut engine = engine();
        link.commands.push_back(ServerCommand::Pause { thread_id: 9 });

        for poll in 0..4 {
            poll_at(&mut supervisor, &mut link, &mut engine, poll * 10);
        }

        assert_eq!(link.heartbeats.len(), 2);
        assert!(link.heartbeats[0].last_rejection.is_none());
        assert!(link.heartbeats[1]
            .last_rejection
            .as_deref()
            .unwrap()
            .starts_with("pause"));
        assert!(engine.last_rejection().is_none());
    }

    #[test]
    fn queued_stop_report_precedes_heartbeat() {
        let mut supervisor = supervisor(SupervisorConfig::default());
        let mut link = ScriptedLink::default();
        let mut engine = engine();
        link.commands.push_back(ServerCommand::Start {
            thread_id: 7,
            seconds: 5,
            open_time: false,
            free: false,
        });
        for poll in 0..3 {
            poll_at(&mut supervisor, &mut link, &mut engine, poll * 10);
        }

        let actions = engine.tick(Now::monotonic(26_000));
        assert!(actions.contains(&MeterAction::ReportStop(StopReason::Expired)));
        for action in actions {
            supervisor.queue_report(action, engine.record());
        }
        assert_eq!(supervisor.pending_reports(), 1);

        poll_at(&mut supervisor, &mut link, &mut engine, 30);

        assert_eq!(link.calls.last(), Some(&"stop"));
        assert_eq!(link.stops[0].thread_id, 7);
        assert_eq!(link.stops[0].reason, Some("EXPIRED"));
        assert_eq!(supervisor.pending_reports(), 0);
    }
}
