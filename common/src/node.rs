use log::{debug, info, warn};

use crate::{
    api::ServerCommand,
    clock::Now,
    config::RuntimeConfig,
    error::{NodeError, StoreError},
    link::ServerLink,
    meter::{MeterAction, MeterEngine},
    output::{OutputDriver, Relay},
    record::DeviceRecord,
    safety::SafetyMonitor,
    store::{PersistentStore, RecordBackend, SaveReason},
    supervisor::{ConnectivitySupervisor, DeviceIdentity, RestartCause, SupervisorEvent},
    types::NodeStatus,
};

/// Hardware inputs sampled once per loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inputs {
    pub emergency_asserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Restart(RestartCause),
}

/// Requests arriving through the local device API, drained by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRequest {
    Command(ServerCommand),
    Emergency,
    ClearEmergency { passkey: String },
    FactoryReset,
}

/// One device: the single owner of the record and every component that
/// touches it. Platform code calls [`Node::step`] from its control loop.
pub struct Node<B, L, R> {
    engine: MeterEngine,
    store: PersistentStore<B>,
    supervisor: ConnectivitySupervisor,
    safety: SafetyMonitor,
    output: OutputDriver<R>,
    link: L,
    booted_ms: u64,
}

impl<B, L, R> Node<B, L, R>
where
    B: RecordBackend,
    L: ServerLink,
    R: Relay,
{
    /// Loads the record, reconciles downtime and asserts the recovered output.
    pub fn boot(
        config: &RuntimeConfig,
        identity: DeviceIdentity,
        backend: B,
        link: L,
        relay: R,
        now: Now,
    ) -> Self {
        let mut store = PersistentStore::new(backend, config.store.clone());
        let record = match store.load() {
            Ok(record) => record,
            Err(err) => {
                warn!("{err}; falling back to an unregistered record");
                store.factory_reset(now.ms).unwrap_or_else(|err| {
                    warn!("failed to persist fallback record: {err}");
                    DeviceRecord {
                        spiffs_write_interval_seconds: config.store.min_write_interval_seconds,
                        ..DeviceRecord::default()
                    }
                })
            }
        };

        let engine = MeterEngine::new(config.meter.clone(), &config.timezone, record);
        let safety = SafetyMonitor::new(engine.is_manual());
        let mut node = Self {
            engine,
            store,
            supervisor: ConnectivitySupervisor::new(config.supervisor.clone(), identity),
            safety,
            output: OutputDriver::new(relay),
            link,
            booted_ms: now.ms,
        };

        let actions = node.engine.recover(now);
        node.execute(actions, now);
        node.drive_output();
        info!(
            "booted in state {} with {}s stored",
            node.engine.state().as_str(),
            node.engine.record().stored_time_seconds
        );
        node
    }

    /// One control loop iteration: safety, supervisor, engine tick, output.
    pub fn step(&mut self, inputs: Inputs, now: Now) -> StepOutcome {
        let actions = self
            .safety
            .poll(inputs.emergency_asserted, &mut self.engine, now);
        self.execute(actions, now);

        let poll = self.supervisor.poll(&mut self.link, &mut self.engine, now);
        self.execute(poll.actions, now);

        let actions = self.engine.tick(now);
        self.execute(actions, now);

        self.drive_output();

        let restart = poll.events.iter().find_map(|event| match event {
            SupervisorEvent::ConnectivityLost(cause) => Some(*cause),
            _ => None,
        });
        match restart {
            Some(cause) => {
                self.persist(SaveReason::Transition, now);
                StepOutcome::Restart(cause)
            }
            None => StepOutcome::Continue,
        }
    }

    pub fn handle_local(&mut self, request: LocalRequest, now: Now) -> Result<(), NodeError> {
        let actions = match request {
            LocalRequest::Command(command) => self.engine.apply_command(command, now)?,
            LocalRequest::Emergency => self.safety.trigger(&mut self.engine, now),
            LocalRequest::ClearEmergency { passkey } => {
                self.safety.clear(&passkey, &mut self.engine, now)?
            }
            LocalRequest::FactoryReset => {
                let record = self.store.factory_reset(now.ms)?;
                self.engine.reset(record);
                self.safety = SafetyMonitor::default();
                self.supervisor.reset();
                Vec::new()
            }
        };

        self.execute(actions, now);
        self.drive_output();
        Ok(())
    }

    pub fn status(&self, now: Now) -> NodeStatus {
        let record = self.engine.record();
        NodeStatus {
            device_id: record.device_id.clone(),
            state: self.engine.state().as_str(),
            thread_id: record.thread_id,
            stored_time_seconds: record.stored_time_seconds,
            start_date_time: record.start_date_time.clone(),
            is_paused: record.is_paused,
            is_free: record.is_free,
            is_open_time: record.is_open_time,
            is_manual_mode: record.is_manual_mode,
            output_on: self.output.is_on(),
            emergency_active: self.safety.is_active(),
            pending_stop: record.pending_stop,
            needs_reconciliation: record.needs_reconciliation,
            consecutive_failures: self.supervisor.consecutive_failures(),
            write_interval_seconds: record.spiffs_write_interval_seconds,
            uptime_ms: now.ms.saturating_sub(self.booted_ms),
        }
    }

    pub fn engine(&self) -> &MeterEngine {
        &self.engine
    }

    pub fn store(&self) -> &PersistentStore<B> {
        &self.store
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn relay(&self) -> &R {
        self.output.relay()
    }

    /// Hands the peripherals back so the platform can boot a fresh node.
    pub fn into_parts(self) -> (B, L, R) {
        (self.store.into_backend(), self.link, self.output.into_relay())
    }

    fn execute(&mut self, actions: Vec<MeterAction>, now: Now) {
        for action in actions {
            match action {
                MeterAction::Persist(reason) => self.persist(reason, now),
                report => self.supervisor.queue_report(report, self.engine.record()),
            }
        }
    }

    fn persist(&mut self, reason: SaveReason, now: Now) {
        match self.store.save(self.engine.record_mut(), reason, now.ms) {
            Ok(()) => {}
            Err(StoreError::Throttled { retry_in_secs }) => {
                debug!("periodic save deferred {retry_in_secs}s");
            }
            Err(err) => warn!("failed to persist device record: {err}"),
        }
    }

    fn drive_output(&mut self) {
        let on = !self.safety.is_active() && self.engine.output_allowed();
        self.output.assert(on);
        self.engine.set_led(on);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        api::{
            DeleteConfirmation, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
            RegisterResponse, SessionReport, UpdateRequest, UpdateResponse,
        },
        config::MeterConfig,
        error::{LinkError, MeterError, SafetyError},
        record::{self, SessionPhase, StopReason},
        store::MemoryBackend,
        types::MeterState,
    };

    #[derive(Default)]
    struct FakeServer {
        offline: bool,
        commands: VecDeque<ServerCommand>,
        stops: Vec<SessionReport>,
        pauses: Vec<SessionReport>,
        deletes: Vec<DeleteConfirmation>,
    }

    impl FakeServer {
        fn reachable(&self) -> Result<(), LinkError> {
            if self.offline {
                Err(LinkError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    impl ServerLink for FakeServer {
        fn register(&mut self, _: &RegisterRequest) -> Result<RegisterResponse, LinkError> {
            self.reachable()?;
            Ok(RegisterResponse {
                device_id: "00042".to_string(),
                thread_id: 1,
            })
        }

        fn update(&mut self, _: &UpdateRequest) -> Result<UpdateResponse, LinkError> {
            self.reachable()?;
            Ok(UpdateResponse {
                watchdog_interval_minutes: Some(10),
                emergency_passkey: Some("2468".to_string()),
            })
        }

        fn heartbeat(&mut self, _: &HeartbeatRequest) -> Result<HeartbeatResponse, LinkError> {
            self.reachable()?;
            Ok(HeartbeatResponse {
                command: self.commands.pop_front(),
            })
        }

        fn report_pause(&mut self, report: &SessionReport) -> Result<(), LinkError> {
            self.reachable()?;
            self.pauses.push(report.clone());
            Ok(())
        }

        fn report_stop(&mut self, report: &SessionReport) -> Result<(), LinkError> {
            self.reachable()?;
            self.stops.push(report.clone());
            Ok(())
        }

        fn confirm_delete(&mut self, confirmation: &DeleteConfirmation) -> Result<(), LinkError> {
            self.reachable()?;
            self.deletes.push(confirmation.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRelay {
        energized: bool,
        writes: usize,
    }

    impl Relay for FakeRelay {
        type Error = std::convert::Infallible;

        fn set_energized(&mut self, on: bool) -> Result<(), Self::Error> {
            self.energized = on;
            self.writes += 1;
            Ok(())
        }
    }

    type TestNode = Node<MemoryBackend, FakeServer, FakeRelay>;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            meter: MeterConfig {
                grace_period_seconds: 0,
                ..MeterConfig::default()
            },
            ..RuntimeConfig::default()
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            serial_number: "225B0-2-3".to_string(),
            hostname: "lightmaster.local".to_string(),
            firmware_version: "0.1.0".to_string(),
        }
    }

    fn boot(backend: MemoryBackend, server: FakeServer, now: Now) -> TestNode {
        Node::boot(&config(), identity(), backend, server, FakeRelay::default(), now)
    }

    fn run(node: &mut TestNode, from_secs: u64, to_secs: u64) -> Option<RestartCause> {
        for second in from_secs..=to_secs {
            if let StepOutcome::Restart(cause) =
                node.step(Inputs::default(), Now::monotonic(second * 1_000))
            {
                return Some(cause);
            }
        }
        None
    }

    fn start(thread_id: u32, seconds: u32) -> ServerCommand {
        ServerCommand::Start {
            thread_id,
            seconds,
            open_time: false,
            free: false,
        }
    }

    #[test]
    fn session_runs_to_expiry_and_is_acknowledged() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 30));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));

        // register at 0s, update at 10s, heartbeat with start at 20s
        assert_eq!(run(&mut node, 0, 20), None);
        assert_eq!(node.engine().state(), MeterState::Running);
        assert!(node.relay().energized);
        assert!(node.engine().record().is_led_on);

        assert_eq!(run(&mut node, 21, 50), None);
        assert_eq!(
            node.engine().state(),
            MeterState::Stopped(StopReason::Expired)
        );
        assert!(!node.relay().energized);

        // stop report drains on the next due poll
        assert_eq!(run(&mut node, 51, 60), None);
        assert_eq!(node.link().stops.len(), 1);
        assert_eq!(node.link().stops[0].thread_id, 7);

        node.handle_local(
            LocalRequest::Command(ServerCommand::DeleteAck { thread_id: 7 }),
            Now::monotonic(61_000),
        )
        .unwrap();
        assert_eq!(node.engine().state(), MeterState::Unregistered);

        run(&mut node, 62, 62);
        assert_eq!(node.link().deletes.len(), 1);
    }

    #[test]
    fn restart_preserves_accounting() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 600));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));
        run(&mut node, 0, 20);

        let mut server = FakeServer::default();
        server.offline = true;
        let (backend, _, relay) = node.into_parts();
        let mut node = Node::boot(
            &config(),
            identity(),
            backend,
            server,
            relay,
            Now::monotonic(0),
        );
        assert_eq!(node.engine().state(), MeterState::Running);
        assert!(node.engine().record().needs_reconciliation);

        let cause = run(&mut node, 1, 40);

        assert_eq!(cause, Some(RestartCause::DisconnectCount));
        let persisted = record::decode(node.store().backend().bytes.as_deref().unwrap()).unwrap();
        assert_eq!(persisted.stored_time_seconds, node.engine().record().stored_time_seconds);
        assert!(persisted.stored_time_seconds < 600);
    }

    #[test]
    fn corrupt_medium_boots_unregistered_with_output_off() {
        let backend = MemoryBackend {
            bytes: Some(b"not a record".to_vec()),
            ..MemoryBackend::default()
        };
        let node = boot(backend, FakeServer::default(), Now::monotonic(0));

        assert_eq!(node.engine().state(), MeterState::Unregistered);
        assert!(!node.relay().energized);
        assert_eq!(node.relay().writes, 1);
        assert!(node.store().backend().bytes.as_deref().map(record::decode).unwrap().is_ok());
    }

    #[test]
    fn local_emergency_forces_output_off_and_reports_pause() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 120));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));
        run(&mut node, 0, 20);

        node.handle_local(LocalRequest::Emergency, Now::monotonic(20_500))
            .unwrap();
        assert!(!node.relay().energized);
        assert!(node.status(Now::monotonic(20_500)).emergency_active);

        run(&mut node, 21, 35);
        assert_eq!(node.link().pauses.len(), 1);

        assert_eq!(
            node.handle_local(
                LocalRequest::ClearEmergency {
                    passkey: "nope".to_string()
                },
                Now::monotonic(36_000),
            ),
            Err(NodeError::Safety(SafetyError::WrongPasskey))
        );
        node.handle_local(
            LocalRequest::ClearEmergency {
                passkey: "2468".to_string(),
            },
            Now::monotonic(36_000),
        )
        .unwrap();

        assert!(node.relay().energized);
        assert_eq!(node.engine().record().stored_time_seconds, 120);
    }

    #[test]
    fn persisted_manual_mode_boots_latched_with_output_off() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 120));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));
        run(&mut node, 0, 20);
        node.handle_local(LocalRequest::Emergency, Now::monotonic(20_500))
            .unwrap();
        let stored = node.engine().record().stored_time_seconds;

        let (backend, _, _) = node.into_parts();
        let mut node = Node::boot(
            &config(),
            identity(),
            backend,
            FakeServer::default(),
            FakeRelay::default(),
            Now::monotonic(0),
        );

        assert!(node.engine().record().is_manual_mode);
        assert!(node.status(Now::monotonic(0)).emergency_active);
        assert_eq!(node.engine().state(), MeterState::Manual);
        assert!(!node.relay().energized);
        assert_eq!(node.relay().writes, 1);

        run(&mut node, 1, 30);
        assert!(!node.relay().energized);
        assert_eq!(node.engine().record().stored_time_seconds, stored);

        node.handle_local(
            LocalRequest::ClearEmergency {
                passkey: "2468".to_string(),
            },
            Now::monotonic(31_000),
        )
        .unwrap();
        assert!(node.relay().energized);
        assert_eq!(node.engine().state(), MeterState::Running);
    }

    #[test]
    fn emergency_input_is_sampled_before_tick() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 120));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));
        run(&mut node, 0, 20);

        node.step(
            Inputs {
                emergency_asserted: true,
            },
            Now::monotonic(21_000),
        );

        assert_eq!(node.engine().state(), MeterState::Manual);
        assert!(!node.relay().energized);
        assert_eq!(node.engine().record().stored_time_seconds, 119);
    }

    #[test]
    fn stale_local_command_is_rejected() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 120));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));
        run(&mut node, 0, 20);
        let before = node.engine().record().clone();

        let result = node.handle_local(
            LocalRequest::Command(ServerCommand::Stop { thread_id: 8 }),
            Now::monotonic(20_000),
        );

        assert_eq!(
            result,
            Err(NodeError::Meter(MeterError::StaleCommand {
                active: 7,
                received: 8
            }))
        );
        assert_eq!(node.engine().record(), &before);
    }

    #[test]
    fn factory_reset_returns_to_unregistered() {
        let mut server = FakeServer::default();
        server.commands.push_back(start(7, 120));
        let mut node = boot(MemoryBackend::default(), server, Now::monotonic(0));
        run(&mut node, 0, 20);

        node.handle_local(LocalRequest::FactoryReset, Now::monotonic(21_000))
            .unwrap();

        assert_eq!(node.engine().record().phase, SessionPhase::Unregistered);
        assert!(!node.relay().energized);
        let persisted = record::decode(node.store().backend().bytes.as_deref().unwrap()).unwrap();
        assert_eq!(persisted.stored_time_seconds, 0);
    }
}
