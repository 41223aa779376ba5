use log::{info, warn};

use crate::{
    clock::Now,
    error::{NodeError, SafetyError},
    meter::{MeterAction, MeterEngine},
};

/// Emergency input and the manual override it latches.
///
/// The latch follows the persisted manual flag, so an emergency survives a
/// reboot until someone clears it with the passkey.
#[derive(Debug, Clone, Default)]
pub struct SafetyMonitor {
    input_asserted: bool,
    latched: bool,
}

impl SafetyMonitor {
    pub fn new(latched: bool) -> Self {
        Self {
            input_asserted: false,
            latched,
        }
    }

    pub fn is_active(&self) -> bool {
        self.latched
    }

    pub fn input_asserted(&self) -> bool {
        self.input_asserted
    }

    /// Samples the emergency input; a rising edge latches manual mode.
    pub fn poll(&mut self, asserted: bool, engine: &mut MeterEngine, now: Now) -> Vec<MeterAction> {
        let rising = asserted && !self.input_asserted;
        self.input_asserted = asserted;

        if rising || (asserted && !self.latched) {
            warn!("emergency input asserted");
            return self.trigger(engine, now);
        }
        Vec::new()
    }

    pub fn trigger(&mut self, engine: &mut MeterEngine, now: Now) -> Vec<MeterAction> {
        self.latched = true;
        engine.enter_manual(now)
    }

    pub fn clear(
        &mut self,
        passkey: &str,
        engine: &mut MeterEngine,
        now: Now,
    ) -> Result<Vec<MeterAction>, NodeError> {
        if !engine.is_manual() {
            return Err(SafetyError::NotInManual.into());
        }
        if self.input_asserted {
            return Err(SafetyError::EmergencyActive.into());
        }
        if engine.record().emergency_passkey.is_empty() {
            warn!("emergency clear attempted before a passkey was provisioned");
            return Err(SafetyError::PasskeyNotConfigured.into());
        }
        if passkey != engine.record().emergency_passkey {
            warn!("emergency clear attempted with wrong passkey");
            return Err(SafetyError::WrongPasskey.into());
        }

        let actions = engine.exit_manual(now)?;
        self.latched = false;
        info!("emergency cleared");
        Ok(actions)
    }
}
