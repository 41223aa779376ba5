use std::fmt::Debug;

use log::{info, warn};

/// The physical actuation point.
pub trait Relay {
    type Error: Debug;

    fn set_energized(&mut self, on: bool) -> Result<(), Self::Error>;
}

/// Writes the derived output level to the relay on every evaluation.
///
/// The driver keeps the last level only for logging; the level itself is
/// recomputed from the engine and safety state each tick.
pub struct OutputDriver<R> {
    relay: R,
    last: Option<bool>,
}

impl<R: Relay> OutputDriver<R> {
    pub fn new(relay: R) -> Self {
        Self { relay, last: None }
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn into_relay(self) -> R {
        self.relay
    }

    pub fn is_on(&self) -> bool {
        self.last.unwrap_or(false)
    }

    pub fn assert(&mut self, on: bool) {
        if let Err(err) = self.relay.set_energized(on) {
            warn!("failed to drive relay {}: {err:?}", if on { "on" } else { "off" });
            return;
        }
        if self.last != Some(on) {
            info!("output {}", if on { "asserted" } else { "deasserted" });
        }
        self.last = Some(on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRelay {
        levels: Vec<bool>,
        broken: bool,
    }

    impl Relay for RecordingRelay {
        type Error = &'static str;

        fn set_energized(&mut self, on: bool) -> Result<(), Self::Error> {
            if self.broken {
                return Err("gpio fault");
            }
            self.levels.push(on);
            Ok(())
        }
    }

    #[test]
    fn writes_level_every_evaluation() {
        let mut driver = OutputDriver::new(RecordingRelay::default());

        driver.assert(true);
        driver.assert(true);
        driver.assert(false);

        assert_eq!(driver.relay().levels, vec![true, true, false]);
        assert!(!driver.is_on());
    }

    #[test]
    fn failed_write_keeps_reported_level() {
        let mut driver = OutputDriver::new(RecordingRelay {
            broken: true,
            ..RecordingRelay::default()
        });

        driver.assert(true);

        assert!(!driver.is_on());
        assert!(driver.into_relay().levels.is_empty());
    }
}
